use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Arms a one-shot deletion of `path` after `delay`. Returns immediately;
/// the timer fires irrespective of whether the file was ever downloaded.
/// A file already gone by then is a no-op. Deletion failures are logged and
/// swallowed, never surfaced to a request in flight.
pub fn schedule_delete(path: PathBuf, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "reaped expired artifact"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %path.display(), "could not reap artifact: {error}");
            }
        }
    })
}
