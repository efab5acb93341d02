use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::validate::MediaFormat;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The downloader ran and reported a failure. Carries the last
    /// meaningful stderr line.
    #[error("{0}")]
    Tool(String),
    #[error("media operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{tool} is not installed or not on PATH.")]
    MissingBinary { tool: &'static str },
    #[error("could not parse downloader metadata output: {0}")]
    Metadata(String),
    #[error("i/o error while fetching media: {0}")]
    Io(#[from] std::io::Error),
}

/// Request-scoped transport knobs forwarded opaquely to the downloader.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub socket_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaMetadata {
    pub title: String,
    pub duration_seconds: u64,
    pub estimated_size_bytes: Option<u64>,
}

/// External collaborator that does the real work: metadata extraction and
/// fetch+transcode. Everything behind this trait is out of scope for the
/// orchestrator; it never interprets codec internals.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn metadata(
        &self,
        url: &str,
        transport: &TransportOptions,
    ) -> Result<MediaMetadata, FetchError>;

    /// Fetches the media and transcodes it into `output_path`. May block for
    /// the full duration of the transfer and transcode.
    async fn fetch(
        &self,
        url: &str,
        format: MediaFormat,
        output_path: &Path,
        transport: &TransportOptions,
    ) -> Result<(), FetchError>;
}

/// `MediaFetcher` backed by the yt-dlp binary (which in turn drives ffmpeg
/// for transcoding).
pub struct YtDlpFetcher {
    invocation_timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(invocation_timeout: Duration) -> Self {
        Self { invocation_timeout }
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, FetchError> {
        debug!(?args, "invoking yt-dlp");
        let command_future = Command::new("yt-dlp").args(args).output();
        let output = timeout(self.invocation_timeout, command_future)
            .await
            .map_err(|_| FetchError::Timeout(self.invocation_timeout))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    FetchError::MissingBinary { tool: "yt-dlp" }
                } else {
                    FetchError::Io(error)
                }
            })?;

        if !output.status.success() {
            return Err(FetchError::Tool(last_stderr_line(&output.stderr)));
        }

        Ok(output)
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn transport_args(transport: &TransportOptions) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(user_agent) = &transport.user_agent {
        args.push("--user-agent".to_string());
        args.push(user_agent.clone());
    }
    if let Some(proxy) = &transport.proxy {
        args.push("--proxy".to_string());
        args.push(proxy.clone());
    }
    if let Some(cookies) = &transport.cookies_file {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    if transport.socket_timeout_seconds > 0 {
        args.push("--socket-timeout".to_string());
        args.push(transport.socket_timeout_seconds.to_string());
    }
    args
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    #[serde(default)]
    requested_downloads: Vec<RawRequestedDownload>,
}

#[derive(Debug, Deserialize)]
struct RawRequestedDownload {
    filesize_approx: Option<f64>,
}

impl RawInfo {
    fn into_metadata(self) -> MediaMetadata {
        let estimated_size_bytes = self
            .filesize
            .or(self.filesize_approx)
            .or_else(|| {
                self.requested_downloads
                    .first()
                    .and_then(|download| download.filesize_approx)
            })
            .filter(|bytes| *bytes > 0.0)
            .map(|bytes| bytes as u64);

        MediaMetadata {
            title: self
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "media".to_string()),
            duration_seconds: self.duration.filter(|d| *d > 0.0).map_or(0, |d| d as u64),
            estimated_size_bytes,
        }
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn metadata(
        &self,
        url: &str,
        transport: &TransportOptions,
    ) -> Result<MediaMetadata, FetchError> {
        let mut args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(transport_args(transport));
        args.push(url.to_string());

        let output = self.run(args).await?;
        let info: RawInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| FetchError::Metadata(error.to_string()))?;
        Ok(info.into_metadata())
    }

    async fn fetch(
        &self,
        url: &str,
        format: MediaFormat,
        output_path: &Path,
        transport: &TransportOptions,
    ) -> Result<(), FetchError> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-part".to_string(),
        ];

        match format {
            MediaFormat::Mp3 => {
                args.push("-f".to_string());
                args.push("bestaudio/best".to_string());
                args.push("-x".to_string());
                args.push("--audio-format".to_string());
                args.push("mp3".to_string());
                args.push("--audio-quality".to_string());
                args.push("192K".to_string());
            }
            MediaFormat::Mp4 => {
                args.push("-f".to_string());
                args.push("bestvideo[height<=1080]+bestaudio/best".to_string());
                args.push("--merge-output-format".to_string());
                args.push("mp4".to_string());
            }
        }

        args.push("-o".to_string());
        args.push(output_path.to_string_lossy().into_owned());
        args.extend(transport_args(transport));
        args.push(url.to_string());

        self.run(args).await?;
        Ok(())
    }
}

/// Startup precondition: the external transcoder must be present, otherwise
/// the process refuses to serve traffic.
pub async fn check_ffmpeg() -> Result<(), FetchError> {
    let status = Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                FetchError::MissingBinary { tool: "ffmpeg" }
            } else {
                FetchError::Io(error)
            }
        })?;

    if !status.success() {
        return Err(FetchError::Tool(
            "ffmpeg -version exited with a failure status".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_falls_back_through_filesize_fields() {
        let info: RawInfo = serde_json::from_str(
            r#"{"title": "A Song", "duration": 240.8,
                "requested_downloads": [{"filesize_approx": 3145728.0}]}"#,
        )
        .unwrap();
        let metadata = info.into_metadata();
        assert_eq!(metadata.title, "A Song");
        assert_eq!(metadata.duration_seconds, 240);
        assert_eq!(metadata.estimated_size_bytes, Some(3_145_728));
    }

    #[test]
    fn metadata_defaults_when_fields_are_missing() {
        let info: RawInfo = serde_json::from_str("{}").unwrap();
        let metadata = info.into_metadata();
        assert_eq!(metadata.title, "media");
        assert_eq!(metadata.duration_seconds, 0);
        assert_eq!(metadata.estimated_size_bytes, None);
    }

    #[test]
    fn last_stderr_line_picks_the_final_nonempty_line() {
        let stderr = b"WARNING: something\n\nERROR: HTTP Error 429: Too Many Requests\n";
        assert_eq!(
            last_stderr_line(stderr),
            "ERROR: HTTP Error 429: Too Many Requests"
        );
    }

    #[test]
    fn transport_args_include_configured_knobs() {
        let transport = TransportOptions {
            user_agent: Some("TestAgent/1.0".to_string()),
            proxy: Some("socks5://127.0.0.1:9050".to_string()),
            cookies_file: Some(PathBuf::from("/tmp/cookies.txt")),
            socket_timeout_seconds: 30,
        };
        let args = transport_args(&transport);
        assert_eq!(
            args,
            vec![
                "--user-agent",
                "TestAgent/1.0",
                "--proxy",
                "socks5://127.0.0.1:9050",
                "--cookies",
                "/tmp/cookies.txt",
                "--socket-timeout",
                "30",
            ]
        );
    }
}
