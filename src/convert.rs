use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::ConvertError;
use crate::fetcher::{FetchError, MediaFetcher, MediaMetadata, TransportOptions};
use crate::reaper;
use crate::retry::RetryPolicy;
use crate::validate::ConversionRequest;

pub const MAX_FILENAME_CHARS: usize = 128;

/// Best-effort transient-failure detection by substring match on the
/// downloader's error text. Inherently fragile; kept pluggable so a
/// structured error kind can replace it if the collaborator grows one.
pub type TransientClassifier = fn(&FetchError) -> bool;

pub fn default_transient_classifier(error: &FetchError) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("bot")
        || message.contains("429")
        || message.contains("rate limit")
        || message.contains("too many requests")
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ConversionResult {
    pub title: String,
    pub duration_seconds: u64,
    /// `null` when the source does not report a size estimate.
    pub estimated_size_mb: Option<f64>,
    pub download_url: String,
}

/// Drives one conversion end to end: metadata probe, duration ceiling,
/// filename derivation, fetch+transcode under retry, reaper scheduling.
/// The actual media work is fully delegated to the `MediaFetcher`.
pub struct Orchestrator {
    fetcher: Arc<dyn MediaFetcher>,
    retry: RetryPolicy,
    classify_transient: TransientClassifier,
    download_dir: PathBuf,
    max_duration_seconds: u64,
    retention: Duration,
    user_agents: Vec<String>,
    proxies: Vec<String>,
    cookies_file: Option<PathBuf>,
    socket_timeout_seconds: u64,
    /// Round-robin cursor over the user-agent and proxy lists.
    rotation: AtomicUsize,
    /// Randomized pause between metadata probe and fetch, to reduce request
    /// burstiness. Pacing policy, not a correctness requirement.
    pacing_millis: std::ops::RangeInclusive<u64>,
}

impl Orchestrator {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, config: &AppConfig) -> Self {
        Self {
            fetcher,
            retry: RetryPolicy::new(
                config.retry_max_attempts,
                Duration::from_secs(config.retry_base_delay_seconds),
            ),
            classify_transient: default_transient_classifier,
            download_dir: config.download_dir.clone(),
            max_duration_seconds: config.max_duration_seconds,
            retention: Duration::from_secs(config.retention_seconds),
            user_agents: config.user_agents.clone(),
            proxies: config.proxies.clone(),
            cookies_file: config.cookies_file.clone(),
            socket_timeout_seconds: config.socket_timeout_seconds,
            rotation: AtomicUsize::new(0),
            pacing_millis: 1_000..=3_000,
        }
    }

    #[cfg(test)]
    fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classify_transient = classifier;
        self
    }

    pub async fn convert(&self, request: ConversionRequest) -> Result<ConversionResult, ConvertError> {
        let transport = self.next_transport();
        debug!(url = %request.url, user_agent = ?transport.user_agent, proxy = ?transport.proxy,
            "probing metadata");

        let metadata = self
            .retry
            .run(
                |_attempt| {
                    let fetcher = Arc::clone(&self.fetcher);
                    let url = request.url.clone();
                    let transport = transport.clone();
                    async move { fetcher.metadata(&url, &transport).await }
                },
                |error| (self.classify_transient)(error),
            )
            .await
            .map_err(|error| self.exhausted(error))?;

        if metadata.duration_seconds > self.max_duration_seconds {
            return Err(ConvertError::DurationExceeded {
                limit_minutes: self.max_duration_seconds / 60,
            });
        }

        let filename = artifact_filename(&metadata.title, request.format.extension());
        let output_path = self.download_dir.join(&filename);

        self.pacing_pause().await;

        let fetch_result = self
            .retry
            .run(
                |attempt| {
                    let fetcher = Arc::clone(&self.fetcher);
                    let url = request.url.clone();
                    let format = request.format;
                    let output_path = output_path.clone();
                    let transport = transport.clone();
                    async move {
                        debug!(attempt, path = %output_path.display(), "fetching media");
                        fetcher.fetch(&url, format, &output_path, &transport).await
                    }
                },
                // Any fetch failure is retried until the attempt ceiling;
                // classification only decides how exhaustion is surfaced.
                |_error| true,
            )
            .await;

        if let Err(error) = fetch_result {
            return Err(self.exhausted(error));
        }

        let _ = reaper::schedule_delete(output_path, self.retention);

        let result = build_result(&metadata, &filename);
        info!(title = %result.title, download_url = %result.download_url, "conversion complete");
        Ok(result)
    }

    /// Deterministic artifact path for a given title and format. Exposed so
    /// the download surface and tests agree on the key.
    pub fn artifact_path(&self, title: &str, extension: &str) -> PathBuf {
        self.download_dir.join(artifact_filename(title, extension))
    }

    fn next_transport(&self) -> TransportOptions {
        let cursor = self.rotation.fetch_add(1, Ordering::Relaxed);
        TransportOptions {
            user_agent: pick(&self.user_agents, cursor),
            proxy: pick(&self.proxies, cursor),
            cookies_file: self.cookies_file.clone(),
            socket_timeout_seconds: self.socket_timeout_seconds,
        }
    }

    async fn pacing_pause(&self) {
        let millis = rand::thread_rng().gen_range(self.pacing_millis.clone());
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Maps a post-retry failure into the surfaced taxonomy.
    fn exhausted(&self, error: FetchError) -> ConvertError {
        if (self.classify_transient)(&error) {
            return ConvertError::RateLimited(error.to_string());
        }
        match error {
            FetchError::MissingBinary { .. } | FetchError::Io(_) => {
                ConvertError::Internal(error.to_string())
            }
            other => ConvertError::FetchFailed(other.to_string()),
        }
    }
}

fn pick(values: &[String], cursor: usize) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(values[cursor % values.len()].clone())
    }
}

/// Filesystem-safe filename: the characters `\ / * ? : " < > |` each become
/// `_`, then the title is truncated to 128 characters. Deterministic, so the
/// same title always maps to the same artifact (collisions overwrite).
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .take(MAX_FILENAME_CHARS)
        .collect()
}

fn artifact_filename(title: &str, extension: &str) -> String {
    format!("{}.{extension}", sanitize_title(title))
}

fn build_result(metadata: &MediaMetadata, filename: &str) -> ConversionResult {
    let estimated_size_mb = metadata
        .estimated_size_bytes
        .map(|bytes| (bytes as f64 / 1_048_576.0 * 100.0).round() / 100.0);

    ConversionResult {
        title: metadata.title.clone(),
        duration_seconds: metadata.duration_seconds,
        estimated_size_mb,
        download_url: format!("/download/{}", urlencoding::encode(filename)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::MediaFormat;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::time::Instant;

    fn test_metadata(duration_seconds: u64) -> MediaMetadata {
        MediaMetadata {
            title: "Test Clip".to_string(),
            duration_seconds,
            estimated_size_bytes: Some(4 * 1_048_576),
        }
    }

    /// Fetcher scripted to fail the first `fail_fetches` fetch calls with a
    /// fixed error message, then succeed.
    struct ScriptedFetcher {
        metadata: MediaMetadata,
        fail_fetches: usize,
        fetch_error: String,
        fetch_calls: AtomicUsize,
        metadata_calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(metadata: MediaMetadata, fail_fetches: usize, fetch_error: &str) -> Self {
            Self {
                metadata,
                fail_fetches,
                fetch_error: fetch_error.to_string(),
                fetch_calls: AtomicUsize::new(0),
                metadata_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for ScriptedFetcher {
        async fn metadata(
            &self,
            _url: &str,
            _transport: &TransportOptions,
        ) -> Result<MediaMetadata, FetchError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.metadata.clone())
        }

        async fn fetch(
            &self,
            _url: &str,
            _format: MediaFormat,
            _output_path: &Path,
            _transport: &TransportOptions,
        ) -> Result<(), FetchError> {
            let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_fetches {
                Err(FetchError::Tool(self.fetch_error.clone()))
            } else {
                Ok(())
            }
        }
    }

    fn test_config(dir: &Path) -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            download_dir: dir.to_path_buf(),
            max_duration_seconds: 9_000,
            retention_seconds: 600,
            retry_max_attempts: 3,
            retry_base_delay_seconds: 5,
            fetch_timeout_seconds: 900,
            socket_timeout_seconds: 30,
            user_agents: vec!["agent-a".to_string(), "agent-b".to_string()],
            proxies: Vec::new(),
            cookies_file: None,
            quota_per_minute: 3,
            quota_per_hour: 30,
        }
    }

    fn request(format: MediaFormat) -> ConversionRequest {
        ConversionRequest {
            url: "https://youtu.be/abc".to_string(),
            format,
            user_id: None,
        }
    }

    #[test]
    fn sanitization_strips_every_forbidden_character() {
        let sanitized = sanitize_title(r#"a\b/c*d?e:f"g<h>i|j"#);
        for forbidden in ['\\', '/', '*', '?', ':', '"', '<', '>', '|'] {
            assert!(!sanitized.contains(forbidden));
        }
        assert_eq!(sanitized, "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn sanitization_bounds_the_filename_length() {
        let long_title = "x".repeat(500);
        assert_eq!(sanitize_title(&long_title).chars().count(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn sanitization_is_deterministic() {
        let title = "My Song: Live / Remastered?";
        assert_eq!(sanitize_title(title), sanitize_title(title));
    }

    #[test]
    fn classifier_spots_rate_limit_and_bot_signatures() {
        let rate_limited = FetchError::Tool("ERROR: HTTP Error 429: Too Many Requests".to_string());
        let bot = FetchError::Tool("Sign in to confirm you're not a bot".to_string());
        let plain = FetchError::Tool("Video unavailable".to_string());
        assert!(default_transient_classifier(&rate_limited));
        assert!(default_transient_classifier(&bot));
        assert!(!default_transient_classifier(&plain));
    }

    #[tokio::test(start_paused = true)]
    async fn duration_over_the_ceiling_never_reaches_the_fetch_step() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(test_metadata(9_001), 0, ""));
        let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn MediaFetcher>, &test_config(dir.path()));

        let error = orchestrator.convert(request(MediaFormat::Mp3)).await.unwrap_err();
        assert!(matches!(error, ConvertError::DurationExceeded { .. }));
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(
            test_metadata(240),
            2,
            "ERROR: HTTP Error 429: Too Many Requests",
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn MediaFetcher>, &test_config(dir.path()));

        let started = Instant::now();
        let result = orchestrator.convert(request(MediaFormat::Mp3)).await.unwrap();

        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 3);
        // Backoff alone accounts for 5s + 10s before the third attempt.
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(result.download_url, "/download/Test%20Clip.mp3");
        assert_eq!(result.estimated_size_mb, Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failures_surface_as_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(
            test_metadata(240),
            usize::MAX,
            "Sign in to confirm you're not a bot",
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn MediaFetcher>, &test_config(dir.path()));

        let error = orchestrator.convert(request(MediaFormat::Mp3)).await.unwrap_err();
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 3);
        match error {
            ConvertError::RateLimited(summary) => assert!(summary.contains("bot")),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_plain_failures_surface_as_fetch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(
            test_metadata(240),
            usize::MAX,
            "ERROR: Video unavailable",
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn MediaFetcher>, &test_config(dir.path()));

        let error = orchestrator.convert(request(MediaFormat::Mp4)).await.unwrap_err();
        assert!(matches!(error, ConvertError::FetchFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn a_custom_classifier_replaces_the_substring_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(
            test_metadata(240),
            usize::MAX,
            "throttled by upstream",
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn MediaFetcher>, &test_config(dir.path()))
            .with_classifier(|error| error.to_string().contains("throttled"));

        let error = orchestrator.convert(request(MediaFormat::Mp3)).await.unwrap_err();
        assert!(matches!(error, ConvertError::RateLimited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_titles_map_to_the_identical_artifact_path() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(test_metadata(240), 0, ""));
        let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn MediaFetcher>, &test_config(dir.path()));

        let first = orchestrator.artifact_path("My Song: Live", "mp3");
        let second = orchestrator.artifact_path("My Song: Live", "mp3");
        assert_eq!(first, second);

        // Two conversions of the same title point at the same download URL.
        let a = orchestrator.convert(request(MediaFormat::Mp3)).await.unwrap();
        let b = orchestrator.convert(request(MediaFormat::Mp3)).await.unwrap();
        assert_eq!(a.download_url, b.download_url);
    }
}
