use std::path::PathBuf;

/// Everything tunable about the service, resolved once at startup from the
/// environment and passed explicitly into the components that need it. No
/// process-wide mutable state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    /// Hard business ceiling on source duration (150 minutes by default).
    pub max_duration_seconds: u64,
    /// How long an artifact survives after a successful conversion.
    pub retention_seconds: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_seconds: u64,
    /// Wall-clock ceiling for a single yt-dlp invocation.
    pub fetch_timeout_seconds: u64,
    /// Socket timeout forwarded to yt-dlp.
    pub socket_timeout_seconds: u64,
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub cookies_file: Option<PathBuf>,
    pub quota_per_minute: usize,
    pub quota_per_hour: usize,
}

const DEFAULT_MAX_DURATION_SECONDS: u64 = 150 * 60;
const DEFAULT_RETENTION_SECONDS: u64 = 600;
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_DELAY_SECONDS: u64 = 5;
const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 900;
const DEFAULT_SOCKET_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_QUOTA_PER_MINUTE: usize = 3;
const DEFAULT_QUOTA_PER_HOUR: usize = 30;

const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
];

impl AppConfig {
    pub fn from_env() -> Self {
        let user_agents = read_list_env("USER_AGENTS").unwrap_or_else(|| {
            DEFAULT_USER_AGENTS.iter().map(ToString::to_string).collect()
        });

        Self {
            bind_addr: resolve_bind_addr(),
            download_dir: std::env::var("DOWNLOAD_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            max_duration_seconds: read_u64_env("MAX_DURATION_SECONDS")
                .unwrap_or(DEFAULT_MAX_DURATION_SECONDS),
            retention_seconds: read_u64_env("ARTIFACT_RETENTION_SECONDS")
                .unwrap_or(DEFAULT_RETENTION_SECONDS),
            retry_max_attempts: read_usize_env("RETRY_MAX_ATTEMPTS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_base_delay_seconds: read_u64_env("RETRY_BASE_DELAY_SECONDS")
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_SECONDS),
            fetch_timeout_seconds: read_u64_env("FETCH_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECONDS),
            socket_timeout_seconds: read_u64_env("SOCKET_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT_SECONDS),
            user_agents,
            proxies: read_list_env("PROXIES").unwrap_or_default(),
            cookies_file: std::env::var("COOKIES_FILE")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from)),
            quota_per_minute: read_usize_env("QUOTA_PER_MINUTE").unwrap_or(DEFAULT_QUOTA_PER_MINUTE),
            quota_per_hour: read_usize_env("QUOTA_PER_HOUR").unwrap_or(DEFAULT_QUOTA_PER_HOUR),
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:5000".to_string()
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_list_env(name: &str) -> Option<Vec<String>> {
    let value = std::env::var(name).ok()?;
    let entries = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    if entries.is_empty() { None } else { Some(entries) }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
