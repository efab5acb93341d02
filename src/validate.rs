use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Raw request body for `POST /convert`. Kept deliberately loose so that the
/// validator, not serde, decides which rule failed and in what order.
#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub url: Option<String>,
    pub format: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Mp3,
    Mp4,
}

impl MediaFormat {
    pub fn extension(self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Mp4 => "mp4",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(MediaFormat::Mp3),
            "mp4" => Some(MediaFormat::Mp4),
            _ => None,
        }
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub url: String,
    pub format: MediaFormat,
    pub user_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid request format. JSON expected.")]
    NotJson,
    #[error("No URL provided.")]
    MissingUrl,
    #[error("URL not supported. Use a link from a recognized video host.")]
    UnsupportedUrl,
    #[error("Invalid format. Use 'mp3' or 'mp4'.")]
    InvalidFormat,
}

/// Pure validation: no network, no disk. Rules are checked in a fixed order
/// so that exactly one violation is reported.
pub fn validate(raw: ConvertRequest) -> Result<ConversionRequest, ValidationError> {
    let url = raw
        .url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ValidationError::MissingUrl)?
        .to_string();

    if !is_supported_media_url(&url) {
        return Err(ValidationError::UnsupportedUrl);
    }

    let format = match raw.format.as_deref().map(str::trim) {
        None | Some("") => MediaFormat::Mp3,
        Some(value) => MediaFormat::parse(value).ok_or(ValidationError::InvalidFormat)?,
    };

    Ok(ConversionRequest {
        url,
        format,
        user_id: raw
            .user_id
            .as_deref()
            .and_then(crate::config::non_empty)
            .map(ToString::to_string),
    })
}

const SUPPORTED_DOMAINS: [&str; 8] = [
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "music.youtube.com",
    "vimeo.com",
    "dailymotion.com",
    "soundcloud.com",
    "twitch.tv",
];

fn is_supported_media_url(input: &str) -> bool {
    let parsed = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}
