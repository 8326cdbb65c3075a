/// Startup configuration problems. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("download status feed URL is not configured (set VIDRA_DOWNLOAD_STATUS_WS_URL)")]
    MissingFeedUrl,

    #[error("invalid download status feed URL '{url}': {reason}")]
    InvalidFeedUrl { url: String, reason: String },
}

/// Errors that end one upstream feed session.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed by remote")]
    RemoteClosed,
}

/// A single upstream frame that could not be decoded. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid status batch JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary frame is not valid UTF-8 ({len} bytes): {lossy}")]
    Utf8 { len: usize, lossy: String },
}
