use crate::error::ConfigurationError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub log_level: String,
    pub download_status_ws_url: Option<String>,
    pub feed_reconnect_initial_ms: u64,
    pub feed_reconnect_max_ms: u64,
    pub subscriber_buffer: usize,
    pub status_retention_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigurationError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 5000)?
            .set_default("log_level", "info")?
            .set_default("feed_reconnect_initial_ms", 1000)?
            .set_default("feed_reconnect_max_ms", 30_000)?
            .set_default("subscriber_buffer", 64)?
            .set_default("status_retention_secs", 3600)?
            .set_default("eviction_interval_secs", 60)?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. VIDRA_DOWNLOAD_STATUS_WS_URL=ws://ytdlp:8000/ws/download_status)
            .add_source(Environment::with_prefix("VIDRA"));

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parses the upstream status feed endpoint. The process must not run
    /// without a feed, so a missing or non-websocket URL is an error.
    pub fn feed_url(&self) -> Result<Url, ConfigurationError> {
        let raw = self
            .download_status_ws_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigurationError::MissingFeedUrl)?;

        let url = Url::parse(raw).map_err(|e| ConfigurationError::InvalidFeedUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigurationError::InvalidFeedUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}', expected ws or wss", other),
            }),
        }
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.feed_reconnect_initial_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.feed_reconnect_max_ms.max(self.feed_reconnect_initial_ms))
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

#[cfg(test)]
impl Settings {
    pub fn for_tests(feed_url: &str) -> Self {
        Self {
            server_port: 0,
            log_level: "debug".to_string(),
            download_status_ws_url: Some(feed_url.to_string()),
            feed_reconnect_initial_ms: 20,
            feed_reconnect_max_ms: 100,
            subscriber_buffer: 16,
            status_retention_secs: 3600,
            eviction_interval_secs: 60,
        }
    }
}
