use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::model::UserId;

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid URL for {field}: {source}")]
    Url {
        field: &'static str,
        source: url::ParseError,
    },
    #[error("invalid value for {0}")]
    Invalid(&'static str),
}

/// Connection and paging settings for a room session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ws_url: String,
    pub api_url: String,
    pub user_id: UserId,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// 0 keeps retrying for as long as the session lives.
    pub max_reconnect_attempts: u32,
    /// How long a publish retry waits for the forced reconnect.
    pub publish_retry_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            user_id: 0,
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 0,
            publish_retry_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays `ROOM_CHAT_WS_URL`, `ROOM_CHAT_API_URL` and `ROOM_CHAT_USER_ID`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(ws_url) = std::env::var("ROOM_CHAT_WS_URL") {
            self.ws_url = ws_url;
        }
        if let Ok(api_url) = std::env::var("ROOM_CHAT_API_URL") {
            self.api_url = api_url;
        }
        if let Ok(user_id) = std::env::var("ROOM_CHAT_USER_ID") {
            self.user_id = user_id
                .parse()
                .map_err(|_| ConfigError::Invalid("ROOM_CHAT_USER_ID"))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = Url::parse(&self.ws_url).map_err(|source| ConfigError::Url { field: "ws_url", source })?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(ConfigError::Invalid("ws_url"));
        }
        Url::parse(&self.api_url).map_err(|source| ConfigError::Url { field: "api_url", source })?;
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn publish_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_retry_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "user_id": 12, "reconnect_delay_ms": 50 }"#).unwrap();
        assert_eq!(config.user_id, 12);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(50));
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_websocket_url() {
        let config = SessionConfig {
            ws_url: "http://example.com/ws".into(),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid("ws_url"))));
    }
}
