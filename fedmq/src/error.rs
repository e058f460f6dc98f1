use std::time::Duration;

use config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FedError {
    #[error("topic format error, {0:?}")]
    TopicFormat(String),
    #[error("host format error, {0:?}")]
    HostFormat(String),
    #[error("not found, {0}")]
    NotFound(String),
    #[error("already connected, {0}")]
    AlreadyConnected(String),
    #[error("subscriber count saturated, {0}")]
    MaxSubscriberCount(String),
    #[error("subscriber count is already zero, {0}")]
    ZeroSubscriberCount(String),
    #[error("stored type mismatch, {0}")]
    StoredTypeMismatch(String),
    #[error("duplicate, {0}")]
    Duplicate(String),
    #[error("protocol violation, {0}")]
    Protocol(String),
    #[error("transport error, {0}")]
    Transport(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Json(serde_json::Error),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Io(std::io::Error),
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Msg(String),
}

impl FedError {
    /// Errors after which the owning event loop must stop and the process restart.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, FedError::Protocol(_))
    }
}

impl From<String> for FedError {
    #[inline]
    fn from(e: String) -> Self {
        FedError::Msg(e)
    }
}

impl From<&str> for FedError {
    #[inline]
    fn from(e: &str) -> Self {
        FedError::Msg(e.to_string())
    }
}

impl From<serde_json::Error> for FedError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        FedError::Json(e)
    }
}

impl From<ConfigError> for FedError {
    #[inline]
    fn from(e: ConfigError) -> Self {
        FedError::Config(e)
    }
}

impl From<std::io::Error> for FedError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        FedError::Io(e)
    }
}

impl From<anyhow::Error> for FedError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        FedError::Anyhow(e)
    }
}

impl From<rumqttc::ClientError> for FedError {
    #[inline]
    fn from(e: rumqttc::ClientError) -> Self {
        FedError::Transport(e.to_string())
    }
}

impl From<rumqttc::ConnectionError> for FedError {
    #[inline]
    fn from(e: rumqttc::ConnectionError) -> Self {
        FedError::Transport(e.to_string())
    }
}
