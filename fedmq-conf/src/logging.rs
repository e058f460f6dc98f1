//! `[log]` section: where records go and the lowest level that is kept.

use std::path::Path;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: Level(slog::Level::Info), dir: "/var/log/fedmq".into(), file: "fedmq.log".into() }
    }
}

impl Log {
    /// Path of the log file, empty when no file is configured.
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        Path::new(&self.dir).join(&self.file).to_string_lossy().into_owned()
    }
}

/// Destination of formatted records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    #[default]
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

/// slog level accepted from config files and `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl FromStr for Level {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        slog::Level::from_str(s).map(Level).map_err(|_| format!("invalid log level: {s}"))
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_section() {
        let log: Log = serde_json::from_str(r#"{"to":"both","level":"debug","dir":"/tmp/fedmq/"}"#).unwrap();
        assert_eq!(log.to, To::Both);
        assert_eq!(log.level.inner(), slog::Level::Debug);
        assert_eq!(log.filename(), "/tmp/fedmq/fedmq.log");

        let log = Log { dir: String::new(), ..Default::default() };
        assert_eq!(log.filename(), "fedmq.log");
        let log = Log { file: String::new(), ..Default::default() };
        assert_eq!(log.filename(), "");
    }

    #[test]
    fn test_invalid_values() {
        assert!(serde_json::from_str::<Log>(r#"{"to":"syslog"}"#).is_err());
        assert!(serde_json::from_str::<Log>(r#"{"level":"loud"}"#).is_err());
        assert!("warn".parse::<Level>().is_ok());
    }
}
