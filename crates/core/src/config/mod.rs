use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{self, DEFAULT_PORT};
use crate::{BackendMode, MocapError, Result, StreamMode};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a `.toml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") => toml::from_str(&contents)?,
            _ => {
                return Err(MocapError::msg(format!(
                    "unsupported configuration format `{}`",
                    path.display()
                )))
            }
        };
        config.stream.validate()?;
        Ok(config)
    }
}

/// Everything needed to open and run one stream session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Hosts to connect to. Entries may themselves be `;`-joined lists.
    pub targets: Vec<String>,
    /// Port applied to targets that do not name one.
    pub port: u16,
    pub mode: BackendMode,
    /// Ignored for retimed sessions.
    pub stream_mode: StreamMode,
    /// Delay applied when sampling the retiming clock. Retimed only.
    pub offset_seconds: f64,
    pub use_lightweight_data: bool,
    pub subject_filter: Vec<String>,
    /// When set, the consumer drives acquisition through `tick()` and no
    /// background acquisition loop is started.
    pub consumer_ticks: bool,
    pub retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            targets: vec!["localhost".to_string()],
            port: DEFAULT_PORT,
            mode: BackendMode::Direct,
            stream_mode: StreamMode::ClientPullPreFetch,
            offset_seconds: 0.0,
            use_lightweight_data: true,
            subject_filter: Vec::new(),
            consumer_ticks: false,
            retry: RetryConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Combined `;`-joined target string with default ports filled in.
    pub fn combined_target(&self) -> Result<String> {
        endpoint::combine_targets(&self.targets, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        self.combined_target()?;
        if !self.offset_seconds.is_finite() || self.offset_seconds < 0.0 {
            return Err(MocapError::InvalidInput(
                "retiming offset must be a finite, non-negative number of seconds",
            ));
        }
        if self.retry.interval_ms == 0 {
            return Err(MocapError::InvalidInput("retry interval must be non-zero"));
        }
        Ok(())
    }
}

/// Connect-retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub interval_ms: u64,
    /// `None` retries until the session is stopped.
    pub max_attempts: Option<u32>,
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_local_server() {
        let config = AppConfig::default();
        assert_eq!(config.stream.combined_target().unwrap(), "localhost:801");
        assert_eq!(config.stream.retry.interval(), Duration::from_millis(200));
        assert_eq!(config.stream.retry.max_attempts, None);
        assert!(config.stream.use_lightweight_data);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_partial_toml() {
        let toml_content = r#"
[stream]
targets = ["capture01:809", "capture02"]
mode = "retimed"
offset_seconds = 0.05
subject_filter = ["Actor1"]

[stream.retry]
interval_ms = 50
"#;
        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.stream.mode, BackendMode::Retimed);
        assert_eq!(
            config.stream.combined_target().unwrap(),
            "capture01:809;capture02:801"
        );
        assert_eq!(config.stream.retry.interval_ms, 50);
        assert_eq!(config.stream.stream_mode, StreamMode::ClientPullPreFetch);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_json() {
        let json = r#"{
            "stream": {
                "targets": ["rig"],
                "port": 900,
                "stream_mode": "server_push",
                "consumer_ticks": true
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stream.combined_target().unwrap(), "rig:900");
        assert_eq!(config.stream.stream_mode, StreamMode::ServerPush);
        assert!(config.stream.consumer_ticks);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = StreamConfig {
            offset_seconds: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.offset_seconds = 0.0;
        config.targets.clear();
        assert!(config.validate().is_err());

        config.targets.push("rig".into());
        config.retry.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.toml");
        std::fs::write(
            &path,
            r#"
[stream]
targets = ["capture01;capture02:809"]
port = 802
consumer_ticks = true

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(
            config.stream.combined_target().unwrap(),
            "capture01:802;capture02:809"
        );
        assert!(config.stream.consumer_ticks);
        assert_eq!(config.stream.mode, BackendMode::Direct);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        std::fs::write(
            &path,
            r#"{"stream": {"targets": ["rig"], "mode": "retimed", "offset_seconds": 0.1}}"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.stream.mode, BackendMode::Retimed);
        assert_eq!(config.stream.offset_seconds, 0.1);
        assert_eq!(config.stream.combined_target().unwrap(), "rig:801");
    }

    #[test]
    fn file_loading_validates_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.toml");
        std::fs::write(&path, "[stream]\ntargets = [\"rig:notaport\"]\n").unwrap();

        assert!(matches!(
            AppConfig::from_file(&path),
            Err(MocapError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn file_loading_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            AppConfig::from_file(&path),
            Err(MocapError::Json(_))
        ));
    }

    #[test]
    fn rejects_unknown_file_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.yaml");
        std::fs::write(&path, "stream: {}").unwrap();

        let err = AppConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported configuration format"));
    }
}
