//! pulsegrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub version: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "pulsegrid".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Broker topic carrying control envelopes.
    pub control_topic: String,
    /// Prefix for per-channel publication topics.
    pub channel_topic_prefix: String,
    pub heartbeat_interval: String,
    /// Peers silent for longer than this are dropped from the registry.
    pub node_ttl: String,
    pub survey_timeout: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            control_topic: "pulsegrid.control".to_string(),
            channel_topic_prefix: "pulsegrid.channel.".to_string(),
            heartbeat_interval: "5s".to_string(),
            node_ttl: "15s".to_string(),
            survey_timeout: "2s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub channel_max_length: usize,
    /// How often the alive handler runs for each connection.
    pub presence_update_interval: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_max_length: 255,
            presence_update_interval: "25s".to_string(),
        }
    }
}

impl PulseConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PulseConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn heartbeat_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("cluster.heartbeat_interval", &self.cluster.heartbeat_interval)
    }

    pub fn node_ttl(&self) -> Result<Duration, ConfigError> {
        duration_field("cluster.node_ttl", &self.cluster.node_ttl)
    }

    pub fn survey_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("cluster.survey_timeout", &self.cluster.survey_timeout)
    }

    pub fn presence_update_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("client.presence_update_interval", &self.client.presence_update_interval)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.control_topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "cluster.control_topic must not be empty".to_string(),
            ));
        }
        let interval = self.heartbeat_interval()?;
        let ttl = self.node_ttl()?;
        if interval.is_zero() {
            return Err(ConfigError::Invalid(
                "cluster.heartbeat_interval must be positive".to_string(),
            ));
        }
        if ttl <= interval {
            return Err(ConfigError::Invalid(format!(
                "cluster.node_ttl ({ttl:?}) must exceed cluster.heartbeat_interval ({interval:?})"
            )));
        }
        self.survey_timeout()?;
        if self.client.channel_max_length == 0 {
            return Err(ConfigError::Invalid(
                "client.channel_max_length must be positive".to_string(),
            ));
        }
        if self.presence_update_interval()?.is_zero() {
            return Err(ConfigError::Invalid(
                "client.presence_update_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

/// Parse `"250ms"`, `"5s"`, `"2m"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
