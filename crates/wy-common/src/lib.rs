use serde::{Deserialize, Deserializer};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid bind address {bind:?}: {reason}")]
    InvalidBind { bind: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub serve: ServeConfig,
    pub client: ClientConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(data)?)
    }
}

/// Target server settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServeConfig {
    /// Socket to bind to. A bare `:port` binds `[::]:port`, which is
    /// dual-stack where the OS allows it.
    pub bind: String,
    /// Also accept HTTP/2 over cleartext. Only prior-knowledge connections
    /// are understood; the HTTP/1.1 `Upgrade: h2c` handshake is not.
    pub h2c: bool,
    #[serde(deserialize_with = "duration_str")]
    pub delay_header: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub delay_body_first_byte: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub delay_body_last_byte: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: ":8080".to_string(),
            h2c: false,
            delay_header: Duration::ZERO,
            delay_body_first_byte: Duration::ZERO,
            delay_body_last_byte: Duration::ZERO,
        }
    }
}

impl ServeConfig {
    pub fn timing(&self) -> TimingProfile {
        TimingProfile {
            header_delay: self.delay_header,
            first_byte_delay: self.delay_body_first_byte,
            last_byte_delay: self.delay_body_last_byte,
        }
    }

    /// Resolves `bind` into a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let normalized = if self.bind.starts_with(':') {
            format!("[::]{}", self.bind)
        } else {
            self.bind.clone()
        };

        let invalid = |reason: String| ConfigError::InvalidBind {
            bind: self.bind.clone(),
            reason,
        };

        normalized
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("address resolved to nothing".to_string()))
    }
}

/// Per-phase delays of the success route. Shared read-only by every request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingProfile {
    pub header_delay: Duration,
    pub first_byte_delay: Duration,
    pub last_byte_delay: Duration,
}

impl TimingProfile {
    pub fn new(header_delay: Duration, first_byte_delay: Duration, last_byte_delay: Duration) -> Self {
        Self {
            header_delay,
            first_byte_delay,
            last_byte_delay,
        }
    }

    /// Minimum time until the first body byte can leave the server.
    pub fn time_to_first_byte(&self) -> Duration {
        self.header_delay + self.first_byte_delay
    }

    /// Minimum time until the final body byte can leave the server.
    pub fn time_to_last_byte(&self) -> Duration {
        self.time_to_first_byte() + self.last_byte_delay
    }
}

/// Load generator settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub print_body: bool,
    pub count: u64,
    /// Repeat until interrupted; `count` is ignored when set.
    pub forever: bool,
    #[serde(deserialize_with = "duration_str")]
    pub interval: Duration,
    #[serde(deserialize_with = "optional_duration_str")]
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/".to_string(),
            print_body: true,
            count: 5,
            forever: false,
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Parses a human readable duration such as `250ms` or `1m30s`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::Invalid(format!("invalid duration {value:?}: {e}")))
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn optional_duration_str<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
