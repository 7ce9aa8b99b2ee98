//! Server tuning knobs.

use std::time::Duration;

use serde::Deserialize;

use crate::http::request::Limits;

/// Runtime configuration for a [`Server`](super::Server).
///
/// Build one with [`ServerConfig::default`] and the `with_*` methods, or
/// deserialize it. Serialized durations are given in (possibly fractional)
/// seconds:
///
/// ```
/// use std::time::Duration;
/// use erica::ServerConfig;
///
/// let config: ServerConfig = serde_json::from_str(
///     r#"{ "read_timeout_secs": 2.5, "max_connections": 128 }"#,
/// )?;
/// assert_eq!(config.read_timeout, Duration::from_millis(2500));
/// assert_eq!(config.max_connections, Some(128));
/// assert!(config.keep_alive);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    /// Deadline for receiving a request head, and again for its body.
    pub read_timeout: Duration,
    /// Upper bound on concurrently served connections; `None` is unbounded.
    pub max_connections: Option<usize>,
    /// Allow persistent connections at all.
    pub keep_alive: bool,
    /// How long shutdown waits for in-flight connections before aborting them.
    pub shutdown_grace_period: Duration,
    /// Longest accepted request line plus header block, in bytes.
    pub max_head_size: usize,
    /// Largest accepted request body, in bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            read_timeout: Duration::from_secs(30),
            max_connections: None,
            keep_alive: true,
            shutdown_grace_period: Duration::from_secs(10),
            max_head_size: limits.max_head_size,
            max_body_size: limits.max_body_size,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_max_head_size(mut self, bytes: usize) -> Self {
        self.max_head_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// The parser limits derived from this configuration.
    pub fn limits(&self) -> Limits {
        Limits {
            max_head_size: self.max_head_size,
            max_body_size: self.max_body_size,
        }
    }
}

// On-the-wire shape of `ServerConfig`.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawServerConfig {
    read_timeout_secs: f64,
    max_connections: Option<usize>,
    keep_alive: bool,
    shutdown_grace_secs: f64,
    max_head_size: usize,
    max_body_size: usize,
}

impl Default for RawServerConfig {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            read_timeout_secs: config.read_timeout.as_secs_f64(),
            max_connections: config.max_connections,
            keep_alive: config.keep_alive,
            shutdown_grace_secs: config.shutdown_grace_period.as_secs_f64(),
            max_head_size: config.max_head_size,
            max_body_size: config.max_body_size,
        }
    }
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = std::time::TryFromFloatSecsError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            read_timeout: Duration::try_from_secs_f64(raw.read_timeout_secs)?,
            max_connections: raw.max_connections,
            keep_alive: raw.keep_alive,
            shutdown_grace_period: Duration::try_from_secs_f64(raw.shutdown_grace_secs)?,
            max_head_size: raw.max_head_size,
            max_body_size: raw.max_body_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, None);
        assert!(config.keep_alive);
        assert_eq!(config.limits(), Limits::default());
    }

    #[test]
    fn builders_chain() {
        let config = ServerConfig::default()
            .with_read_timeout(Duration::from_millis(250))
            .with_max_connections(4)
            .with_keep_alive(false)
            .with_shutdown_grace_period(Duration::from_secs(1))
            .with_max_head_size(1024)
            .with_max_body_size(2048);

        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.max_connections, Some(4));
        assert!(!config.keep_alive);
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(1));
        assert_eq!(
            config.limits(),
            Limits {
                max_head_size: 1024,
                max_body_size: 2048
            }
        );
    }

    #[test]
    fn deserialize_empty_object_gives_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn deserialize_seconds() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"shutdown_grace_secs": 0.5, "keep_alive": false}"#).unwrap();
        assert_eq!(config.shutdown_grace_period, Duration::from_millis(500));
        assert!(!config.keep_alive);
    }

    #[test]
    fn deserialize_rejects_negative_and_unknown() {
        assert!(serde_json::from_str::<ServerConfig>(r#"{"read_timeout_secs": -1}"#).is_err());
        assert!(serde_json::from_str::<ServerConfig>(r#"{"port": 80}"#).is_err());
    }
}
