//! Client settings.

use std::time::Duration;

use folkmq_proto::check_meta;

/// Errors raised while loading settings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A variable holds a value that cannot be parsed
    #[error("invalid {name}: {value}")]
    InvalidValue {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },
}

/// Settings used to build an `MqClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Broker urls (`folkmq://host:port`, `folkmq:ws://host:port/path`)
    pub server_urls: Vec<String>,

    /// Client name, used as the default consumer group
    pub name: Option<String>,

    /// Topic namespace
    pub namespace: Option<String>,

    /// Timeout of QoS 1 requests
    pub request_timeout: Duration,

    /// Timeout of subscribe and unsubscribe requests
    pub subscribe_timeout: Duration,

    /// Transport heartbeat interval
    pub heartbeat_interval: Duration,

    /// Acknowledge deliveries once the handler returns
    pub auto_ack: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_urls: vec!["folkmq://127.0.0.1:18602".to_string()],
            name: None,
            namespace: None,
            request_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(6),
            auto_ack: true,
        }
    }
}

impl ClientSettings {
    /// Load settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FOLKMQ_SERVER_URLS`: comma separated broker urls
    /// - `FOLKMQ_NAME`: client name
    /// - `FOLKMQ_NAMESPACE`: topic namespace
    /// - `FOLKMQ_REQUEST_TIMEOUT_MS`: QoS 1 request timeout
    /// - `FOLKMQ_SUBSCRIBE_TIMEOUT_MS`: subscribe timeout
    /// - `FOLKMQ_HEARTBEAT_MS`: heartbeat interval
    /// - `FOLKMQ_AUTO_ACK`: `true` or `false`
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value or the
    /// namespace holds a reserved character.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(urls) = lookup("FOLKMQ_SERVER_URLS") {
            settings.server_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        if let Some(name) = lookup("FOLKMQ_NAME").filter(|name| !name.is_empty()) {
            settings.name = Some(name);
        }

        if let Some(namespace) = lookup("FOLKMQ_NAMESPACE").filter(|ns| !ns.is_empty()) {
            if check_meta(&namespace, "namespace").is_err() {
                return Err(ConfigError::InvalidValue {
                    name: "FOLKMQ_NAMESPACE",
                    value: namespace,
                });
            }
            settings.namespace = Some(namespace);
        }

        if let Some(ms) = lookup("FOLKMQ_REQUEST_TIMEOUT_MS") {
            settings.request_timeout = parse_millis("FOLKMQ_REQUEST_TIMEOUT_MS", &ms)?;
        }

        if let Some(ms) = lookup("FOLKMQ_SUBSCRIBE_TIMEOUT_MS") {
            settings.subscribe_timeout = parse_millis("FOLKMQ_SUBSCRIBE_TIMEOUT_MS", &ms)?;
        }

        if let Some(ms) = lookup("FOLKMQ_HEARTBEAT_MS") {
            settings.heartbeat_interval = parse_millis("FOLKMQ_HEARTBEAT_MS", &ms)?;
        }

        if let Some(flag) = lookup("FOLKMQ_AUTO_ACK") {
            settings.auto_ack = match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "FOLKMQ_AUTO_ACK",
                        value: flag,
                    })
                }
            };
        }

        Ok(settings)
    }
}

fn parse_millis(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        })
}
