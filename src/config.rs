// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Gateway configuration with:
// - TOML file parsing
// - Environment variable overrides (FACETTE_ prefix, `__` as separator)
// - Validation
// - Sensible defaults
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::timerange;

/// Default HTTP listen address
pub const DEFAULT_LISTEN: &str = "localhost:12003";

/// Default number of points per returned series
pub const DEFAULT_SAMPLE: usize = 400;

/// Upper bound accepted for the default sample
pub const MAX_SAMPLE: usize = 100_000;

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Identifier used to detect request loops between proxied instances.
    /// A random one is generated at start-up when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FACETTE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        ListenAddress::parse(&self.http.listen)?;

        if !self.http.base_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "http.base_path",
                "base path must start with '/'",
            ));
        }

        if timerange::parse(&self.defaults.time_range).is_err() {
            return Err(ConfigError::invalid_value(
                "defaults.time_range",
                format!("'{}' is not a valid time range", self.defaults.time_range),
            ));
        }

        if self.defaults.sample == 0 || self.defaults.sample > MAX_SAMPLE {
            return Err(ConfigError::invalid_value(
                "defaults.sample",
                format!("sample must be between 1 and {}", MAX_SAMPLE),
            ));
        }

        if self.defaults.connector_timeout == 0 {
            return Err(ConfigError::invalid_value(
                "defaults.connector_timeout",
                "timeout must be at least 1 second",
            ));
        }

        if let Some(id) = &self.instance_id {
            if id.trim().is_empty() {
                return Err(ConfigError::invalid_value("instance_id", "must not be empty"));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// HTTP Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` or `unix:/path/to/socket[?mode=0660&user=..&group=..]`
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Time given to in-flight requests on shutdown, in seconds
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: u64,

    /// Path under which the API is mounted
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Reject every mutating library and provider request
    #[serde(default)]
    pub read_only: bool,

    /// Report the version in the info endpoint
    #[serde(default = "default_true")]
    pub expose_version: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            graceful_timeout: default_graceful_timeout(),
            base_path: default_base_path(),
            read_only: false,
            expose_version: true,
        }
    }
}

impl HttpConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.into()
}

fn default_graceful_timeout() -> u64 {
    30
}

fn default_base_path() -> String {
    "/".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Listen Address
// ----------------------------------------------------------------------------

/// Parsed form of `http.listen`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(String),
    Unix {
        path: PathBuf,
        mode: Option<u32>,
        user: Option<String>,
        group: Option<String>,
    },
}

impl ListenAddress {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let Some(rest) = input.strip_prefix("unix:") else {
            if input.is_empty() || !input.contains(':') {
                return Err(ConfigError::invalid_value(
                    "http.listen",
                    format!("'{}' is not a host:port address", input),
                ));
            }
            return Ok(ListenAddress::Tcp(input.to_string()));
        };

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(ConfigError::invalid_value("http.listen", "missing socket path"));
        }

        let (mut mode, mut user, mut group) = (None, None, None);
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "mode" => {
                    let parsed = u32::from_str_radix(value, 8).map_err(|_| {
                        ConfigError::invalid_value(
                            "http.listen",
                            format!("invalid socket mode '{}'", value),
                        )
                    })?;
                    mode = Some(parsed);
                }
                "user" => user = Some(value.to_string()),
                "group" => group = Some(value.to_string()),
                other => {
                    return Err(ConfigError::invalid_value(
                        "http.listen",
                        format!("unknown socket option '{}'", other),
                    ))
                }
            }
        }

        Ok(ListenAddress::Unix {
            path: PathBuf::from(path),
            mode,
            user,
            group,
        })
    }
}

// ----------------------------------------------------------------------------
// Storage Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON snapshot of the library; memory-only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// Request Defaults
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Range applied to points requests without explicit bounds
    #[serde(default = "default_time_range")]
    pub time_range: String,

    /// Number of points per returned series
    #[serde(default = "default_sample")]
    pub sample: usize,

    /// Connector HTTP timeout in seconds, unless the provider sets `timeout`
    #[serde(default = "default_connector_timeout")]
    pub connector_timeout: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            time_range: default_time_range(),
            sample: default_sample(),
            connector_timeout: default_connector_timeout(),
        }
    }
}

fn default_time_range() -> String {
    "-1h".into()
}

fn default_sample() -> usize {
    DEFAULT_SAMPLE
}

fn default_connector_timeout() -> u64 {
    10
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http.listen, "localhost:12003");
        assert_eq!(config.defaults.sample, 400);
        assert_eq!(config.defaults.time_range, "-1h");
    }

    #[test]
    fn test_config_from_str() {
        let config = GatewayConfig::from_str(
            r#"
            instance_id = "node-a"

            [http]
            listen = "0.0.0.0:8080"
            read_only = true

            [defaults]
            sample = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.instance_id.as_deref(), Some("node-a"));
        assert_eq!(config.http.listen, "0.0.0.0:8080");
        assert!(config.http.read_only);
        assert_eq!(config.defaults.sample, 120);
        assert_eq!(config.defaults.connector_timeout, 10);
    }

    #[test]
    fn test_config_rejects_bad_time_range() {
        let err = GatewayConfig::from_str("[defaults]\ntime_range = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "defaults.time_range"));
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http]\nbase_path = \"/facette\"\n").unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.http.base_path, "/facette");
    }

    #[test]
    fn test_config_load_missing_file() {
        let err = GatewayConfig::load("/nonexistent/facette.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_generate_default_config_roundtrip() {
        let rendered = GatewayConfig::generate_default_config();
        let config = GatewayConfig::from_str(&rendered).unwrap();
        assert_eq!(config.http.graceful_timeout, 30);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_listen_address_parse() {
        assert_eq!(
            ListenAddress::parse("localhost:12003").unwrap(),
            ListenAddress::Tcp("localhost:12003".into())
        );
        assert_eq!(
            ListenAddress::parse("unix:/run/facette.sock?mode=0660&group=www").unwrap(),
            ListenAddress::Unix {
                path: PathBuf::from("/run/facette.sock"),
                mode: Some(0o660),
                user: None,
                group: Some("www".into()),
            }
        );
        assert!(ListenAddress::parse("unix:").is_err());
        assert!(ListenAddress::parse("unix:/tmp/s?mode=999").is_err());
        assert!(ListenAddress::parse("nocolon").is_err());
    }
}
