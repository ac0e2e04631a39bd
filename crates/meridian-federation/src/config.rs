use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::constants::CONNECT_TIMEOUT;
use crate::constants::DEPENDENCY_TEST_INTERVAL;
use crate::constants::MAX_BACKOFF_EXPONENT;
use crate::constants::PENDING_UPDATE_STALE_MS;
use crate::constants::REQUEST_TIMEOUT;
use crate::constants::RPC_AGENT_INTERVAL;
use crate::constants::STATE_SAVE_INTERVAL;
use crate::federation::ClusterDescriptor;
use crate::federation::FederationDescriptor;
use crate::types::ClusterId;

/// Configuration of one federation node.
///
/// Loaded in layers with the following precedence (lowest to highest):
/// 1. Environment variables (MERIDIAN_*)
/// 2. TOML configuration file
/// 3. Command-line arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Name of the local cluster; must appear in `federation.clusters`.
    #[serde(default)]
    pub cluster_name: String,

    /// Address of the inbound federation listener.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Directory holding the persisted federation state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Start with empty state instead of failing on a corrupt state file.
    #[serde(default)]
    pub ignore_state_errors: bool,

    #[serde(default)]
    pub federation: FederationDescriptor,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Timeouts and periods, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_rpc_agent_interval_ms")]
    pub rpc_agent_interval_ms: u64,
    /// Retry spacing never exceeds `2^max_backoff_exponent` seconds.
    #[serde(default = "default_max_backoff_exponent")]
    pub max_backoff_exponent: u32,
    /// Age after which an unacknowledged update no longer blocks lock grants.
    #[serde(default = "default_pending_update_stale_ms")]
    pub pending_update_stale_ms: u64,
    #[serde(default = "default_dependency_test_interval_ms")]
    pub dependency_test_interval_ms: u64,
    #[serde(default = "default_state_save_interval_ms")]
    pub state_save_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            rpc_agent_interval_ms: default_rpc_agent_interval_ms(),
            max_backoff_exponent: default_max_backoff_exponent(),
            pending_update_stale_ms: default_pending_update_stale_ms(),
            dependency_test_interval_ms: default_dependency_test_interval_ms(),
            state_save_interval_ms: default_state_save_interval_ms(),
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rpc_agent_interval(&self) -> Duration {
        Duration::from_millis(self.rpc_agent_interval_ms)
    }

    pub fn dependency_test_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_test_interval_ms)
    }

    pub fn state_save_interval(&self) -> Duration {
        Duration::from_millis(self.state_save_interval_ms)
    }
}

impl Default for FederationDescriptor {
    fn default() -> Self {
        Self {
            name: default_federation_name(),
            generation: 0,
            clusters: Vec::new(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            listen_address: default_listen_address(),
            state_dir: default_state_dir(),
            ignore_state_errors: false,
            federation: FederationDescriptor::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern `MERIDIAN_<FIELD_NAME>`. Members are
    /// given as `MERIDIAN_CLUSTERS=1:alpha@host:port,2:beta@host:port`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let clusters = match std::env::var("MERIDIAN_CLUSTERS") {
            Ok(raw) => parse_cluster_list(&raw)?,
            Err(_) => Vec::new(),
        };
        Ok(Self {
            cluster_name: parse_env("MERIDIAN_CLUSTER_NAME").unwrap_or_default(),
            listen_address: parse_env("MERIDIAN_LISTEN_ADDRESS").unwrap_or_else(default_listen_address),
            state_dir: parse_env("MERIDIAN_STATE_DIR").unwrap_or_else(default_state_dir),
            ignore_state_errors: parse_env("MERIDIAN_IGNORE_STATE_ERRORS").unwrap_or(false),
            federation: FederationDescriptor {
                name: parse_env("MERIDIAN_FEDERATION_NAME").unwrap_or_else(default_federation_name),
                generation: 0,
                clusters,
            },
            timing: TimingConfig {
                connect_timeout_ms: parse_env("MERIDIAN_CONNECT_TIMEOUT_MS")
                    .unwrap_or_else(default_connect_timeout_ms),
                request_timeout_ms: parse_env("MERIDIAN_REQUEST_TIMEOUT_MS")
                    .unwrap_or_else(default_request_timeout_ms),
                rpc_agent_interval_ms: parse_env("MERIDIAN_RPC_AGENT_INTERVAL_MS")
                    .unwrap_or_else(default_rpc_agent_interval_ms),
                max_backoff_exponent: parse_env("MERIDIAN_MAX_BACKOFF_EXPONENT")
                    .unwrap_or_else(default_max_backoff_exponent),
                pending_update_stale_ms: parse_env("MERIDIAN_PENDING_UPDATE_STALE_MS")
                    .unwrap_or_else(default_pending_update_stale_ms),
                dependency_test_interval_ms: parse_env("MERIDIAN_DEPENDENCY_TEST_INTERVAL_MS")
                    .unwrap_or_else(default_dependency_test_interval_ms),
                state_save_interval_ms: parse_env("MERIDIAN_STATE_SAVE_INTERVAL_MS")
                    .unwrap_or_else(default_state_save_interval_ms),
            },
        })
    }

    /// Merge configuration from a higher-precedence source.
    ///
    /// Fields in `other` that are non-empty or non-default override `self`.
    pub fn merge(&mut self, other: Self) {
        if !other.cluster_name.is_empty() {
            self.cluster_name = other.cluster_name;
        }
        if other.listen_address != default_listen_address() {
            self.listen_address = other.listen_address;
        }
        if other.state_dir != default_state_dir() {
            self.state_dir = other.state_dir;
        }
        if other.ignore_state_errors {
            self.ignore_state_errors = true;
        }
        if other.federation.name != default_federation_name() {
            self.federation.name = other.federation.name;
        }
        if !other.federation.clusters.is_empty() {
            self.federation.clusters = other.federation.clusters;
        }

        let defaults = TimingConfig::default();
        let timing = other.timing;
        if timing.connect_timeout_ms != defaults.connect_timeout_ms {
            self.timing.connect_timeout_ms = timing.connect_timeout_ms;
        }
        if timing.request_timeout_ms != defaults.request_timeout_ms {
            self.timing.request_timeout_ms = timing.request_timeout_ms;
        }
        if timing.rpc_agent_interval_ms != defaults.rpc_agent_interval_ms {
            self.timing.rpc_agent_interval_ms = timing.rpc_agent_interval_ms;
        }
        if timing.max_backoff_exponent != defaults.max_backoff_exponent {
            self.timing.max_backoff_exponent = timing.max_backoff_exponent;
        }
        if timing.pending_update_stale_ms != defaults.pending_update_stale_ms {
            self.timing.pending_update_stale_ms = timing.pending_update_stale_ms;
        }
        if timing.dependency_test_interval_ms != defaults.dependency_test_interval_ms {
            self.timing.dependency_test_interval_ms = timing.dependency_test_interval_ms;
        }
        if timing.state_save_interval_ms != defaults.state_save_interval_ms {
            self.timing.state_save_interval_ms = timing.state_save_interval_ms;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return ValidationSnafu {
                message: "cluster_name must be set",
            }
            .fail();
        }
        if self.federation.clusters.is_empty() {
            return ValidationSnafu {
                message: "federation has no clusters",
            }
            .fail();
        }
        self.federation.validate().map_err(|err| ConfigError::Validation {
            message: err.to_string(),
        })?;
        if self.federation.cluster_by_name(&self.cluster_name).is_none() {
            return ValidationSnafu {
                message: format!("local cluster '{}' is not a federation member", self.cluster_name),
            }
            .fail();
        }
        if self.timing.connect_timeout_ms == 0 || self.timing.request_timeout_ms == 0 {
            return ValidationSnafu {
                message: "timeouts must be non-zero",
            }
            .fail();
        }
        if self.timing.rpc_agent_interval_ms == 0 {
            return ValidationSnafu {
                message: "rpc_agent_interval_ms must be non-zero",
            }
            .fail();
        }
        if self.timing.max_backoff_exponent > 16 {
            return ValidationSnafu {
                message: "max_backoff_exponent must be at most 16",
            }
            .fail();
        }
        Ok(())
    }

    /// Id of the local cluster.
    pub fn local_cluster_id(&self) -> Result<ClusterId, ConfigError> {
        self.federation.cluster_by_name(&self.cluster_name).map(|c| c.id).ok_or_else(|| {
            ConfigError::Validation {
                message: format!("local cluster '{}' is not a federation member", self.cluster_name),
            }
        })
    }
}

/// Parse `id:name@address` entries separated by commas.
fn parse_cluster_list(raw: &str) -> Result<Vec<ClusterDescriptor>, ConfigError> {
    let mut clusters = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let invalid = || ConfigError::Validation {
            message: format!("invalid cluster entry '{entry}', expected id:name@address"),
        };
        let (id, rest) = entry.split_once(':').ok_or_else(invalid)?;
        let (name, address) = rest.split_once('@').ok_or_else(invalid)?;
        let id = id.trim().parse::<u32>().ok().and_then(ClusterId::new).ok_or_else(|| ConfigError::Validation {
            message: format!("cluster id '{id}' must be within 1..=63"),
        })?;
        clusters.push(ClusterDescriptor::new(id, name.trim(), address.trim()));
    }
    Ok(clusters)
}

// Default value functions
fn default_listen_address() -> String {
    "0.0.0.0:6820".into()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_federation_name() -> String {
    "federation".into()
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT.as_millis() as u64
}

fn default_request_timeout_ms() -> u64 {
    REQUEST_TIMEOUT.as_millis() as u64
}

fn default_rpc_agent_interval_ms() -> u64 {
    RPC_AGENT_INTERVAL.as_millis() as u64
}

fn default_max_backoff_exponent() -> u32 {
    MAX_BACKOFF_EXPONENT
}

fn default_pending_update_stale_ms() -> u64 {
    PENDING_UPDATE_STALE_MS
}

fn default_dependency_test_interval_ms() -> u64 {
    DEPENDENCY_TEST_INTERVAL.as_millis() as u64
}

fn default_state_save_interval_ms() -> u64 {
    STATE_SAVE_INTERVAL.as_millis() as u64
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
cluster_name = "alpha"
listen_address = "127.0.0.1:7001"

[federation]
name = "research"

[[federation.clusters]]
id = 1
name = "alpha"
address = "127.0.0.1:7001"
features = ["gpu"]

[[federation.clusters]]
id = 2
name = "beta"
address = "127.0.0.1:7002"
state = "draining"

[timing]
rpc_agent_interval_ms = 500
"#;

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = FederationConfig::from_toml_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.federation.clusters.len(), 2);
        assert_eq!(config.local_cluster_id().unwrap(), ClusterId::new(1).unwrap());
        assert_eq!(config.timing.rpc_agent_interval_ms, 500);
        assert_eq!(config.timing.request_timeout_ms, default_request_timeout_ms());
        assert!(config.federation.clusters[0].features.contains("gpu"));
        assert_eq!(config.federation.clusters[1].state, crate::types::ClusterState::Draining);
    }

    #[test]
    fn test_validation_rejects_bad_membership() {
        let mut config: FederationConfig = toml::from_str(SAMPLE).unwrap();
        config.cluster_name = "gamma".into();
        assert!(config.validate().is_err());

        let mut dup: FederationConfig = toml::from_str(SAMPLE).unwrap();
        dup.federation.clusters[1].name = "alpha".into();
        assert!(dup.validate().is_err());

        let bad_id = "cluster_name = \"a\"\n[[federation.clusters]]\nid = 64\nname = \"a\"\naddress = \"x\"\n";
        assert!(toml::from_str::<FederationConfig>(bad_id).is_err());
    }

    #[test]
    fn test_merge_prefers_explicit_values() {
        let mut base = FederationConfig {
            cluster_name: "alpha".into(),
            ..Default::default()
        };
        let overlay = FederationConfig {
            listen_address: "127.0.0.1:9000".into(),
            ignore_state_errors: true,
            ..Default::default()
        };
        base.merge(overlay);
        assert_eq!(base.cluster_name, "alpha");
        assert_eq!(base.listen_address, "127.0.0.1:9000");
        assert!(base.ignore_state_errors);
    }

    #[test]
    fn test_parse_cluster_list() {
        let clusters = parse_cluster_list("1:alpha@127.0.0.1:7001, 2:beta@127.0.0.1:7002").unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].name, "beta");
        assert_eq!(clusters[1].address, "127.0.0.1:7002");
        assert!(parse_cluster_list("0:alpha@x").is_err());
        assert!(parse_cluster_list("alpha").is_err());
    }
}
