//! Node configuration parsing.
//!
//! Every setting has a default, so an empty document is a valid config.

use crate::kdl_ext::{require_bool_arg, require_string_arg, require_u64_arg};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_RECONCILE_SECS: u64 = 60;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECORDER_QUEUE: usize = 256;

/// Per-process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Value written to `claimed_by`. Generated when unset.
    pub instance_id: Option<String>,
    pub database_url: Option<String>,
    /// Age after which a claim without heartbeat is abandoned.
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub reconcile_interval: Duration,
    /// Deadline applied to every store call.
    pub store_timeout: Duration,
    pub recorder_queue_size: usize,
    pub log_json: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            database_url: None,
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_SECS),
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            recorder_queue_size: DEFAULT_RECORDER_QUEUE,
            log_json: false,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("claims.lease-ttl-secs", self.lease_ttl),
            ("claims.heartbeat-secs", self.heartbeat_interval),
            ("reconcile.interval-secs", self.reconcile_interval),
            ("store.call-timeout-secs", self.store_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.heartbeat_interval >= self.lease_ttl {
            return Err(invalid(
                "claims.heartbeat-secs",
                "must be shorter than the lease TTL",
            ));
        }

        if self.recorder_queue_size == 0 {
            return Err(invalid("recorder.queue-size", "must be greater than zero"));
        }

        Ok(())
    }
}

/// Parse node configuration from KDL text.
pub fn parse_node_config(kdl: &str) -> ConfigResult<NodeConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = NodeConfig::default();

    for section in doc.nodes() {
        let section_name = section.name().value();
        for setting in settings(section) {
            let key = setting.name().value();
            match (section_name, key) {
                ("node", "instance-id") => {
                    config.instance_id = Some(require_string_arg(setting)?)
                }
                ("node", "database-url") => {
                    config.database_url = Some(require_string_arg(setting)?)
                }
                ("claims", "lease-ttl-secs") => {
                    config.lease_ttl = Duration::from_secs(require_u64_arg(setting)?)
                }
                ("claims", "heartbeat-secs") => {
                    config.heartbeat_interval = Duration::from_secs(require_u64_arg(setting)?)
                }
                ("reconcile", "interval-secs") => {
                    config.reconcile_interval = Duration::from_secs(require_u64_arg(setting)?)
                }
                ("store", "call-timeout-secs") => {
                    config.store_timeout = Duration::from_secs(require_u64_arg(setting)?)
                }
                ("recorder", "queue-size") => {
                    config.recorder_queue_size = usize::try_from(require_u64_arg(setting)?)
                        .map_err(|_| invalid("recorder.queue-size", "out of range"))?
                }
                ("log", "json") => config.log_json = require_bool_arg(setting)?,
                _ => {
                    return Err(invalid(
                        &format!("{}.{}", section_name, key),
                        "unknown setting",
                    ));
                }
            }
        }
    }

    config.validate()?;
    Ok(config)
}

/// Read and parse a node configuration file.
pub fn load_node_config(path: impl AsRef<Path>) -> ConfigResult<NodeConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_node_config(&text)
}

fn settings(section: &KdlNode) -> &[KdlNode] {
    section.children().map(|c| c.nodes()).unwrap_or(&[])
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_node_config("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            node {
                instance-id "node-a"
                database-url "postgres://localhost/jobmesh"
            }
            claims {
                lease-ttl-secs 20
                heartbeat-secs 5
            }
            reconcile {
                interval-secs 15
            }
            store {
                call-timeout-secs 2
            }
            recorder {
                queue-size 16
            }
            log {
                json #true
            }
        "#;

        let config = parse_node_config(kdl).unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("node-a"));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/jobmesh")
        );
        assert_eq!(config.lease_ttl, Duration::from_secs(20));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reconcile_interval, Duration::from_secs(15));
        assert_eq!(config.store_timeout, Duration::from_secs(2));
        assert_eq!(config.recorder_queue_size, 16);
        assert!(config.log_json);
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_lease() {
        let kdl = r#"
            claims {
                lease-ttl-secs 10
                heartbeat-secs 10
            }
        "#;

        let err = parse_node_config(kdl).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "claims.heartbeat-secs"));
    }

    #[test]
    fn test_unknown_setting_is_rejected() {
        let kdl = r#"
            claims {
                lease-ttl 10
            }
        "#;

        assert!(matches!(
            parse_node_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_wrong_value_type() {
        let kdl = r#"
            reconcile {
                interval-secs "often"
            }
        "#;

        assert!(parse_node_config(kdl).is_err());
    }
}
