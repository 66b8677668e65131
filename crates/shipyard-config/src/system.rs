//! System configuration parsing.
//!
//! ```kdl
//! queue {
//!     max-active 4
//!     max-pending 16
//!     pending-timeout "10m"
//!     run-timeout "10m"
//!     reconcile-interval "1s"
//!     retention "10m"
//! }
//! retry {
//!     attempts 3
//!     backoff "500ms"
//! }
//! store "postgres" url="postgres://shipyard@localhost/shipyard"
//! ```

use crate::{ConfigError, ConfigResult, parse_duration};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

/// Admission limits and timing of the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs allowed to run build work at the same time.
    pub max_active: usize,
    /// Jobs allowed to wait for an active slot.
    pub max_pending: usize,
    /// How long a job may wait in the pending set.
    pub pending_timeout: Duration,
    /// How long a job's pipeline may run once active.
    pub run_timeout: Duration,
    /// Period of the reconciliation loop.
    pub reconcile_interval: Duration,
    /// How long terminal jobs are kept before they are pruned.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_active: 4,
            max_pending: 16,
            pending_timeout: Duration::from_secs(600),
            run_timeout: Duration::from_secs(600),
            reconcile_interval: Duration::from_secs(1),
            retention: Duration::from_secs(600),
        }
    }
}

/// Retry policy applied to build engine calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Where job records are persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum StoreConfig {
    #[default]
    Memory,
    Postgres { url: String },
}

impl SystemConfig {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        parse_system_config(&content)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "queue" => parse_queue(node, &mut config.queue)?,
            "retry" => parse_retry(node, &mut config.retry)?,
            "store" => config.store = parse_store(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.queue.max_active == 0 {
        return Err(ConfigError::InvalidValue {
            field: "queue.max-active".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.retry.attempts == 0 {
        return Err(ConfigError::InvalidValue {
            field: "retry.attempts".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if config.queue.reconcile_interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "queue.reconcile-interval".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(config)
}

fn parse_queue(node: &KdlNode, queue: &mut QueueConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "max-active" => queue.max_active = get_count_arg(child, "queue.max-active")?,
            "max-pending" => queue.max_pending = get_count_arg(child, "queue.max-pending")?,
            "pending-timeout" => queue.pending_timeout = get_duration_arg(child)?,
            "run-timeout" => queue.run_timeout = get_duration_arg(child)?,
            "reconcile-interval" => queue.reconcile_interval = get_duration_arg(child)?,
            "retention" => queue.retention = get_duration_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_retry(node: &KdlNode, retry: &mut RetryConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "attempts" => {
                let attempts = get_count_arg(child, "retry.attempts")?;
                retry.attempts = u32::try_from(attempts).map_err(|_| ConfigError::InvalidValue {
                    field: "retry.attempts".to_string(),
                    message: format!("{} is too large", attempts),
                })?;
            }
            "backoff" => retry.backoff = get_duration_arg(child)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_store(node: &KdlNode) -> ConfigResult<StoreConfig> {
    let backend = get_first_string_arg(node).unwrap_or_default();

    match backend.as_str() {
        "memory" | "" => Ok(StoreConfig::Memory),
        "postgres" => {
            let url = get_string_prop(node, "url")
                .ok_or_else(|| ConfigError::MissingField("store url".to_string()))?;
            Ok(StoreConfig::Postgres { url })
        }
        _ => Err(ConfigError::InvalidValue {
            field: "store".to_string(),
            message: format!("unknown store backend: {}", backend),
        }),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    get_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_count_arg(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let value = get_first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;

    usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is not a valid count", value),
    })
}

fn get_duration_arg(node: &KdlNode) -> ConfigResult<Duration> {
    let text = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))?;
    parse_duration(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            queue {
                max-active 2
                max-pending 1
                pending-timeout "30s"
                run-timeout "1h"
                reconcile-interval "250ms"
                retention "5m"
            }

            retry {
                attempts 5
                backoff "1s"
            }

            store "postgres" url="postgres://shipyard@localhost/shipyard"
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.queue.max_active, 2);
        assert_eq!(config.queue.max_pending, 1);
        assert_eq!(config.queue.pending_timeout, Duration::from_secs(30));
        assert_eq!(config.queue.run_timeout, Duration::from_secs(3_600));
        assert_eq!(config.queue.reconcile_interval, Duration::from_millis(250));
        assert_eq!(config.queue.retention, Duration::from_secs(300));
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.backoff, Duration::from_secs(1));
        assert_eq!(
            config.store,
            StoreConfig::Postgres {
                url: "postgres://shipyard@localhost/shipyard".to_string()
            }
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.queue.max_active, 4);
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_partial_queue_block() {
        let config = parse_system_config("queue { max-pending 0 }").unwrap();
        assert_eq!(config.queue.max_pending, 0);
        assert_eq!(config.queue.max_active, 4);
    }

    #[test]
    fn test_rejects_zero_active_slots() {
        let result = parse_system_config("queue { max-active 0 }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_zero_reconcile_interval() {
        for value in ["0s", "0ms", "0"] {
            let kdl = format!(r#"queue {{ reconcile-interval "{value}" }}"#);
            match parse_system_config(&kdl) {
                Err(ConfigError::InvalidValue { field, .. }) => {
                    assert_eq!(field, "queue.reconcile-interval")
                }
                other => panic!("expected invalid value for {value}, got {other:?}"),
            }
        }

        let config = parse_system_config(r#"queue { reconcile-interval "1ms" }"#).unwrap();
        assert_eq!(config.queue.reconcile_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_rejects_negative_counts() {
        let result = parse_system_config("queue { max-pending -1 }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_bad_duration() {
        let result = parse_system_config(r#"queue { run-timeout "soon" }"#);
        assert!(matches!(result, Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn test_postgres_store_requires_url() {
        let result = parse_system_config(r#"store "postgres""#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_unknown_store_backend() {
        let result = parse_system_config(r#"store "redis""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
