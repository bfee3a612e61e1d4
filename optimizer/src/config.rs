use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{0} cannot be negative")]
    Negative(&'static str),

    #[error("Port cannot be 0")]
    InvalidPort,
}

/// Tuning of the optimization cycle and the periodic loops.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Pairs with a higher jitter (ms) are not usable edges
    pub max_jitter: f32,
    /// Pairs with a higher packet loss (percent) are not usable edges
    pub max_packet_loss: f32,
    /// Upper bound for a serialized matrix in bytes
    pub matrix_buffer_size: usize,
    /// Minimum improvement in ms for an indirect route to be kept
    pub cost_threshold: i32,
    /// Cost threshold of the customer route matrix
    pub customer_cost_threshold: i32,
    /// Relays of these sellers are left out of the default route matrix
    pub excluded_sellers: Vec<String>,
    pub sample_ttl_secs: u64,
    pub relay_cache_interval_secs: u64,
    pub matrix_interval_secs: u64,
    pub ping_stats_interval_secs: u64,
    pub relay_stats_interval_secs: u64,
    /// Processing units used for segmentation. 0 uses every detected CPU.
    pub num_threads: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            max_jitter: 10.0,
            max_packet_loss: 0.1,
            matrix_buffer_size: 10_000_000,
            cost_threshold: 1,
            customer_cost_threshold: 5,
            excluded_sellers: vec!["valve".into()],
            sample_ttl_secs: 300,
            relay_cache_interval_secs: 1,
            matrix_interval_secs: 1,
            ping_stats_interval_secs: 60,
            relay_stats_interval_secs: 10,
            num_threads: 0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_jitter < 0.0 {
            return Err(ValidationError::Negative("max_jitter"));
        }
        if self.max_packet_loss < 0.0 {
            return Err(ValidationError::Negative("max_packet_loss"));
        }
        if self.cost_threshold < 0 {
            return Err(ValidationError::Negative("cost_threshold"));
        }
        if self.customer_cost_threshold < 0 {
            return Err(ValidationError::Negative("customer_cost_threshold"));
        }

        let positive = [
            ("matrix_buffer_size", self.matrix_buffer_size as u64),
            ("sample_ttl_secs", self.sample_ttl_secs),
            ("relay_cache_interval_secs", self.relay_cache_interval_secs),
            ("matrix_interval_secs", self.matrix_interval_secs),
            ("ping_stats_interval_secs", self.ping_stats_interval_secs),
            ("relay_stats_interval_secs", self.relay_stats_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ValidationError::NotPositive(name));
            }
        }

        Ok(())
    }

    pub fn sample_ttl(&self) -> Duration {
        Duration::from_secs(self.sample_ttl_secs)
    }

    pub fn relay_cache_interval(&self) -> Duration {
        Duration::from_secs(self.relay_cache_interval_secs)
    }

    pub fn matrix_interval(&self) -> Duration {
        Duration::from_secs(self.matrix_interval_secs)
    }

    pub fn ping_stats_interval(&self) -> Duration {
        Duration::from_secs(self.ping_stats_interval_secs)
    }

    pub fn relay_stats_interval(&self) -> Duration {
        Duration::from_secs(self.relay_stats_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum RelayStoreConfig {
    /// JSON array of relays, re-read on every reconciliation
    File { path: String },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum MatrixStoreConfig {
    Filesystem {
        base_dir: String,
    },
    #[default]
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    pub base_dir: String,
}

/// Where relay update messages are received from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SubscriberConfig {
    Udp { host: String, port: u16 },
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig::Udp {
            host: "0.0.0.0".into(),
            port: 40000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub relay_store: RelayStoreConfig,
    #[serde(default)]
    pub matrix_store: MatrixStoreConfig,
    pub archive: Option<ArchiveConfig>,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.optimizer.validate()?;

        match &self.subscriber {
            SubscriberConfig::Udp { port, .. } if *port == 0 => Err(ValidationError::InvalidPort),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let yaml = r#"
relay_store:
  type: file
  path: /etc/relay-optimizer/relays.json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer, OptimizerConfig::default());
        assert_eq!(config.matrix_store, MatrixStoreConfig::Memory);
        assert_eq!(config.archive, None);
        assert_eq!(config.optimizer.matrix_interval(), Duration::from_secs(1));
        assert_eq!(config.optimizer.excluded_sellers, vec!["valve".to_string()]);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
optimizer:
  max_jitter: 5.0
  cost_threshold: 2
  excluded_sellers: []
  num_threads: 4
relay_store:
  type: file
  path: relays.json
matrix_store:
  type: filesystem
  base_dir: /var/lib/relay-optimizer
archive:
  base_dir: /var/lib/relay-optimizer/archive
subscriber:
  type: udp
  host: 127.0.0.1
  port: 41000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer.max_jitter, 5.0);
        assert_eq!(config.optimizer.cost_threshold, 2);
        assert_eq!(config.optimizer.customer_cost_threshold, 5);
        assert!(config.optimizer.excluded_sellers.is_empty());
        assert_eq!(
            config.matrix_store,
            MatrixStoreConfig::Filesystem {
                base_dir: "/var/lib/relay-optimizer".into()
            }
        );
        assert_eq!(
            config.subscriber,
            SubscriberConfig::Udp {
                host: "127.0.0.1".into(),
                port: 41000
            }
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = OptimizerConfig::default();
        config.matrix_interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::NotPositive("matrix_interval_secs"))
        );

        let mut config = OptimizerConfig::default();
        config.cost_threshold = -1;
        assert_eq!(
            config.validate(),
            Err(ValidationError::Negative("cost_threshold"))
        );

        let mut config = OptimizerConfig::default();
        config.matrix_buffer_size = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::NotPositive("matrix_buffer_size"))
        );
    }

    #[test]
    fn test_deserialization_errors() {
        // Missing relay store
        assert!(serde_yaml::from_str::<Config>("optimizer: {}").is_err());

        // Unknown store type
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
relay_store: {type: bigtable, path: x}
"#
            )
            .is_err()
        );
    }
}
