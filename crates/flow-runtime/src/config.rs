//! Consumer configuration.
//!
//! Every section carries serde defaults so a partial (or empty) document
//! produces a usable configuration; [`ConsumerConfig::validate`] rejects
//! values that would make the engine misbehave.

use crate::error::ConfigurationError;
use crate::message::{Durability, QueueEndpoint, QueueName};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level consumer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub connection: ConnectionSettings,
    pub queue: QueueSettings,
    pub schedule: ScheduleConfig,
    pub reconcile: ReconcilerConfig,
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.connection.validate()?;
        self.queue.endpoint()?;
        self.schedule.validate()?;
        self.reconcile.validate()
    }
}

/// Authentication scheme requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    Basic,
    Kerberos,
}

/// Properties handed to the transport when connecting
///
/// The engine itself never interprets these; they exist so a transport can
/// be configured from the same document as the consumer.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub vpn: Option<String>,
    pub username: String,
    pub password: Option<String>,
    pub auth_scheme: AuthScheme,
    pub validate_certificate: bool,
    /// 0 disables compression, 9 is maximum
    pub compression_level: u8,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "tcp://localhost:55555".to_string(),
            vpn: None,
            username: "default".to_string(),
            password: None,
            auth_scheme: AuthScheme::Basic,
            validate_certificate: true,
            compression_level: 0,
        }
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "connection.host".to_string(),
            });
        }

        if self.username.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "connection.username".to_string(),
            });
        }

        if self.compression_level > 9 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "connection.compression_level must be 0-9, got {}",
                    self.compression_level
                ),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_scheme", &self.auth_scheme)
            .field("validate_certificate", &self.validate_certificate)
            .field("compression_level", &self.compression_level)
            .finish()
    }
}

/// Queue the consumer binds to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    /// Bind to a provisioned durable queue rather than a temporary one
    pub durable: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "demo".to_string(),
            durable: true,
        }
    }
}

impl QueueSettings {
    /// Validated endpoint for these settings
    pub fn endpoint(&self) -> Result<QueueEndpoint, ConfigurationError> {
        let name = QueueName::new(self.name.clone()).map_err(|e| ConfigurationError::Invalid {
            message: format!("queue.name: {}", e),
        })?;

        let durability = if self.durable {
            Durability::Durable
        } else {
            Durability::Temporary
        };

        Ok(QueueEndpoint { name, durability })
    }
}

/// Cadence of the reconciliation task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Delay before the first pass
    pub initial_delay_ms: u64,

    /// Delay between the end of one pass and the start of the next
    pub period_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            period_ms: 5_000,
        }
    }
}

impl ScheduleConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.period_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "schedule.period_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Limits on the rebind-and-rescan protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Rebinds allowed in one pass before yielding to the next tick
    pub max_rebinds_per_pass: u32,

    /// Spacing between consecutive rebinds in one pass
    pub rebind_backoff: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_rebinds_per_pass: 16,
            rebind_backoff: RetryPolicy::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_rebinds_per_pass == 0 {
            return Err(ConfigurationError::Invalid {
                message: "reconcile.max_rebinds_per_pass must be at least 1".to_string(),
            });
        }

        let backoff = &self.rebind_backoff;
        if !backoff.backoff_multiplier.is_finite() || backoff.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: "reconcile.rebind_backoff.backoff_multiplier must be >= 1.0".to_string(),
            });
        }

        if backoff.initial_delay > backoff.max_delay {
            return Err(ConfigurationError::Invalid {
                message: "reconcile.rebind_backoff.initial_delay exceeds max_delay".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&backoff.jitter_percent) {
            return Err(ConfigurationError::Invalid {
                message: "reconcile.rebind_backoff.jitter_percent must be within 0.0-1.0"
                    .to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
