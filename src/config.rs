use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, TxError};
use crate::xid::DEFAULT_FORMAT_ID;

/// Settings of one transaction domain.
///
/// A zero timeout means transactions never time out. A zero maximum
/// timeout disables clamping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DomainConfig {
    pub name: String,
    pub default_timeout: Duration,
    pub maximum_timeout: Duration,
    pub max_active: usize,
    pub timer_interval: Duration,
    pub format_id: u32,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_timeout: Duration::from_secs(60),
            maximum_timeout: Duration::from_secs(3600),
            max_active: 10_000,
            timer_interval: Duration::from_millis(500),
            format_id: DEFAULT_FORMAT_ID,
        }
    }
}

impl DomainConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_maximum_timeout(mut self, timeout: Duration) -> Self {
        self.maximum_timeout = timeout;
        self
    }

    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_timer_interval(mut self, interval: Duration) -> Self {
        self.timer_interval = interval;
        self
    }

    pub fn with_format_id(mut self, format_id: u32) -> Self {
        self.format_id = format_id;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TxError::Config("domain name must not be empty".to_string()));
        }
        if self.timer_interval.is_zero() {
            return Err(TxError::Config(format!(
                "timer interval of domain {} must be positive",
                self.name
            )));
        }
        if self.max_active == 0 {
            return Err(TxError::Config(format!(
                "domain {} must allow at least one active transaction",
                self.name
            )));
        }
        if !self.maximum_timeout.is_zero() && self.default_timeout > self.maximum_timeout {
            return Err(TxError::Config(format!(
                "default timeout {:?} of domain {} exceeds the maximum {:?}",
                self.default_timeout, self.name, self.maximum_timeout
            )));
        }
        Ok(())
    }

    /// Applies the maximum timeout to a requested one.
    pub fn clamp_timeout(&self, timeout: Duration) -> Duration {
        if self.maximum_timeout.is_zero() {
            return timeout;
        }
        if timeout.is_zero() || timeout > self.maximum_timeout {
            self.maximum_timeout
        } else {
            timeout
        }
    }
}
