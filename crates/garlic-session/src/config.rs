//! Session tuning parameters

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("tag guard margin ({margin}s) must be shorter than the sent-tag lifetime ({lifetime}s)")]
    GuardMargin { margin: u64, lifetime: u64 },
    #[error("window lifetime ({window}s) must exceed the resend interval ({resend}s)")]
    WindowTooShort { window: u64, resend: u64 },
}

/// Timing constants and pool sizes for one local identity's sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Age after which an unacknowledged send is re-encrypted
    pub resend_interval_secs: u64,
    /// Absolute lifetime of an entry in the outstanding-send window
    pub window_lifetime_secs: u64,
    /// How long a minted batch waits for its refresh acknowledgment
    pub pending_tag_lifetime_secs: u64,
    /// Lifetime of tags we handed out
    pub sent_tag_lifetime_secs: u64,
    /// Lifetime of tags we received
    pub received_tag_lifetime_secs: u64,
    /// Sent tags this close to expiry are no longer used
    pub tag_guard_margin_secs: u64,
    /// Refill once the usable pool drops to this many tags
    pub low_watermark: usize,
    /// Tags minted per refill
    pub refill_batch: usize,
    /// Append a separate ack clove for explicit acks even when a
    /// tag-refresh ack clove is already present
    pub explicit_ack_clove: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resend_interval_secs: 15,
            window_lifetime_secs: 120,
            pending_tag_lifetime_secs: 120,
            sent_tag_lifetime_secs: 30 * 60,
            received_tag_lifetime_secs: 17 * 60,
            tag_guard_margin_secs: 3 * 60,
            low_watermark: 7,
            refill_batch: 15,
            explicit_ack_clove: true,
        }
    }
}

impl SessionConfig {
    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resend_interval_secs == 0 {
            return Err(ConfigError::Zero("resend_interval_secs"));
        }
        if self.refill_batch == 0 {
            return Err(ConfigError::Zero("refill_batch"));
        }
        if self.received_tag_lifetime_secs == 0 {
            return Err(ConfigError::Zero("received_tag_lifetime_secs"));
        }
        if self.pending_tag_lifetime_secs == 0 {
            return Err(ConfigError::Zero("pending_tag_lifetime_secs"));
        }
        if self.tag_guard_margin_secs >= self.sent_tag_lifetime_secs {
            return Err(ConfigError::GuardMargin {
                margin: self.tag_guard_margin_secs,
                lifetime: self.sent_tag_lifetime_secs,
            });
        }
        if self.window_lifetime_secs <= self.resend_interval_secs {
            return Err(ConfigError::WindowTooShort {
                window: self.window_lifetime_secs,
                resend: self.resend_interval_secs,
            });
        }
        Ok(())
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    /// Maintenance tick period: a quarter of the resend interval
    pub fn tick_interval(&self) -> Duration {
        self.resend_interval() / 4
    }

    pub fn window_lifetime(&self) -> Duration {
        Duration::from_secs(self.window_lifetime_secs)
    }

    pub fn pending_tag_lifetime(&self) -> Duration {
        Duration::from_secs(self.pending_tag_lifetime_secs)
    }

    /// Usable lifetime of a sent tag: full lifetime minus the guard margin
    pub fn usable_sent_tag_lifetime(&self) -> Duration {
        Duration::from_secs(
            self.sent_tag_lifetime_secs
                .saturating_sub(self.tag_guard_margin_secs),
        )
    }

    pub fn received_tag_lifetime(&self) -> Duration {
        Duration::from_secs(self.received_tag_lifetime_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_millis(3750));
        assert_eq!(config.usable_sent_tag_lifetime(), Duration::from_secs(27 * 60));
    }

    #[test]
    fn test_guard_margin_must_fit() {
        let config = SessionConfig {
            tag_guard_margin_secs: 1800,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::GuardMargin { .. })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "low_watermark": 3, "refill_batch": 5 }"#).unwrap();
        assert_eq!(config.low_watermark, 3);
        assert_eq!(config.refill_batch, 5);
        assert_eq!(config.resend_interval_secs, 15);
    }
}
