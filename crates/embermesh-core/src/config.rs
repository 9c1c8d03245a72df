//! Repeater configuration types
//!
//! Runtime settings for the engine. Hosts load these from a settings file;
//! the persistent subset also round-trips through the engine's storage
//! blocks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default admin password
pub const DEFAULT_ADMIN_PASSWORD: &str = "password";

/// Default guest password
pub const DEFAULT_GUEST_PASSWORD: &str = "hello";

/// Longest usable password (fits a NUL-padded 16-byte field)
pub const MAX_PASSWORD_LEN: usize = 15;

/// Full repeater configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeaterConfig {
    /// Password granting admin permissions
    pub admin_password: String,
    /// Password granting guest permissions
    pub guest_password: String,
    /// Daily status report settings
    pub report: ReportConfig,
    /// New/offline node alert settings
    pub alert: AlertConfig,
    /// Hours during which forwarding budget is reduced
    pub quiet_hours: Option<QuietHours>,
    /// Radio power limits
    pub radio: RadioConfig,
    /// Interval between scheduled self adverts
    #[serde(with = "humantime_serde")]
    pub advert_interval: Duration,
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            guest_password: DEFAULT_GUEST_PASSWORD.to_string(),
            report: ReportConfig::default(),
            alert: AlertConfig::default(),
            quiet_hours: None,
            radio: RadioConfig::default(),
            advert_interval: Duration::from_secs(3600),
        }
    }
}

/// Daily status report settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Send a daily report when true
    pub enabled: bool,
    /// Hour of day (0-23, synced time)
    pub hour: u8,
    /// Minute of hour (0-59)
    pub minute: u8,
    /// Report recipient's public key
    pub dest_pubkey: Option<[u8; 32]>,
}

/// Node alert settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Send new/offline node alerts when true
    pub enabled: bool,
    /// Alert recipient's public key
    pub dest_pubkey: Option<[u8; 32]>,
}

/// Radio power limits in dBm
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Lowest TX power adaptive control may select
    pub min_tx_power_dbm: i8,
    /// Regional ceiling for TX power
    pub max_tx_power_dbm: i8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        // EU868 duty-cycle-friendly default ceiling.
        Self {
            min_tx_power_dbm: 5,
            max_tx_power_dbm: 14,
        }
    }
}

/// A daily window of reduced forwarding, possibly wrapping midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    /// First quiet hour (0-23)
    pub start_hour: u8,
    /// First non-quiet hour (0-23)
    pub end_hour: u8,
}

impl QuietHours {
    /// True when `hour` falls inside the window. A window like 22..6 wraps
    /// overnight; start == end means the window is empty.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

// Helper module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration).to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RepeaterConfig::default();
        assert_eq!(config.admin_password, "password");
        assert_eq!(config.guest_password, "hello");
        assert!(!config.report.enabled);
        assert_eq!(config.radio.max_tx_power_dbm, 14);
    }

    #[test]
    fn config_serialization_round_trip() {
        let config = RepeaterConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let recovered: RepeaterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.admin_password, recovered.admin_password);
        assert_eq!(config.advert_interval, recovered.advert_interval);
    }

    #[test]
    fn quiet_hours_plain_window() {
        let q = QuietHours { start_hour: 9, end_hour: 17 };
        assert!(!q.contains(8));
        assert!(q.contains(9));
        assert!(q.contains(16));
        assert!(!q.contains(17));
    }

    #[test]
    fn quiet_hours_overnight_wrap() {
        let q = QuietHours { start_hour: 22, end_hour: 6 };
        assert!(q.contains(22));
        assert!(q.contains(23));
        assert!(q.contains(0));
        assert!(q.contains(5));
        assert!(!q.contains(6));
        assert!(!q.contains(12));
    }

    #[test]
    fn quiet_hours_empty_window() {
        let q = QuietHours { start_hour: 3, end_hour: 3 };
        for hour in 0..24 {
            assert!(!q.contains(hour));
        }
    }
}
