/*!
 # Daemon configuration

 YAML configuration for the daemon: the daily on-window, battery
 voltage calibration, the wifi interface mirrored to the PMU, and the
 heartbeat API endpoint. Malformed configuration is rejected here,
 before any task starts.
*/

use std::path::Path;

use chrono::NaiveTime;
use serde::Deserialize;

use crate::window::RecurringWindow;
use crate::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/pmu-controller.yaml";

fn default_wifi_interface() -> String {
    // If this is changed also change it in _release/10-notify-pmu to match.
    "wlan0".to_string()
}

/// Battery voltage calibration, in raw analog units as sampled by the
/// PMU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Voltages {
    /// Enable reading battery voltage through the PMU
    pub enable: bool,
    /// Readings at or below this are mains power, not a battery
    pub no_battery: u16,
    /// Reading of a low battery
    pub low_battery: u16,
    /// Reading of a full battery
    pub full_battery: u16,
}

/// Heartbeat service endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    pi_wake_time: Option<String>,
    #[serde(default)]
    pi_sleep_time: Option<String>,
    #[serde(default)]
    voltages: Voltages,
    #[serde(default = "default_wifi_interface")]
    wifi_interface: String,
    #[serde(default)]
    api: Option<Api>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Recurring window during which the host may stay powered. The
    /// always-active sentinel when no wake/sleep pair is configured.
    pub on_window: RecurringWindow,
    pub voltages: Voltages,
    pub wifi_interface: String,
    pub api: Option<Api>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &str) -> Result<Config> {
        let raw: RawConfig = serde_yaml::from_str(buf)?;

        let on_window = match (&raw.pi_wake_time, &raw.pi_sleep_time) {
            (Some(wake), Some(sleep)) => RecurringWindow::new(
                parse_time_of_day(wake, "pi-wake-time")?,
                parse_time_of_day(sleep, "pi-sleep-time")?,
            ),
            (None, None) => RecurringWindow::always_active(),
            (Some(_), None) => {
                return Err(Error::Config(
                    "pi-wake-time is set but pi-sleep-time isn't".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Config(
                    "pi-sleep-time is set but pi-wake-time isn't".into(),
                ))
            }
        };

        Ok(Config {
            on_window,
            voltages: raw.voltages,
            wifi_interface: raw.wifi_interface,
            api: raw.api,
        })
    }
}

fn parse_time_of_day(s: &str, field: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| Error::Config(format!("invalid {field} '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config() {
        let conf = Config::parse(
            r#"
pi-wake-time: "07:30"
pi-sleep-time: "22:00"
wifi-interface: wlan1
voltages:
  enable: true
  no-battery: 10
  low-battery: 200
  full-battery: 300
api:
  url: https://liveness.example.org
  token: abc123
"#,
        )
        .unwrap();

        assert_eq!(conf.on_window.to_string(), "07:30 to 22:00");
        assert!(conf.voltages.enable);
        assert_eq!(conf.voltages.no_battery, 10);
        assert_eq!(conf.wifi_interface, "wlan1");
        assert_eq!(conf.api.unwrap().token, "abc123");
    }

    #[test]
    fn empty_config_means_no_window() {
        let conf = Config::parse("{}").unwrap();
        assert!(!conf.on_window.has_window());
        assert!(!conf.voltages.enable);
        assert_eq!(conf.wifi_interface, "wlan0");
        assert!(conf.api.is_none());
    }

    #[test]
    fn wake_without_sleep_is_rejected() {
        let err = Config::parse("pi-wake-time: \"07:30\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("pi-sleep-time isn't"));
    }

    #[test]
    fn sleep_without_wake_is_rejected() {
        let err = Config::parse("pi-sleep-time: \"22:00\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("pi-wake-time isn't"));
    }

    #[test]
    fn unparsable_time_is_rejected() {
        let err = Config::parse("pi-wake-time: \"7 oclock\"\npi-sleep-time: \"22:00\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("pi-wake-time"));
    }

    #[test]
    fn midnight_crossing_window_parses() {
        let conf = Config::parse("pi-wake-time: \"22:10\"\npi-sleep-time: \"09:50\"\n").unwrap();
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let night = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        assert!(!conf.on_window.is_active(noon));
        assert!(conf.on_window.is_active(night));
    }
}
