//! Configuration loading from YAML
//!
//! # Configuration File Format
//!
//! ```yaml
//! PollInterval: 30s
//! PollAheadTime: 50ms
//! PollTimeout: 2s
//! PushTimeout: 1s
//! MiioPort: 54321
//!
//! MQTT:
//!   BrokerURL: tcp://localhost:1883
//!
//! Models:
//!   zhimi.airmonitor.v1:
//!     Params: [power, usb_state, aqi, battery, time_state, night_state]
//!
//! Devices:
//!   Air Monitor:
//!     Address: 192.168.1.40
//!     Topic: home/living/airmon
//!     Token: 9c3b2d1da5beceee2808a3d3653b485d
//!   Smart Plug:
//!     ID: 120575413
//!     Topic: home/kitchen/plug
//!     Token: 00112233445566778899aabbccddeeff
//!
//! Properties:
//!   "on": 1
//!   "off": 0
//! ```
//!
//! Durations accept a bare number (seconds) or a string with a unit suffix
//! (`ms`, `s`, `m`, `h`). A device entry needs a `Topic`, a 32-hex-character
//! `Token`, and at least one of `Address` / `ID`. The `Models` mapping is
//! merged over a built-in `"*"` default; `Properties` is the alias table
//! applied to polled values and defaults to `{"on": 1, "off": 0}`.

use crate::error::{Error, Result};
use crate::miio::model::Models;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_MIIO_PORT: u16 = 54321;

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Poll cycle cadence; cycles start on multiples of this interval
    #[serde(
        rename = "PollInterval",
        default = "default_poll_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_interval: Duration,

    /// How far ahead of the aligned tick a cycle fires
    #[serde(
        rename = "PollAheadTime",
        default = "default_poll_ahead_time",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_ahead_time: Duration,

    /// Per-cycle time budget for discovery and polling
    #[serde(
        rename = "PollTimeout",
        default = "default_poll_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_timeout: Duration,

    /// MQTT connect-retry pause and graceful-disconnect budget
    #[serde(
        rename = "PushTimeout",
        default = "default_push_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub push_timeout: Duration,

    #[serde(rename = "MQTT", default)]
    pub mqtt: MqttConfig,

    /// UDP port the devices listen on (and the daemon binds to)
    #[serde(rename = "MiioPort", default = "default_miio_port")]
    pub miio_port: u16,

    #[serde(rename = "Models", default)]
    pub models: Models,

    #[serde(rename = "Devices", default)]
    pub devices: HashMap<String, DeviceConfig>,

    /// Alias table applied element-wise during property assembly
    #[serde(rename = "Properties", default = "default_properties")]
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MqttConfig {
    #[serde(rename = "BrokerURL", default)]
    pub broker_url: String,
}

/// Static per-device configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Preset IPv4 address; may be empty when `ID` is given
    #[serde(rename = "Address", default)]
    pub address: String,

    /// Preset device id; may be zero when `Address` is given
    #[serde(rename = "ID", default)]
    pub id: u32,

    /// MQTT topic the device state is published to
    #[serde(rename = "Topic", default)]
    pub topic: String,

    /// Device token, hex-encoded (exactly 32 characters)
    #[serde(rename = "Token", default)]
    pub token: String,
}

impl DeviceConfig {
    /// Decoded 16-byte token
    pub fn token_bytes(&self) -> Result<[u8; 16]> {
        let bytes = hex::decode(&self.token)
            .map_err(|err| Error::Config(format!("invalid token {:?}: {}", self.token, err)))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Config(format!("invalid token length {:?}", self.token)))
    }

    /// Parsed preset address, `None` when not configured
    pub fn ipv4(&self) -> Result<Option<Ipv4Addr>> {
        if self.address.is_empty() {
            return Ok(None);
        }
        self.address
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid IPv4 address: {}", self.address)))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            poll_interval: default_poll_interval(),
            poll_ahead_time: default_poll_ahead_time(),
            poll_timeout: default_poll_timeout(),
            push_timeout: default_push_timeout(),
            mqtt: MqttConfig::default(),
            miio_port: DEFAULT_MIIO_PORT,
            models: Models::default(),
            devices: HashMap::new(),
            properties: default_properties(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let content = fs::read_to_string(&path).map_err(|err| {
            Error::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        Config::parse(&content)
    }

    /// Parse a YAML document and apply defaults and validation
    pub fn parse(content: &str) -> Result<Config> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.models.ensure_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fatal startup checks: token shape, address syntax, topic presence
    fn validate(&self) -> Result<()> {
        for (name, device) in &self.devices {
            device
                .token_bytes()
                .map_err(|err| Error::Config(format!("{}: {}", name, err)))?;
            device
                .ipv4()
                .map_err(|err| Error::Config(format!("{}: {}", name, err)))?;
            if device.topic.is_empty() {
                return Err(Error::Config(format!("{}: missing MQTT topic", name)));
            }
        }
        if self.poll_timeout > self.poll_interval {
            return Err(Error::Config(format!(
                "PollTimeout ({:?}) must not exceed PollInterval ({:?})",
                self.poll_timeout, self.poll_interval
            )));
        }
        Ok(())
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_ahead_time() -> Duration {
    Duration::from_millis(1)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_miio_port() -> u16 {
    DEFAULT_MIIO_PORT
}

fn default_properties() -> HashMap<String, Value> {
    HashMap::from([
        ("on".to_string(), Value::from(1)),
        ("off".to_string(), Value::from(0)),
    ])
}

mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration (seconds or a string like \"250ms\", \"5s\", \"2m\")")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            if value < 0 {
                return Err(E::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Duration, E> {
            if !value.is_finite() || value < 0.0 {
                return Err(E::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs_f64(value))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse(value).ok_or_else(|| E::custom(format!("invalid duration: {:?}", value)))
        }
    }

    pub(super) fn parse(text: &str) -> Option<Duration> {
        let text = text.trim();
        let unit_start = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(unit_start);
        let value: f64 = number.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        let scale = match unit.trim() {
            "ms" => 0.001,
            "" | "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        Some(Duration::from_secs_f64(value * scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
PollInterval: 30s
PollAheadTime: 50ms
PollTimeout: 2s
MiioPort: 54321
MQTT:
  BrokerURL: tcp://localhost:1883
Models:
  zhimi.airmonitor.v1:
    Params: [power, usb_state, aqi, battery]
Devices:
  Air Monitor:
    Address: 192.168.1.40
    Topic: home/living/airmon
    Token: 9c3b2d1da5beceee2808a3d3653b485d
  Smart Plug:
    ID: 120575413
    Topic: home/kitchen/plug
    Token: 00112233445566778899aabbccddeeff
Properties:
  "on": 1
  "off": 0
  "idle": standby
"#;

    #[test]
    fn test_parse_full_document() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.poll_ahead_time, Duration::from_millis(50));
        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.push_timeout, Duration::from_secs(1)); // default
        assert_eq!(config.miio_port, 54321);
        assert_eq!(config.mqtt.broker_url, "tcp://localhost:1883");
        assert_eq!(config.devices.len(), 2);

        let monitor = &config.devices["Air Monitor"];
        assert_eq!(monitor.ipv4().unwrap(), Some(Ipv4Addr::new(192, 168, 1, 40)));
        assert_eq!(monitor.token_bytes().unwrap()[0], 0x9c);

        let plug = &config.devices["Smart Plug"];
        assert_eq!(plug.id, 120_575_413);
        assert_eq!(plug.ipv4().unwrap(), None);

        assert_eq!(config.properties["on"], Value::from(1));
        assert_eq!(config.properties["idle"], Value::from("standby"));
    }

    #[test]
    fn test_defaults_apply_to_empty_document() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll_ahead_time, Duration::from_millis(1));
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.miio_port, 54321);
        assert!(config.devices.is_empty());
        assert_eq!(config.properties["on"], Value::from(1));
        assert_eq!(config.properties["off"], Value::from(0));
        // The wildcard model entry is injected.
        assert!(!config.models.miio_info("*").is_empty());
    }

    #[test]
    fn test_custom_models_keep_wildcard_defaults() {
        let config = Config::parse(
            "Models:\n  zhimi.airmonitor.v1:\n    Params: [power]\n",
        )
        .unwrap();
        assert_eq!(config.models.params("zhimi.airmonitor.v1"), vec!["power"]);
        assert!(!config.models.get_prop("unknown.model").is_empty());
    }

    #[test]
    fn test_duration_forms() {
        assert_eq!(duration::parse("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(duration::parse("5s"), Some(Duration::from_secs(5)));
        assert_eq!(duration::parse("2m"), Some(Duration::from_secs(120)));
        assert_eq!(duration::parse("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(duration::parse("10"), Some(Duration::from_secs(10)));
        assert_eq!(duration::parse("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(duration::parse("5 s"), Some(Duration::from_secs(5)));
        assert_eq!(duration::parse("week"), None);
        assert_eq!(duration::parse("5d"), None);

        let config = Config::parse("PollInterval: 10\n").unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_token_is_fatal() {
        let bad_hex = r#"
Devices:
  Plug:
    ID: 1
    Topic: home/plug
    Token: zz112233445566778899aabbccddeeff
"#;
        assert!(matches!(Config::parse(bad_hex), Err(Error::Config(_))));

        let short = r#"
Devices:
  Plug:
    ID: 1
    Topic: home/plug
    Token: 00112233
"#;
        assert!(matches!(Config::parse(short), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_address_is_fatal() {
        let content = r#"
Devices:
  Plug:
    Address: 300.1.2.3
    Topic: home/plug
    Token: 00112233445566778899aabbccddeeff
"#;
        assert!(matches!(Config::parse(content), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_topic_is_fatal() {
        let content = r#"
Devices:
  Plug:
    ID: 1
    Token: 00112233445566778899aabbccddeeff
"#;
        assert!(matches!(Config::parse(content), Err(Error::Config(_))));
    }

    #[test]
    fn test_poll_timeout_must_fit_interval() {
        let content = "PollInterval: 1s\nPollTimeout: 5s\n";
        assert!(matches!(Config::parse(content), Err(Error::Config(_))));
    }
}
