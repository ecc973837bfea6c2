use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Dht2MqttError, Result};

/// Shortest publish interval; the sensor hangs if read more often than every ~2s.
pub const MIN_INTERVAL_SECS: u64 = 3;
const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_BROKER_HOST: &str = "localhost";
const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";

/// GPIO chip and line offsets wired to the sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorPins {
    pub chip: String,
    pub data: u32,
    pub power: Option<u32>,
    pub led: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// Explicit client id; a persistent session is requested when set.
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub pins: SensorPins,
    pub broker: BrokerConfig,
    pub topic: String,
    pub interval: Duration,
}

impl ServiceConfig {
    /// Load configuration from the environment, reading `.env` first if present.
    pub fn new() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let chip = get("DHT_GPIO_CHIP").unwrap_or_else(|| DEFAULT_GPIO_CHIP.to_string());
        let data: u32 = parse_required(&get, "DHT_GPIO")?;
        let power: Option<u32> = parse_optional(&get, "DHT_POWER_GPIO")?;
        let led: Option<u32> = parse_optional(&get, "DHT_LED_GPIO")?;

        let topic = get("MQTT_TOPIC")
            .map(|t| t.trim_end_matches('/').to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| missing("MQTT_TOPIC"))?;

        let interval_secs =
            parse_optional(&get, "SAMPLE_INTERVAL_SECS")?.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_secs < MIN_INTERVAL_SECS {
            return Err(Dht2MqttError::Config(format!(
                "SAMPLE_INTERVAL_SECS must be at least {} seconds, got {}",
                MIN_INTERVAL_SECS, interval_secs
            )));
        }

        let keep_alive_secs =
            parse_optional(&get, "MQTT_KEEP_ALIVE_SECS")?.unwrap_or(DEFAULT_KEEP_ALIVE_SECS);
        if keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(Dht2MqttError::Config(format!(
                "MQTT_KEEP_ALIVE_SECS must be at least {} seconds, got {}",
                MIN_KEEP_ALIVE_SECS, keep_alive_secs
            )));
        }

        let broker = BrokerConfig {
            host: get("MQTT_BROKER_HOST").unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string()),
            port: parse_optional(&get, "MQTT_BROKER_PORT")?.unwrap_or(DEFAULT_BROKER_PORT),
            keep_alive: Duration::from_secs(keep_alive_secs),
            client_id: get("MQTT_CLIENT_ID"),
        };

        Ok(ServiceConfig {
            pins: SensorPins {
                chip,
                data,
                power,
                led,
            },
            broker,
            topic,
            interval: Duration::from_secs(interval_secs),
        })
    }
}

fn missing(key: &str) -> Dht2MqttError {
    Dht2MqttError::Config(format!("{} environment variable not set", key))
}

fn parse_optional<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Dht2MqttError::Config(format!("Invalid {} '{}': {}", key, raw, e)))
        })
        .transpose()
}

fn parse_required<T, G>(get: &G, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    parse_optional(get, key)?.ok_or_else(|| missing(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServiceConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DHT_GPIO", "4"), ("MQTT_TOPIC", "home/attic/")]).unwrap();
        assert_eq!(
            config.pins,
            SensorPins {
                chip: "/dev/gpiochip0".to_string(),
                data: 4,
                power: None,
                led: None
            }
        );
        assert_eq!(config.topic, "home/attic");
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.keep_alive, Duration::from_secs(60));
        assert_eq!(config.broker.client_id, None);
    }

    #[test]
    fn test_full() {
        let config = load(&[
            ("DHT_GPIO_CHIP", "/dev/gpiochip4"),
            ("DHT_GPIO", "4"),
            ("DHT_POWER_GPIO", "17"),
            ("DHT_LED_GPIO", "27"),
            ("MQTT_TOPIC", "garage"),
            ("SAMPLE_INTERVAL_SECS", "10"),
            ("MQTT_BROKER_HOST", "broker.lan"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_KEEP_ALIVE_SECS", "30"),
            ("MQTT_CLIENT_ID", "garage-dht"),
        ])
        .unwrap();
        assert_eq!(config.pins.chip, "/dev/gpiochip4");
        assert_eq!(config.pins.power, Some(17));
        assert_eq!(config.pins.led, Some(27));
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.broker.host, "broker.lan");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.client_id.as_deref(), Some("garage-dht"));
    }

    #[test]
    fn test_missing_required() {
        assert!(load(&[("MQTT_TOPIC", "x")]).is_err());
        assert!(load(&[("DHT_GPIO", "4")]).is_err());
        assert!(load(&[("DHT_GPIO", "4"), ("MQTT_TOPIC", "  ")]).is_err());
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("DHT_GPIO", "four"), ("MQTT_TOPIC", "x")]).unwrap_err();
        assert!(err.to_string().contains("DHT_GPIO"));
        assert!(load(&[
            ("DHT_GPIO", "4"),
            ("MQTT_TOPIC", "x"),
            ("SAMPLE_INTERVAL_SECS", "2")
        ])
        .is_err());
        assert!(load(&[
            ("DHT_GPIO", "4"),
            ("MQTT_TOPIC", "x"),
            ("MQTT_BROKER_PORT", "70000")
        ])
        .is_err());
    }

    #[test]
    fn test_empty_optional_is_unset() {
        let config = load(&[
            ("DHT_GPIO", "4"),
            ("MQTT_TOPIC", "x"),
            ("DHT_POWER_GPIO", ""),
            ("MQTT_CLIENT_ID", " "),
        ])
        .unwrap();
        assert_eq!(config.pins.power, None);
        assert_eq!(config.broker.client_id, None);
    }
}
