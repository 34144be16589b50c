use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Must exceed the refresh margin of the IoT Hub token cache.
const MIN_SAS_TTL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// MqttConfig
// ---------------------------------------------------------------------------

/// Where the sensor feed is published.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// IoT Hub device connection string. Absent only in store-only mode.
    pub connection_string: Option<String>,
    /// When `false` readings are queued but never forwarded.
    pub relay_enabled: bool,
    /// Relay tick period.
    pub tick_period: Duration,
    /// Upper bound on a single delivery call.
    pub delivery_timeout: Duration,
    /// Lifetime of each Shared Access Signature.
    pub sas_ttl: Duration,
    /// Identity stamped on every reading taken from the feed.
    pub device_id: String,
    pub mqtt: MqttConfig,
    pub server_host: String,
    pub server_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests need not touch the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let relay_enabled = parse_bool(&optional("RELAY_ENABLED", "true"))
            .context("RELAY_ENABLED must be true or false")?;

        let connection_string = lookup("IOTHUB_DEVICE_CONNECTION_STRING").filter(|s| !s.is_empty());
        if relay_enabled && connection_string.is_none() {
            bail!(
                "missing required env var: IOTHUB_DEVICE_CONNECTION_STRING \
                 (set RELAY_ENABLED=false to only store readings locally)"
            );
        }

        let tick_ms: u64 = optional("MESSAGE_TIMESPAN_MS", "2000")
            .parse()
            .context("MESSAGE_TIMESPAN_MS must be a positive integer")?;
        if tick_ms == 0 {
            bail!("MESSAGE_TIMESPAN_MS must be a positive integer");
        }

        let delivery_timeout_secs: u64 = optional("DELIVERY_TIMEOUT_SECS", "10")
            .parse()
            .context("DELIVERY_TIMEOUT_SECS must be a positive integer")?;
        if delivery_timeout_secs == 0 {
            bail!("DELIVERY_TIMEOUT_SECS must be a positive integer");
        }

        let sas_ttl_secs: u64 = optional("SAS_TOKEN_TTL_SECS", "3600")
            .parse()
            .context("SAS_TOKEN_TTL_SECS must be a positive integer")?;
        if sas_ttl_secs <= MIN_SAS_TTL_SECS {
            bail!("SAS_TOKEN_TTL_SECS must be greater than {MIN_SAS_TTL_SECS}");
        }

        let username = lookup("MQTT_USERNAME").filter(|s| !s.is_empty());
        let password = lookup("MQTT_PASSWORD");
        if username.is_none() && password.is_some() {
            bail!("MQTT_PASSWORD is set but MQTT_USERNAME is not");
        }

        Ok(Self {
            database_path: optional("DATABASE_PATH", "sensordata.db"),
            connection_string,
            relay_enabled,
            tick_period: Duration::from_millis(tick_ms),
            delivery_timeout: Duration::from_secs(delivery_timeout_secs),
            sas_ttl: Duration::from_secs(sas_ttl_secs),
            device_id: optional("DEVICE_ID", "pi"),
            mqtt: MqttConfig {
                host: optional("MQTT_HOST", "localhost"),
                port: optional("MQTT_PORT", "1883")
                    .parse()
                    .context("MQTT_PORT must be a valid port number")?,
                topic: optional("MQTT_TOPIC", "esp32/bme280_data"),
                client_id: optional("MQTT_CLIENT_ID", "sensor-relay"),
                username,
                password,
            },
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("not a boolean: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_connection_string_is_set() {
        let c = config(&[("IOTHUB_DEVICE_CONNECTION_STRING", "HostName=h")]).unwrap();
        assert!(c.relay_enabled);
        assert_eq!(c.tick_period, Duration::from_millis(2000));
        assert_eq!(c.delivery_timeout, Duration::from_secs(10));
        assert_eq!(c.database_path, "sensordata.db");
        assert_eq!(c.device_id, "pi");
        assert_eq!(c.mqtt.topic, "esp32/bme280_data");
        assert_eq!(c.mqtt.port, 1883);
        assert!(c.mqtt.username.is_none());
    }

    #[test]
    fn connection_string_is_required_when_relaying() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("IOTHUB_DEVICE_CONNECTION_STRING"));
    }

    #[test]
    fn store_only_mode_needs_no_connection_string() {
        let c = config(&[("RELAY_ENABLED", "false")]).unwrap();
        assert!(!c.relay_enabled);
        assert!(c.connection_string.is_none());
    }

    #[test]
    fn tick_period_is_read_in_milliseconds() {
        let c = config(&[("RELAY_ENABLED", "no"), ("MESSAGE_TIMESPAN_MS", "250")]).unwrap();
        assert_eq!(c.tick_period, Duration::from_millis(250));
    }

    #[test]
    fn zero_or_garbage_tick_period_is_rejected() {
        assert!(config(&[("RELAY_ENABLED", "false"), ("MESSAGE_TIMESPAN_MS", "0")]).is_err());
        let err = config(&[("RELAY_ENABLED", "false"), ("MESSAGE_TIMESPAN_MS", "soon")])
            .unwrap_err();
        assert!(err.to_string().contains("MESSAGE_TIMESPAN_MS"));
    }

    #[test]
    fn invalid_relay_flag_is_rejected() {
        let err = config(&[("RELAY_ENABLED", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("RELAY_ENABLED"));
    }

    #[test]
    fn broker_credentials_are_optional() {
        let c = config(&[
            ("RELAY_ENABLED", "false"),
            ("MQTT_USERNAME", "tmqtt"),
            ("MQTT_PASSWORD", "hunter2"),
        ])
        .unwrap();
        assert_eq!(c.mqtt.username.as_deref(), Some("tmqtt"));
        assert_eq!(c.mqtt.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn zero_delivery_timeout_is_rejected() {
        let err = config(&[("RELAY_ENABLED", "false"), ("DELIVERY_TIMEOUT_SECS", "0")])
            .unwrap_err();
        assert!(err.to_string().contains("DELIVERY_TIMEOUT_SECS"));
    }

    #[test]
    fn sas_ttl_must_outlast_the_refresh_margin() {
        for ttl in ["0", "60"] {
            let err = config(&[("RELAY_ENABLED", "false"), ("SAS_TOKEN_TTL_SECS", ttl)])
                .unwrap_err();
            assert!(err.to_string().contains("SAS_TOKEN_TTL_SECS"), "ttl {ttl}");
        }
        let c = config(&[("RELAY_ENABLED", "false"), ("SAS_TOKEN_TTL_SECS", "61")]).unwrap();
        assert_eq!(c.sas_ttl, Duration::from_secs(61));
    }

    #[test]
    fn broker_password_without_username_is_rejected() {
        let err = config(&[("RELAY_ENABLED", "false"), ("MQTT_PASSWORD", "hunter2")])
            .unwrap_err();
        assert!(err.to_string().contains("MQTT_USERNAME"));
    }
}
