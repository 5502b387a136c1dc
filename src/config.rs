//! Environment-driven configuration. Reads a `.env` file when present, then
//! the process environment; secrets stay wrapped in [`SecretString`] so they
//! never land in logs.

use secrecy::SecretString;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Mqtt,
}

pub struct Settings {
    pub transport: TransportKind,
    /// WebSocket endpoint, e.g. `ws://host:8000/voice/v1/`.
    pub server_url: String,
    /// Stable device identity sent with every connection, usually a MAC.
    pub device_id: String,
    pub client_id: String,
    pub access_token: Option<SecretString>,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<SecretString>,
    /// Remote `host:port` the UDP audio stream is sent to.
    pub mqtt_udp_addr: String,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let transport = match with_default("VOX_TRANSPORT", "websocket").as_str() {
            "websocket" => TransportKind::WebSocket,
            "mqtt" => TransportKind::Mqtt,
            other => {
                return Err(ConfigError::Invalid {
                    name: "VOX_TRANSPORT",
                    value: other.to_string(),
                })
            }
        };

        let mqtt_port = {
            let raw = with_default("VOX_MQTT_PORT", "1883");
            raw.parse().map_err(|_| ConfigError::Invalid {
                name: "VOX_MQTT_PORT",
                value: raw,
            })?
        };

        Ok(Self {
            transport,
            server_url: with_default("VOX_SERVER_URL", "ws://localhost:8000/voice/v1/"),
            device_id: required("VOX_DEVICE_ID")?,
            client_id: with_default("VOX_CLIENT_ID", "voxbridge"),
            access_token: optional("VOX_ACCESS_TOKEN").map(SecretString::from),
            mqtt_host: with_default("VOX_MQTT_HOST", "localhost"),
            mqtt_port,
            mqtt_username: optional("VOX_MQTT_USERNAME"),
            mqtt_password: optional("VOX_MQTT_PASSWORD").map(SecretString::from),
            mqtt_udp_addr: with_default("VOX_MQTT_UDP_ADDR", ""),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn with_default(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}
