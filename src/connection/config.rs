//! Broker connection settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How the MQTT session is carried to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportScheme {
    /// Plain TCP (`tcp://`, `mqtt://`)
    #[serde(alias = "mqtt")]
    Tcp,
    /// TCP with TLS (`ssl://`, `mqtts://`, `tls://`)
    #[serde(alias = "ssl", alias = "mqtts")]
    Tls,
    /// WebSocket (`ws://`)
    Ws,
    /// WebSocket over TLS (`wss://`)
    Wss,
}

impl TransportScheme {
    /// URL scheme used when rendering the broker address
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportScheme::Tcp => "tcp",
            TransportScheme::Tls => "ssl",
            TransportScheme::Ws => "ws",
            TransportScheme::Wss => "wss",
        }
    }

    /// Whether the session runs over a WebSocket
    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportScheme::Ws | TransportScheme::Wss)
    }
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => Ok(TransportScheme::Tcp),
            "ssl" | "tls" | "mqtts" => Ok(TransportScheme::Tls),
            "ws" => Ok(TransportScheme::Ws),
            "wss" => Ok(TransportScheme::Wss),
            other => Err(format!("unknown transport scheme '{}'", other)),
        }
    }
}

/// Settings for the single broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_scheme")]
    pub scheme: TransportScheme,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Request path for WebSocket transports
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Delay before the transport retries a lost connection; 0 disables retries
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,

    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_host() -> String {
    "broker.emqx.io".to_string()
}

fn default_port() -> u16 {
    8083
}

fn default_scheme() -> TransportScheme {
    TransportScheme::Ws
}

/// Generate a client identifier of the form `telegauge_<6 hex chars>`
pub fn default_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("telegauge_{}", &id[..6])
}

fn default_path() -> String {
    "/mqtt".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_period() -> u64 {
    5000
}

fn default_clean_session() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheme: default_scheme(),
            client_id: default_client_id(),
            path: default_path(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_period_ms: default_reconnect_period(),
            clean_session: default_clean_session(),
        }
    }
}

impl ConnectionConfig {
    /// Settings for a broker at `host:port` using `scheme`
    pub fn new(host: impl Into<String>, port: u16, scheme: TransportScheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            ..Default::default()
        }
    }

    /// Override the client identifier
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Broker address as `scheme://host:port`, with the request path for WebSockets
    pub fn broker_url(&self) -> String {
        if self.scheme.is_websocket() {
            let path = if self.path.starts_with('/') {
                self.path.clone()
            } else {
                format!("/{}", self.path)
            };
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// `host:port` as shown next to the connect button
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tuning for the connection manager itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// Subscriptions replayed per logged batch after a reconnect
    #[serde(default = "default_replay_chunk_size")]
    pub replay_chunk_size: usize,
}

fn default_replay_chunk_size() -> usize {
    50
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            replay_chunk_size: default_replay_chunk_size(),
        }
    }
}
