//! # Telegauge
//!
//! Live telemetry gauges over MQTT. Connects to a broker, watches a set of
//! named feeds (topics) and turns whatever each publisher sends into one
//! numeric reading per topic.
//!
//! ## Features
//!
//! - **One connection, many feeds**: every topic is multiplexed over a single
//!   broker session and replayed after each reconnect
//! - **Offline subscriptions**: feeds added while disconnected are kept and
//!   subscribed on the next connect
//! - **Payload normalization**: plain numbers, numeric strings and JSON records
//!   (`{"temperature": 21.4, ...}`) all yield a reading
//! - **Transports**: TCP, TLS, WebSocket and secure WebSocket via rumqttc, plus
//!   an in-memory broker for tests and demos
//!
//! ## Modules
//!
//! - [`connection`]: connection lifecycle and subscription management
//! - [`signal`]: readings and payload normalization
//! - [`transport`]: broker transports
//! - [`feed`]: the feed list a dashboard displays
//! - [`config`]: settings file and environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telegauge::{ConnectionConfig, ConnectionManager, MqttConnector, PayloadNormalizer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (manager, pump) = ConnectionManager::new(
//!         Arc::new(MqttConnector::new()),
//!         ConnectionConfig::default(),
//!         PayloadNormalizer::default(),
//!     );
//!     tokio::spawn(pump.run());
//!
//!     manager.subscribe("wvu-mae411L/group_1", |topic, signal| {
//!         if let Some(reading) = signal.reading() {
//!             println!("{}: {:.1}", topic, reading.value);
//!         }
//!     })?;
//!     manager.connect(manager.config());
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod feed;
pub mod signal;
pub mod transport;

// Re-export top-level types for convenience
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, EventPump, ListenerId, ManagerOptions,
    SubscriptionError, SubscriptionRegistry, TransportScheme,
};

pub use signal::{FeedSignal, Normalized, PayloadNormalizer, Reading};

pub use transport::{
    Connection, Connector, EventSink, MemoryBroker, MqttConnector, TransportEnvelope,
    TransportError, TransportEvent,
};

pub use feed::{Feed, FeedBoard, FeedError, FeedStatus, FeedUpdate};

pub use config::{Config, ConfigError, FeedConfig, LoggingConfig, NormalizerConfig};
