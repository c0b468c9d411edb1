//! Broker Connection
//!
//! Lifecycle and subscription management for the single broker connection a
//! dashboard runs on.
//!
//! ## Architecture
//!
//! - **ConnectionManager**: owns the transport handle and the state machine,
//!   multiplexes every topic subscription over the one connection and replays
//!   them after each reconnect
//! - **SubscriptionRegistry**: desired subscriptions and their broker
//!   acknowledgement, independent of connection state
//! - **EventPump**: feeds transport events into the manager in arrival order
//!
//! ## Usage
//!
//! ```ignore
//! let (manager, pump) = ConnectionManager::new(connector, config, PayloadNormalizer::default());
//! tokio::spawn(pump.run());
//!
//! manager.subscribe("wvu-mae411L/group_1", |topic, signal| {
//!     println!("{}: {:?}", topic, signal);
//! })?;
//! manager.connect(manager.config());
//! ```

mod config;
mod error;
mod manager;
mod registry;
mod state;

pub use config::{default_client_id, ConnectionConfig, ManagerOptions, TransportScheme};
pub use error::{validate_topic, SubscriptionError, MAX_TOPIC_LEN};
pub use manager::{ConnectionManager, EventPump, ListenerId, StatusListener};
pub use registry::{SignalCallback, SubscriptionRegistry};
pub use state::ConnectionState;
