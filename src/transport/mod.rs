//! Broker Transport
//!
//! The seam between the connection manager and the wire protocol.
//!
//! ## Architecture
//!
//! - **Connector**: opens one connection for a [`ConnectionConfig`]
//! - **Connection**: the live handle; accepts subscribe/unsubscribe/close commands
//! - **EventSink**: how a connection reports back (connect, failure, close,
//!   messages, acknowledgements). Events are tagged with the generation of the
//!   connection that produced them so the manager can ignore a torn-down one.
//!
//! Commands never block and never call back into the manager; every outcome
//! travels through the sink.
//!
//! ## Implementations
//!
//! - [`MqttConnector`]: MQTT 3.1.1 over TCP, TLS, WebSocket or secure WebSocket
//! - [`MemoryBroker`]: in-process broker for tests and the demo mode

mod memory;
mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttConnector;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connection::ConnectionConfig;

/// Something the transport observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the session
    Connected,
    /// The attempt failed, or the transport hit an error
    ConnectFailed(String),
    /// An established session was closed
    Closed,
    /// A message arrived on a topic
    Message { topic: String, payload: Bytes },
    /// The broker answered a subscribe request
    SubscribeAck {
        topic: String,
        result: Result<(), String>,
    },
    /// The broker answered an unsubscribe request
    UnsubscribeAck {
        topic: String,
        result: Result<(), String>,
    },
}

/// An event tagged with the connection generation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEnvelope {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Reporting channel handed to a connection when it is opened
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEnvelope>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<TransportEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the connection this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; returns false once the manager is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Opens broker connections
pub trait Connector: Send + Sync {
    /// Start connecting. Completion is reported through `sink`, never by the
    /// return value; an `Err` means the attempt could not even be started.
    fn open(
        &self,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// A live broker connection
pub trait Connection: Send {
    /// Request a subscription; the outcome arrives as `SubscribeAck`
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Request an unsubscription; the outcome arrives as `UnsubscribeAck`
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Tear the connection down. Must be safe to call more than once.
    fn close(&self);
}

/// Errors raised by transport commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No tokio runtime to drive the network task
    #[error("No async runtime available to drive the broker connection")]
    NoRuntime,

    /// The connection has already been closed
    #[error("Connection is closed")]
    Closed,

    /// The broker could not be reached or refused the session
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
}
