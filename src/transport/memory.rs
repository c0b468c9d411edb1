//! In-process broker.
//!
//! Stands in for a real MQTT broker in tests and in the demo mode. Nothing
//! happens on its own: the test (or the simulation task) scripts every connect,
//! failure, drop and message. The one exception is the optional connect delay,
//! which completes connection attempts from a spawned task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{Connection, Connector, EventSink, TransportError, TransportEvent};
use crate::connection::ConnectionConfig;

#[derive(Default)]
struct BrokerState {
    attempts: usize,
    connection_id: u64,
    sink: Option<EventSink>,
    last_config: Option<ConnectionConfig>,
    subscriptions: Vec<String>,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: Vec<String>,
    rejected_topics: Vec<String>,
    refuse: Option<String>,
    connect_delay: Option<Duration>,
    closed: usize,
}

/// Scriptable in-memory broker; clones share state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// A broker that only connects when told to via [`accept`](Self::accept)
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that accepts every connection after `delay`.
    ///
    /// Requires a tokio runtime when connections are opened.
    pub fn with_connect_delay(delay: Duration) -> Self {
        let broker = Self::new();
        broker.lock().connect_delay = Some(delay);
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) -> bool {
        match self.lock().sink.as_ref() {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// Complete the pending connection attempt (or a transport-side retry)
    pub fn accept(&self) -> bool {
        self.emit(TransportEvent::Connected)
    }

    /// Report a transport error on the current connection
    pub fn fail(&self, reason: &str) -> bool {
        self.emit(TransportEvent::ConnectFailed(reason.to_string()))
    }

    /// Drop the session from the broker side; the handle stays usable
    pub fn drop_connection(&self) -> bool {
        let mut state = self.lock();
        state.subscriptions.clear();
        match state.sink.as_ref() {
            Some(sink) => sink.emit(TransportEvent::Closed),
            None => false,
        }
    }

    /// Make `open` fail immediately with `reason`, or restore normal behaviour
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.lock().refuse = reason.map(str::to_string);
    }

    /// Answer subscriptions to `topic` with a failure acknowledgement
    pub fn reject_topic(&self, topic: &str) {
        self.lock().rejected_topics.push(topic.to_string());
    }

    /// Undo [`reject_topic`](Self::reject_topic)
    pub fn allow_topic(&self, topic: &str) {
        self.lock().rejected_topics.retain(|t| t != topic);
    }

    /// Deliver a message to the client if it is subscribed to `topic`
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let state = self.lock();
        if !state.subscriptions.iter().any(|t| t == topic) {
            return false;
        }
        match state.sink.as_ref() {
            Some(sink) => sink.emit(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            }),
            None => false,
        }
    }

    /// Deliver a message regardless of subscriptions
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    /// Number of times a connection was opened
    pub fn connect_attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Every subscribe request received, across connections
    pub fn subscribe_calls(&self) -> Vec<String> {
        self.lock().subscribe_calls.clone()
    }

    /// Every unsubscribe request received, across connections
    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.lock().unsubscribe_calls.clone()
    }

    /// Topics the current connection is subscribed to
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// Whether a connection is open
    pub fn is_open(&self) -> bool {
        self.lock().sink.is_some()
    }

    /// Number of connections closed by the client
    pub fn closed_connections(&self) -> usize {
        self.lock().closed
    }

    /// Generation tag of the open connection
    pub fn current_generation(&self) -> Option<u64> {
        self.lock().sink.as_ref().map(EventSink::generation)
    }

    /// Settings passed to the most recent `open`
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.lock().last_config.clone()
    }

    /// Publish a drifting temperature reading on every subscribed topic each
    /// `period`, shaped like a small sensor board would send it.
    pub fn start_simulation(&self, period: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                let topics = broker.subscriptions();
                for (index, topic) in topics.iter().enumerate() {
                    let payload = simulated_payload(tick, index);
                    broker.publish(topic, payload);
                }
                tick += 1;
            }
        })
    }
}

fn simulated_payload(tick: u64, index: usize) -> String {
    let phase = tick as f64 / 6.0 + index as f64;
    let noise = jitter() - 0.5;
    let temperature = 22.0 + 5.0 * phase.sin() + noise;
    serde_json::json!({
        "temperature": (temperature * 100.0).round() / 100.0,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sensor": format!("sim-{}", index + 1),
    })
    .to_string()
}

/// Cheap pseudo-random value in [0, 1)
fn jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

impl Connector for MemoryBroker {
    fn open(
        &self,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut state = self.lock();
        // A delayed accept needs a runtime; fail before touching the broker.
        let runtime = match state.connect_delay {
            Some(delay) => Some((
                Handle::try_current().map_err(|_| TransportError::NoRuntime)?,
                delay,
            )),
            None => None,
        };

        state.attempts += 1;
        state.last_config = Some(config.clone());
        if let Some(reason) = state.refuse.clone() {
            return Err(TransportError::Unreachable(reason));
        }

        state.connection_id += 1;
        state.subscriptions.clear();
        state.sink = Some(sink.clone());
        let id = state.connection_id;

        if let Some((runtime, delay)) = runtime {
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                sink.emit(TransportEvent::Connected);
            });
        }

        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            id,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MemoryConnection {
    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.connection_id != self.id || state.sink.is_none() {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }
}

impl Connection for MemoryConnection {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.subscribe_calls.push(topic.to_string());

        let result = if state.rejected_topics.iter().any(|t| t == topic) {
            Err("not authorized".to_string())
        } else {
            if !state.subscriptions.iter().any(|t| t == topic) {
                state.subscriptions.push(topic.to_string());
            }
            Ok(())
        };

        if let Some(sink) = state.sink.as_ref() {
            sink.emit(TransportEvent::SubscribeAck {
                topic: topic.to_string(),
                result,
            });
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.unsubscribe_calls.push(topic.to_string());
        state.subscriptions.retain(|t| t != topic);

        if let Some(sink) = state.sink.as_ref() {
            sink.emit(TransportEvent::UnsubscribeAck {
                topic: topic.to_string(),
                result: Ok(()),
            });
        }
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.sink = None;
            state.subscriptions.clear();
            state.closed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEnvelope;
    use tokio::sync::mpsc;

    fn open(broker: &MemoryBroker) -> (Box<dyn Connection>, mpsc::UnboundedReceiver<TransportEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = broker
            .open(&ConnectionConfig::default(), EventSink::new(1, tx))
            .unwrap();
        (connection, rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<TransportEnvelope>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    #[test]
    fn test_scripted_connect() {
        let broker = MemoryBroker::new();
        assert!(!broker.accept());

        let (_connection, mut rx) = open(&broker);
        assert!(events(&mut rx).is_empty());
        assert!(broker.accept());
        assert_eq!(events(&mut rx), vec![TransportEvent::Connected]);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[test]
    fn test_subscribe_acknowledged_and_published() {
        let broker = MemoryBroker::new();
        let (connection, mut rx) = open(&broker);

        connection.subscribe("lab/a").unwrap();
        assert!(broker.publish("lab/a", "1.0"));
        assert!(!broker.publish("lab/b", "2.0"));

        assert_eq!(
            events(&mut rx),
            vec![
                TransportEvent::SubscribeAck {
                    topic: "lab/a".to_string(),
                    result: Ok(())
                },
                TransportEvent::Message {
                    topic: "lab/a".to_string(),
                    payload: Bytes::from_static(b"1.0")
                },
            ]
        );
        assert_eq!(broker.subscriptions(), vec!["lab/a"]);
    }

    #[test]
    fn test_rejected_topic() {
        let broker = MemoryBroker::new();
        broker.reject_topic("secret");
        let (connection, mut rx) = open(&broker);

        connection.subscribe("secret").unwrap();
        assert!(matches!(
            events(&mut rx).as_slice(),
            [TransportEvent::SubscribeAck { result: Err(_), .. }]
        ));
        assert!(broker.subscriptions().is_empty());
    }

    #[test]
    fn test_closed_connection_rejects_commands() {
        let broker = MemoryBroker::new();
        let (connection, _rx) = open(&broker);

        connection.close();
        connection.close();
        assert!(!broker.is_open());
        assert_eq!(broker.closed_connections(), 1);
        assert_eq!(connection.subscribe("a"), Err(TransportError::Closed));
        assert_eq!(connection.unsubscribe("a"), Err(TransportError::Closed));
    }

    #[test]
    fn test_stale_handle_cannot_touch_new_connection() {
        let broker = MemoryBroker::new();
        let (old, _old_rx) = open(&broker);
        let (_new, _new_rx) = open(&broker);

        old.close();
        assert!(broker.is_open());
        assert_eq!(old.subscribe("a"), Err(TransportError::Closed));
    }

    #[test]
    fn test_refused_connections() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(Some("offline"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = broker.open(&ConnectionConfig::default(), EventSink::new(1, tx));
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
        assert_eq!(broker.connect_attempts(), 1);

        broker.refuse_connections(None);
        let (_connection, _rx) = open(&broker);
        assert!(broker.is_open());
    }

    #[test]
    fn test_delayed_open_without_runtime_leaves_broker_closed() {
        let broker = MemoryBroker::with_connect_delay(Duration::from_millis(10));
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = broker.open(&ConnectionConfig::default(), EventSink::new(1, tx));

        assert!(matches!(result, Err(TransportError::NoRuntime)));
        assert!(!broker.is_open());
        assert_eq!(broker.current_generation(), None);
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[test]
    fn test_simulated_payload_shape() {
        let payload: serde_json::Value =
            serde_json::from_str(&simulated_payload(3, 0)).unwrap();
        assert!(payload["temperature"].is_f64());
        assert_eq!(payload["sensor"], "sim-1");
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_connect_delay_and_simulation() {
        let broker = MemoryBroker::with_connect_delay(Duration::from_millis(5));
        let (connection, mut rx) = open(&broker);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event, TransportEvent::Connected);

        connection.subscribe("lab/a").unwrap();
        let _ack = rx.recv().await.unwrap();

        let simulation = broker.start_simulation(Duration::from_millis(10));
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        simulation.abort();

        match message.event {
            TransportEvent::Message { topic, .. } => assert_eq!(topic, "lab/a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
