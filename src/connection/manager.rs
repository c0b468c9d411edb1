//! Connection Manager
//!
//! Owns the single broker connection and everything that depends on it:
//! the lifecycle state machine, the subscription registry, the latest reading
//! per topic and the status listeners.
//!
//! ## State machine
//!
//! ```text
//! Disconnected | Errored --connect()-------> Connecting
//! Connecting | Errored  --connect event----> Connected   (replays every topic)
//! Connecting | Connected --error event-----> Errored
//! Connected            --close event-----> Disconnected (topics kept)
//! Connecting           --close event-----> Errored
//! any                  --disconnect()----> Disconnected
//! ```
//!
//! A connection closed by the broker keeps its handle, so the transport's own
//! retry can bring the state back to `Connected`. An explicit `disconnect()`
//! drops the handle and bumps the generation; late events from it are ignored.
//!
//! ## Reentrancy
//!
//! The internal lock is never held while user code runs (signal callbacks,
//! status listeners) or while a connection is closed, so callbacks may call
//! back into the manager, including `disconnect()`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch, Notify};

use super::config::{ConnectionConfig, ManagerOptions};
use super::error::{validate_topic, SubscriptionError};
use super::registry::{SignalCallback, SubscriptionRegistry};
use super::state::ConnectionState;
use crate::signal::{FeedSignal, Normalized, PayloadNormalizer, Reading};
use crate::transport::{Connection, Connector, EventSink, TransportEnvelope, TransportEvent};

/// Listener notified on every connection state change
pub type StatusListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Handle returned by [`ConnectionManager::on_status_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    config: ConnectionConfig,
    state: ConnectionState,
    connection: Option<Box<dyn Connection>>,
    generation: u64,
    registry: SubscriptionRegistry,
    latest: HashMap<String, Reading>,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_listener_id: u64,
    transitions: u64,
    notified: u64,
}

/// A state change waiting to be announced to the listeners
#[derive(Debug, Clone, Copy)]
struct Transition {
    state: ConnectionState,
    seq: u64,
}

/// Cheaply cloneable handle to the one broker connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Mutex<Inner>>,
    options: ManagerOptions,
    connector: Arc<dyn Connector>,
    normalizer: Arc<PayloadNormalizer>,
    status_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<TransportEnvelope>,
    shutdown: Arc<Notify>,
}

/// Drives transport events into the manager
pub struct EventPump {
    manager: ConnectionManager,
    events: mpsc::UnboundedReceiver<TransportEnvelope>,
    shutdown: Arc<Notify>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// The returned [`EventPump`] must be driven (`run` on a task, or `drain`)
    /// for transport events to take effect.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        normalizer: PayloadNormalizer,
    ) -> (Self, EventPump) {
        Self::with_options(connector, config, normalizer, ManagerOptions::default())
    }

    /// [`new`](Self::new) with explicit manager tuning
    pub fn with_options(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        normalizer: PayloadNormalizer,
        options: ManagerOptions,
    ) -> (Self, EventPump) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shutdown = Arc::new(Notify::new());

        let manager = Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                state: ConnectionState::Disconnected,
                connection: None,
                generation: 0,
                registry: SubscriptionRegistry::new(),
                latest: HashMap::new(),
                listeners: Vec::new(),
                next_listener_id: 0,
                transitions: 0,
                notified: 0,
            })),
            options,
            connector,
            normalizer: Arc::new(normalizer),
            status_tx: Arc::new(status_tx),
            events_tx,
            shutdown: Arc::clone(&shutdown),
        };

        let pump = EventPump {
            manager: manager.clone(),
            events,
            shutdown,
        };

        (manager, pump)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect with the given settings.
    ///
    /// Returns immediately; the outcome is observed through [`status`](Self::status)
    /// or the status notifications. Calling this while `Connecting` or
    /// `Connected` with the same settings does nothing; with different
    /// settings it runs a disconnect/reconnect cycle.
    pub fn connect(&self, config: ConnectionConfig) {
        let mut inner = self.lock();
        if inner.state.is_active() {
            if inner.config == config {
                tracing::debug!(state = %inner.state, "connect ignored, attempt already active");
                return;
            }
            drop(inner);
            self.update_config(config);
            return;
        }
        inner.config = config;
        drop(inner);

        self.start_attempt();
    }

    /// Tear the connection down. Safe to call in any state.
    ///
    /// Registered topics are kept and replayed on the next connect.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        let connection = inner.connection.take();
        if connection.is_none() && inner.state == ConnectionState::Disconnected {
            return;
        }

        inner.generation += 1;
        inner.registry.reset_confirmations();
        let transition = self.set_state(&mut inner, ConnectionState::Disconnected);
        drop(inner);

        if let Some(connection) = connection {
            connection.close();
        }
        tracing::info!("Disconnected from broker");

        if let Some(transition) = transition {
            self.notify(transition);
        }
    }

    /// Replace the broker settings; forces a reconnect when a connection is active
    pub fn update_config(&self, config: ConnectionConfig) {
        let mut inner = self.lock();
        let was_active = inner.state.is_active();
        inner.config = config;
        drop(inner);

        if was_active {
            tracing::info!("Broker settings changed, reconnecting");
            self.disconnect();
            self.start_attempt();
        }
    }

    /// Disconnect and stop the event pump
    pub fn shutdown(&self) {
        self.disconnect();
        self.shutdown.notify_one();
    }

    fn start_attempt(&self) {
        let mut inner = self.lock();
        if inner.state.is_active() {
            return;
        }

        // A handle left over from a closed or failed session is replaced.
        let stale = inner.connection.take();
        inner.generation += 1;
        inner.registry.reset_confirmations();
        let generation = inner.generation;
        let config = inner.config.clone();
        let connecting = self.set_state(&mut inner, ConnectionState::Connecting);

        tracing::info!(
            url = %config.broker_url(),
            client_id = %config.client_id,
            "Connecting to broker"
        );

        let sink = EventSink::new(generation, self.events_tx.clone());
        let opened = self.connector.open(&config, sink);
        let errored = match opened {
            Ok(connection) => {
                inner.connection = Some(connection);
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "Broker connection could not be started");
                self.set_state(&mut inner, ConnectionState::Errored)
            }
        };
        drop(inner);

        if let Some(stale) = stale {
            stale.close();
        }
        for transition in [connecting, errored].into_iter().flatten() {
            self.notify(transition);
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register `callback` for every message on `topic`.
    ///
    /// Returns `Ok(true)` when the subscription was sent to a connected broker
    /// and `Ok(false)` when it was recorded for replay on the next connect.
    /// A second call for the same topic replaces the callback.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<bool, SubscriptionError>
    where
        F: Fn(&str, FeedSignal) + Send + Sync + 'static,
    {
        self.subscribe_shared(topic, Arc::new(callback))
    }

    /// [`subscribe`](Self::subscribe) with an already shared callback
    pub fn subscribe_shared(
        &self,
        topic: &str,
        callback: SignalCallback,
    ) -> Result<bool, SubscriptionError> {
        validate_topic(topic)?;

        let mut guard = self.lock();
        let inner = &mut *guard;
        let is_new = inner.registry.upsert(topic, callback);

        if inner.state != ConnectionState::Connected {
            tracing::debug!(topic = %topic, state = %inner.state, "Subscription queued until connected");
            return Ok(false);
        }

        // Already sent on this connection, acked or not; a rejected topic
        // waits for the next replay.
        if !is_new {
            tracing::debug!(topic = %topic, "Callback replaced on existing subscription");
            return Ok(true);
        }

        if let Some(connection) = inner.connection.as_ref() {
            if let Err(err) = connection.subscribe(topic) {
                tracing::warn!(topic = %topic, error = %err, "Subscribe request failed");
            }
        }
        Ok(true)
    }

    /// Stop delivering messages for `topic`. Safe to call in any state.
    pub fn unsubscribe(&self, topic: &str) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let removed = inner.registry.remove(topic);
        inner.latest.remove(topic);

        if !removed {
            return;
        }

        if inner.state == ConnectionState::Connected {
            if let Some(connection) = inner.connection.as_ref() {
                if let Err(err) = connection.unsubscribe(topic) {
                    tracing::warn!(topic = %topic, error = %err, "Unsubscribe request failed");
                }
            }
        }
        tracing::debug!(topic = %topic, "Unsubscribed");
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Current connection state
    pub fn status(&self) -> ConnectionState {
        self.lock().state
    }

    /// Receiver that always holds the latest connection state
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    /// Call `listener` on every connection state change
    pub fn on_status_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    /// Current broker settings
    pub fn config(&self) -> ConnectionConfig {
        self.lock().config.clone()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Registered topics in registration order
    pub fn topics(&self) -> Vec<String> {
        self.lock().registry.topics()
    }

    /// Topics not yet acknowledged by the broker
    pub fn pending_topics(&self) -> Vec<String> {
        self.lock().registry.pending()
    }

    /// Whether the broker acknowledged the topic on the current connection
    pub fn is_confirmed(&self, topic: &str) -> bool {
        self.lock().registry.is_confirmed(topic)
    }

    /// Number of registered topics
    pub fn subscription_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Most recent reading for a topic
    pub fn latest_reading(&self, topic: &str) -> Option<Reading> {
        self.lock().latest.get(topic).cloned()
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Apply one transport event
    pub fn handle_event(&self, envelope: TransportEnvelope) {
        let TransportEnvelope { generation, event } = envelope;
        match event {
            TransportEvent::Connected => self.on_connected(generation),
            TransportEvent::ConnectFailed(reason) => self.on_failure(generation, &reason),
            TransportEvent::Closed => self.on_closed(generation),
            TransportEvent::Message { topic, payload } => {
                self.on_message(generation, &topic, &payload)
            }
            TransportEvent::SubscribeAck { topic, result } => {
                self.on_subscribe_ack(generation, &topic, result)
            }
            TransportEvent::UnsubscribeAck { topic, result } => match result {
                Ok(()) => tracing::debug!(topic = %topic, "Broker confirmed unsubscribe"),
                Err(reason) => {
                    tracing::warn!(topic = %topic, reason = %reason, "Broker rejected unsubscribe")
                }
            },
        }
    }

    fn on_connected(&self, generation: u64) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.generation != generation || inner.connection.is_none() {
            tracing::trace!(generation, "Ignoring connect from a stale connection");
            return;
        }
        if inner.state == ConnectionState::Connected {
            return;
        }

        let transition = self.set_state(inner, ConnectionState::Connected);
        inner.registry.reset_confirmations();
        let topics = inner.registry.topics();
        tracing::info!(
            broker = %inner.config.address(),
            subscriptions = topics.len(),
            "Connected to broker"
        );

        if let Some(connection) = inner.connection.as_ref() {
            let chunk_size = self.options.replay_chunk_size.max(1);
            let chunks = topics.len().div_ceil(chunk_size);
            for (index, chunk) in topics.chunks(chunk_size).enumerate() {
                if chunks > 1 {
                    tracing::debug!(chunk = index + 1, of = chunks, topics = chunk.len(), "Replaying subscriptions");
                }
                for topic in chunk {
                    if let Err(err) = connection.subscribe(topic) {
                        tracing::warn!(topic = %topic, error = %err, "Resubscribe request failed");
                    }
                }
            }
        }
        drop(guard);

        if let Some(transition) = transition {
            self.notify(transition);
        }
    }

    fn on_failure(&self, generation: u64, reason: &str) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if !inner.state.is_active() {
            tracing::debug!(reason = %reason, state = %inner.state, "Transport error while not connected");
            return;
        }

        tracing::warn!(reason = %reason, "Broker connection error");
        inner.registry.reset_confirmations();
        let transition = self.set_state(&mut inner, ConnectionState::Errored);
        drop(inner);

        if let Some(transition) = transition {
            self.notify(transition);
        }
    }

    fn on_closed(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        let next = match inner.state {
            ConnectionState::Connected => ConnectionState::Disconnected,
            ConnectionState::Connecting => ConnectionState::Errored,
            _ => return,
        };

        tracing::info!(state = %next, "Broker connection closed");
        inner.registry.reset_confirmations();
        let transition = self.set_state(&mut inner, next);
        drop(inner);

        if let Some(transition) = transition {
            self.notify(transition);
        }
    }

    fn on_message(&self, generation: u64, topic: &str, payload: &[u8]) {
        let callback = {
            let inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.registry.callback(topic)
        };

        let Some(callback) = callback else {
            tracing::trace!(topic = %topic, "Dropping message for unregistered topic");
            return;
        };

        let signal = match self.normalizer.normalize(payload) {
            Normalized::Value(value) => {
                let reading = Reading::new(topic, value);
                let mut inner = self.lock();
                if inner.registry.has(topic) {
                    inner.latest.insert(topic.to_string(), reading.clone());
                }
                FeedSignal::Reading(reading)
            }
            Normalized::NoSignal => {
                tracing::debug!(topic = %topic, bytes = payload.len(), "Payload carried no numeric value");
                FeedSignal::NoSignal
            }
        };

        callback(topic, signal);
    }

    fn on_subscribe_ack(&self, generation: u64, topic: &str, result: Result<(), String>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        match result {
            Ok(()) => {
                if inner.state == ConnectionState::Connected && inner.registry.mark_confirmed(topic) {
                    tracing::info!(topic = %topic, "Subscribed");
                }
            }
            Err(reason) => {
                inner.registry.mark_unconfirmed(topic);
                tracing::warn!(
                    topic = %topic,
                    reason = %reason,
                    "Broker rejected subscription, will retry on reconnect"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Notification
    // ------------------------------------------------------------------

    fn set_state(&self, inner: &mut Inner, next: ConnectionState) -> Option<Transition> {
        if inner.state == next {
            return None;
        }
        tracing::debug!(from = %inner.state, to = %next, "Connection state change");
        inner.state = next;
        inner.transitions += 1;
        self.status_tx.send_replace(next);
        Some(Transition {
            state: next,
            seq: inner.transitions,
        })
    }

    /// Announce a state change unless a later one was already announced.
    ///
    /// Listeners run without the lock, so two threads racing through state
    /// changes could otherwise deliver them out of order.
    fn notify(&self, transition: Transition) {
        let listeners: Vec<StatusListener> = {
            let mut inner = self.lock();
            if transition.seq <= inner.notified {
                tracing::trace!(state = %transition.state, "Skipping superseded status notification");
                return;
            }
            inner.notified = transition.seq;
            inner
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };

        for listener in listeners {
            listener(transition.state);
        }
    }
}

impl EventPump {
    /// Process events until [`ConnectionManager::shutdown`] is called
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                next = self.events.recv() => match next {
                    Some(envelope) => self.manager.handle_event(envelope),
                    None => break,
                },
            }
        }
        tracing::debug!("Event pump stopped");
    }

    /// Process every event already queued; returns how many were handled
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.events.try_recv() {
            self.manager.handle_event(envelope);
            handled += 1;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Received = Arc<Mutex<Vec<(String, FeedSignal)>>>;

    fn setup() -> (ConnectionManager, EventPump, MemoryBroker) {
        let broker = MemoryBroker::new();
        let (manager, pump) = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig::default(),
            PayloadNormalizer::default(),
        );
        (manager, pump, broker)
    }

    fn recorder() -> (Received, impl Fn(&str, FeedSignal) + Send + Sync + 'static) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        (received, move |topic: &str, signal: FeedSignal| {
            sink.lock().unwrap().push((topic.to_string(), signal));
        })
    }

    fn connect(manager: &ConnectionManager, pump: &mut EventPump, broker: &MemoryBroker) {
        manager.connect(manager.config());
        assert!(broker.accept());
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Connected);
    }

    #[test]
    fn test_initial_state() {
        let (manager, _pump, broker) = setup();
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[test]
    fn test_connect_is_idempotent_while_connecting() {
        let (manager, _pump, broker) = setup();

        manager.connect(manager.config());
        manager.connect(manager.config());

        assert_eq!(manager.status(), ConnectionState::Connecting);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[test]
    fn test_connect_ignored_while_connected() {
        let (manager, mut pump, broker) = setup();
        connect(&manager, &mut pump, &broker);

        manager.connect(manager.config());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.status(), ConnectionState::Connected);
    }

    #[test]
    fn test_pending_subscriptions_replayed_once() {
        let (manager, mut pump, broker) = setup();
        let (_received, callback) = recorder();

        assert_eq!(manager.subscribe("lab/a", callback), Ok(false));
        assert_eq!(manager.subscribe("lab/b", |_: &str, _: FeedSignal| {}), Ok(false));
        assert_eq!(manager.pending_topics(), vec!["lab/a", "lab/b"]);
        assert!(broker.subscribe_calls().is_empty());

        connect(&manager, &mut pump, &broker);
        assert_eq!(broker.subscribe_calls(), vec!["lab/a", "lab/b"]);

        pump.drain();
        assert!(manager.is_confirmed("lab/a"));
        assert!(manager.is_confirmed("lab/b"));
        assert!(manager.pending_topics().is_empty());
    }

    #[test]
    fn test_subscribe_while_connected_is_active() {
        let (manager, mut pump, broker) = setup();
        connect(&manager, &mut pump, &broker);

        assert_eq!(manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}), Ok(true));
        assert_eq!(broker.subscribe_calls(), vec!["lab/a"]);
        assert!(!manager.is_confirmed("lab/a"));

        pump.drain();
        assert!(manager.is_confirmed("lab/a"));
    }

    #[test]
    fn test_invalid_topic_has_no_side_effects() {
        let (manager, mut pump, broker) = setup();
        connect(&manager, &mut pump, &broker);

        let result = manager.subscribe("", |_: &str, _: FeedSignal| {});
        assert_eq!(result, Err(SubscriptionError::EmptyTopic));
        assert!(matches!(
            manager.subscribe("lab/+", |_: &str, _: FeedSignal| {}),
            Err(SubscriptionError::Wildcard(_))
        ));
        assert_eq!(manager.subscription_count(), 0);
        assert!(broker.subscribe_calls().is_empty());
    }

    #[test]
    fn test_second_subscribe_replaces_callback() {
        let (manager, mut pump, broker) = setup();
        let (first, first_cb) = recorder();
        let (second, second_cb) = recorder();

        manager.subscribe("lab/a", first_cb).unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();
        manager.subscribe("lab/a", second_cb).unwrap();

        broker.publish("lab/a", "21.5");
        pump.drain();

        assert!(first.lock().unwrap().is_empty());
        let second = second.lock().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1.reading().map(|r| r.value), Some(21.5));
        assert_eq!(broker.subscribe_calls(), vec!["lab/a"]);
    }

    #[test]
    fn test_unsubscribe_then_subscribe_leaves_one_callback() {
        let (manager, mut pump, broker) = setup();
        let (old, old_cb) = recorder();
        let (new, new_cb) = recorder();

        connect(&manager, &mut pump, &broker);
        manager.subscribe("lab/a", old_cb).unwrap();
        pump.drain();

        manager.unsubscribe("lab/a");
        manager.subscribe("lab/a", new_cb).unwrap();
        pump.drain();

        broker.publish("lab/a", r#"{"temperature": 19.0}"#);
        pump.drain();

        assert!(old.lock().unwrap().is_empty());
        assert_eq!(new.lock().unwrap().len(), 1);
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(broker.unsubscribe_calls(), vec!["lab/a"]);
    }

    #[test]
    fn test_unsubscribe_while_disconnected_is_local_only() {
        let (manager, _pump, broker) = setup();
        manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}).unwrap();

        manager.unsubscribe("lab/a");
        manager.unsubscribe("lab/a");
        manager.unsubscribe("never/registered");

        assert_eq!(manager.subscription_count(), 0);
        assert!(broker.unsubscribe_calls().is_empty());
    }

    #[test]
    fn test_message_delivers_reading_and_keeps_latest() {
        let (manager, mut pump, broker) = setup();
        let (received, callback) = recorder();
        manager.subscribe("lab/a", callback).unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();

        assert!(manager.latest_reading("lab/a").is_none());
        broker.publish("lab/a", "20.0");
        broker.publish("lab/a", r#"{"temp": 20.25, "unit": "C"}"#);
        pump.drain();

        let received = received.lock().unwrap();
        let values: Vec<_> = received
            .iter()
            .filter_map(|(_, s)| s.reading().map(|r| r.value))
            .collect();
        assert_eq!(values, vec![20.0, 20.25]);
        assert_eq!(manager.latest_reading("lab/a").map(|r| r.value), Some(20.25));
    }

    #[test]
    fn test_unparseable_payload_delivers_no_signal() {
        let (manager, mut pump, broker) = setup();
        let (received, callback) = recorder();
        manager.subscribe("lab/a", callback).unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();

        broker.publish("lab/a", r#"{"status":"ok"}"#);
        pump.drain();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], ("lab/a".to_string(), FeedSignal::NoSignal));
        assert!(manager.latest_reading("lab/a").is_none());
    }

    #[test]
    fn test_message_for_unregistered_topic_dropped() {
        let (manager, mut pump, broker) = setup();
        let (received, callback) = recorder();
        manager.subscribe("lab/a", callback).unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();

        broker.inject("lab/unknown", "42");
        pump.drain();

        assert!(received.lock().unwrap().is_empty());
        assert!(manager.latest_reading("lab/unknown").is_none());
        assert_eq!(manager.topics(), vec!["lab/a"]);
    }

    #[test]
    fn test_message_before_ack_is_dispatched() {
        let (manager, mut pump, broker) = setup();
        let (received, callback) = recorder();
        manager.subscribe("lab/a", callback).unwrap();
        manager.connect(manager.config());
        broker.accept();
        broker.inject("lab/a", "5");
        pump.drain();

        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disconnect_keeps_registry_and_reconnect_restores() {
        let (manager, mut pump, broker) = setup();
        let (received, callback) = recorder();
        manager.subscribe("lab/a", callback).unwrap();
        manager.subscribe("lab/b", |_: &str, _: FeedSignal| {}).unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();

        manager.disconnect();
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(manager.topics(), vec!["lab/a", "lab/b"]);
        assert!(!manager.is_confirmed("lab/a"));
        assert!(!broker.is_open());

        connect(&manager, &mut pump, &broker);
        pump.drain();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.subscribe_calls(), vec!["lab/a", "lab/b", "lab/a", "lab/b"]);
        assert!(manager.is_confirmed("lab/a"));

        broker.publish("lab/a", "1.5");
        pump.drain();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (manager, _pump, broker) = setup();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        manager.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.disconnect();
        manager.disconnect();
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        manager.connect(manager.config());
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(broker.closed_connections(), 1);
    }

    #[test]
    fn test_broker_close_keeps_topics_and_recovers() {
        let (manager, mut pump, broker) = setup();
        manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}).unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();

        broker.drop_connection();
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(manager.pending_topics(), vec!["lab/a"]);

        // The transport's own retry reconnects the same handle.
        assert!(broker.accept());
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.subscribe_calls(), vec!["lab/a", "lab/a"]);
    }

    #[test]
    fn test_error_does_not_retry() {
        let (manager, mut pump, broker) = setup();
        manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}).unwrap();

        manager.connect(manager.config());
        assert!(broker.fail("connection refused"));
        pump.drain();

        assert_eq!(manager.status(), ConnectionState::Errored);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.topics(), vec!["lab/a"]);

        manager.connect(manager.config());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(manager.status(), ConnectionState::Connecting);
    }

    #[test]
    fn test_genuine_connect_recovers_from_error() {
        let (manager, mut pump, broker) = setup();
        manager.connect(manager.config());
        broker.fail("timeout");
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Errored);

        broker.accept();
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Connected);
    }

    #[test]
    fn test_close_while_connecting_is_an_error() {
        let (manager, mut pump, broker) = setup();
        manager.connect(manager.config());
        broker.drop_connection();
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Errored);
    }

    #[test]
    fn test_refused_open_goes_to_errored() {
        let (manager, _pump, broker) = setup();
        broker.refuse_connections(Some("no route to host"));
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        manager.on_status_change(move |state| seen.lock().unwrap().push(state));

        manager.connect(manager.config());

        assert_eq!(manager.status(), ConnectionState::Errored);
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Errored]
        );
    }

    #[test]
    fn test_rejected_subscription_waits_for_reconnect() {
        let (manager, mut pump, broker) = setup();
        broker.reject_topic("lab/locked");
        connect(&manager, &mut pump, &broker);

        assert_eq!(manager.subscribe("lab/locked", |_: &str, _: FeedSignal| {}), Ok(true));
        pump.drain();
        assert!(!manager.is_confirmed("lab/locked"));
        assert_eq!(manager.pending_topics(), vec!["lab/locked"]);
        assert_eq!(broker.subscribe_calls(), vec!["lab/locked"]);

        broker.allow_topic("lab/locked");
        manager.disconnect();
        connect(&manager, &mut pump, &broker);
        pump.drain();
        assert!(manager.is_confirmed("lab/locked"));
        assert_eq!(broker.subscribe_calls(), vec!["lab/locked", "lab/locked"]);
    }

    #[test]
    fn test_resubscribing_rejected_topic_sends_nothing_until_reconnect() {
        let (manager, mut pump, broker) = setup();
        broker.reject_topic("lab/locked");
        connect(&manager, &mut pump, &broker);

        manager.subscribe("lab/locked", |_: &str, _: FeedSignal| {}).unwrap();
        pump.drain();
        assert!(!manager.is_confirmed("lab/locked"));

        let (received, callback) = recorder();
        assert_eq!(manager.subscribe("lab/locked", callback), Ok(true));
        pump.drain();
        assert_eq!(broker.subscribe_calls(), vec!["lab/locked"]);
        assert_eq!(manager.pending_topics(), vec!["lab/locked"]);

        // The replaced callback still receives whatever the broker delivers.
        broker.inject("lab/locked", "4.5");
        pump.drain();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_resubscribe_before_ack_sends_once() {
        let (manager, mut pump, broker) = setup();
        connect(&manager, &mut pump, &broker);

        assert_eq!(manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}), Ok(true));
        assert_eq!(manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}), Ok(true));
        assert_eq!(broker.subscribe_calls(), vec!["lab/a"]);

        pump.drain();
        assert!(manager.is_confirmed("lab/a"));
        assert_eq!(manager.subscription_count(), 1);
    }

    #[test]
    fn test_stale_events_ignored() {
        let (manager, mut pump, broker) = setup();
        connect(&manager, &mut pump, &broker);
        let stale_generation = broker.current_generation().unwrap();
        manager.disconnect();

        manager.handle_event(TransportEnvelope {
            generation: stale_generation,
            event: TransportEvent::Connected,
        });
        assert_eq!(manager.status(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_from_callback() {
        let (manager, mut pump, broker) = setup();
        let handle = manager.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager
            .subscribe("lab/a", move |_: &str, _: FeedSignal| {
                counter.fetch_add(1, Ordering::SeqCst);
                handle.disconnect();
            })
            .unwrap();
        connect(&manager, &mut pump, &broker);
        pump.drain();

        broker.publish("lab/a", "1");
        broker.publish("lab/a", "2");
        pump.drain();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(manager.topics(), vec!["lab/a"]);
    }

    #[test]
    fn test_status_listeners() {
        let (manager, mut pump, broker) = setup();
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        let id = manager.on_status_change(move |state| seen.lock().unwrap().push(state));

        connect(&manager, &mut pump, &broker);
        manager.disconnect();
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );

        assert!(manager.remove_status_listener(id));
        assert!(!manager.remove_status_listener(id));
        manager.connect(manager.config());
        assert_eq!(states.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_superseded_notification_is_skipped() {
        let (manager, _pump, _broker) = setup();
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        manager.on_status_change(move |state| seen.lock().unwrap().push(state));

        manager.connect(manager.config());

        // A connect event applied on one thread loses the race to announce it
        // against a disconnect on another.
        let connected = {
            let mut inner = manager.lock();
            manager.set_state(&mut inner, ConnectionState::Connected).unwrap()
        };
        manager.disconnect();
        manager.notify(connected);

        assert_eq!(manager.status(), ConnectionState::Disconnected);
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn test_watch_status() {
        let (manager, mut pump, broker) = setup();
        let mut rx = manager.watch_status();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);

        connect(&manager, &mut pump, &broker);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }

    #[test]
    fn test_update_config_reconnects() {
        let (manager, mut pump, broker) = setup();
        manager.subscribe("lab/a", |_: &str, _: FeedSignal| {}).unwrap();
        connect(&manager, &mut pump, &broker);

        let mut config = manager.config();
        config.host = "localhost".to_string();
        manager.update_config(config.clone());

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(manager.status(), ConnectionState::Connecting);
        assert_eq!(manager.config(), config);
        assert_eq!(broker.last_config().map(|c| c.host), Some("localhost".to_string()));

        broker.accept();
        pump.drain();
        assert_eq!(manager.status(), ConnectionState::Connected);
        assert_eq!(broker.subscribe_calls(), vec!["lab/a", "lab/a"]);
    }

    #[test]
    fn test_update_config_while_disconnected_does_not_connect() {
        let (manager, _pump, broker) = setup();
        let mut config = manager.config();
        config.port = 1883;
        manager.update_config(config);

        assert_eq!(broker.connect_attempts(), 0);
        assert_eq!(manager.config().port, 1883);
    }

    #[test]
    fn test_connect_with_new_config_while_active_reconnects() {
        let (manager, mut pump, broker) = setup();
        connect(&manager, &mut pump, &broker);

        let mut config = manager.config();
        config.client_id = "telegauge_other".to_string();
        manager.connect(config);

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(manager.config().client_id, "telegauge_other");
    }

    #[test]
    fn test_large_replay_keeps_registration_order() {
        let broker = MemoryBroker::new();
        let (manager, mut pump) = ConnectionManager::with_options(
            Arc::new(broker.clone()),
            ConnectionConfig::default(),
            PayloadNormalizer::default(),
            ManagerOptions { replay_chunk_size: 3 },
        );
        let topics: Vec<String> = (0..10).map(|i| format!("rack/{}", i)).collect();
        for topic in &topics {
            manager.subscribe(topic, |_: &str, _: FeedSignal| {}).unwrap();
        }

        connect(&manager, &mut pump, &broker);
        assert_eq!(broker.subscribe_calls(), topics);
        pump.drain();
        assert!(manager.pending_topics().is_empty());
    }

    #[tokio::test]
    async fn test_pump_runs_until_shutdown() {
        let broker = MemoryBroker::with_connect_delay(Duration::from_millis(10));
        let (manager, pump) = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig::default(),
            PayloadNormalizer::default(),
        );
        let task = tokio::spawn(pump.run());

        let mut status = manager.watch_status();
        manager.connect(manager.config());
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("timed out waiting for connect")
        .unwrap();

        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump did not stop")
            .unwrap();
        assert_eq!(manager.status(), ConnectionState::Disconnected);
    }
}
