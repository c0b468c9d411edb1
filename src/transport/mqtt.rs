//! MQTT transport backed by rumqttc.
//!
//! Each opened connection runs two tasks: a poll task that drives the rumqttc
//! event loop and translates packets into [`TransportEvent`]s, and a command
//! task that forwards subscribe/unsubscribe/disconnect requests to the client.
//! Requests are queued through the client's bounded request channel, so a large
//! resubscribe burst is paced by the event loop rather than sent all at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Connection, Connector, EventSink, TransportError, TransportEvent};
use crate::connection::{ConnectionConfig, TransportScheme};

/// Pending requests on the rumqttc client channel
const REQUEST_CAPACITY: usize = 64;

/// Time given to a graceful DISCONNECT before the poll task is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens MQTT 3.1.1 sessions with rumqttc
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for MqttConnector {
    fn open(
        &self,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let options = mqtt_options(config);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        eventloop
            .network_options
            .set_connection_timeout(config.connect_timeout_secs.max(1));

        let stopping = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let reconnect = Duration::from_millis(config.reconnect_period_ms);

        let poll = {
            let sink = sink.clone();
            let stopping = Arc::clone(&stopping);
            let acks = Arc::clone(&acks);
            runtime.spawn(async move {
                let mut connected = false;
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(packet)) => {
                            handle_packet(packet, &sink, &acks, &mut connected);
                        }
                        Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                            lock(&acks).bind(AckKind::Subscribe, pkid);
                        }
                        Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                            lock(&acks).bind(AckKind::Unsubscribe, pkid);
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(Event::Outgoing(_)) => {}
                        Err(err) => {
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }

                            let dropped = connected
                                && matches!(
                                    err,
                                    ConnectionError::Io(_) | ConnectionError::MqttState(_)
                                );
                            let event = if dropped {
                                tracing::warn!(error = %err, "MQTT connection lost");
                                TransportEvent::Closed
                            } else {
                                tracing::warn!(error = %err, "MQTT connection error");
                                TransportEvent::ConnectFailed(err.to_string())
                            };
                            connected = false;
                            lock(&acks).reset_in_flight();

                            if !sink.emit(event) || reconnect.is_zero() {
                                break;
                            }
                            tokio::time::sleep(reconnect).await;
                            if stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            tracing::debug!("Retrying MQTT connection");
                        }
                    }
                }
                tracing::debug!(generation = sink.generation(), "MQTT poll task stopped");
            })
        };

        let (commands, mut command_rx) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    Command::Subscribe(topic) => {
                        lock(&acks).enqueue(AckKind::Subscribe, &topic);
                        if let Err(err) = client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                            lock(&acks).cancel(AckKind::Subscribe, &topic);
                            sink.emit(TransportEvent::SubscribeAck {
                                topic,
                                result: Err(err.to_string()),
                            });
                        }
                    }
                    Command::Unsubscribe(topic) => {
                        lock(&acks).enqueue(AckKind::Unsubscribe, &topic);
                        if let Err(err) = client.unsubscribe(topic.as_str()).await {
                            lock(&acks).cancel(AckKind::Unsubscribe, &topic);
                            sink.emit(TransportEvent::UnsubscribeAck {
                                topic,
                                result: Err(err.to_string()),
                            });
                        }
                    }
                    Command::Disconnect => {
                        if let Err(err) = client.disconnect().await {
                            tracing::debug!(error = %err, "MQTT disconnect request not delivered");
                        }
                        break;
                    }
                }
            }
        });

        Ok(Box::new(MqttConnection {
            commands,
            stopping,
            poll: poll.abort_handle(),
            runtime,
        }))
    }
}

fn mqtt_options(config: &ConnectionConfig) -> MqttOptions {
    // rumqttc takes the full URL as the host for WebSocket transports.
    let host = if config.scheme.is_websocket() {
        config.broker_url()
    } else {
        config.host.clone()
    };

    let mut options = MqttOptions::new(config.client_id.clone(), host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(config.clean_session);

    match config.scheme {
        TransportScheme::Tcp => {}
        TransportScheme::Tls => {
            options.set_transport(Transport::tls_with_default_config());
        }
        TransportScheme::Ws => {
            options.set_transport(Transport::Ws);
        }
        TransportScheme::Wss => {
            options.set_transport(Transport::wss_with_default_config());
        }
    }

    options
}

fn handle_packet(
    packet: Packet,
    sink: &EventSink,
    acks: &Mutex<AckTracker>,
    connected: &mut bool,
) {
    match packet {
        Packet::ConnAck(ack) => {
            if ack.code == ConnectReturnCode::Success {
                *connected = true;
                sink.emit(TransportEvent::Connected);
            } else {
                sink.emit(TransportEvent::ConnectFailed(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
        }
        Packet::Publish(publish) => {
            sink.emit(TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            });
        }
        Packet::SubAck(ack) => {
            let Some(topic) = lock(acks).resolve(AckKind::Subscribe, ack.pkid) else {
                tracing::trace!(pkid = ack.pkid, "SUBACK for unknown packet");
                return;
            };
            let granted = ack
                .return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
            let result = if granted {
                Ok(())
            } else {
                Err(format!("broker refused subscription: {:?}", ack.return_codes))
            };
            sink.emit(TransportEvent::SubscribeAck { topic, result });
        }
        Packet::UnsubAck(ack) => {
            if let Some(topic) = lock(acks).resolve(AckKind::Unsubscribe, ack.pkid) {
                sink.emit(TransportEvent::UnsubscribeAck {
                    topic,
                    result: Ok(()),
                });
            }
        }
        Packet::Disconnect => {
            *connected = false;
            sink.emit(TransportEvent::Closed);
        }
        _ => {}
    }
}

fn lock(acks: &Mutex<AckTracker>) -> std::sync::MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// Maps packet identifiers back to topics.
///
/// Requests are queued in send order; rumqttc reports the packet id it
/// assigned when the request leaves (`Outgoing::Subscribe(pkid)`), which binds
/// the oldest queued topic to that id until the acknowledgement arrives.
#[derive(Debug, Default)]
struct AckTracker {
    queued: HashMap<AckKind, VecDeque<String>>,
    in_flight: HashMap<(AckKind, u16), String>,
}

impl AckTracker {
    fn enqueue(&mut self, kind: AckKind, topic: &str) {
        self.queued.entry(kind).or_default().push_back(topic.to_string());
    }

    fn cancel(&mut self, kind: AckKind, topic: &str) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            if let Some(pos) = queue.iter().rposition(|t| t == topic) {
                queue.remove(pos);
            }
        }
    }

    fn bind(&mut self, kind: AckKind, pkid: u16) {
        if let Some(topic) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) {
            self.in_flight.insert((kind, pkid), topic);
        }
    }

    fn resolve(&mut self, kind: AckKind, pkid: u16) -> Option<String> {
        self.in_flight.remove(&(kind, pkid))
    }

    /// Forget requests the lost session sent. Requests still waiting in the
    /// client's channel go out after the reconnect and keep their place.
    fn reset_in_flight(&mut self) {
        self.in_flight.clear();
    }
}

/// Handle to a running rumqttc session
struct MqttConnection {
    commands: mpsc::UnboundedSender<Command>,
    stopping: Arc<AtomicBool>,
    poll: AbortHandle,
    runtime: Handle,
}

impl MqttConnection {
    fn send(&self, command: Command) -> Result<(), TransportError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.commands.send(command).map_err(|_| TransportError::Closed)
    }
}

impl Connection for MqttConnection {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send(Command::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send(Command::Unsubscribe(topic.to_string()))
    }

    fn close(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Disconnect);

        // The poll task exits on its own once DISCONNECT is written; abort it
        // if the broker is unreachable and the write never happens.
        let poll = self.poll.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            poll.abort();
        });
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        self.close();
    }
}
