//! MQTT 3.1.1 transport on `rumqttc`.
//!
//! The event loop is polled on a private tokio runtime. Polling stops at the
//! first error, so the library never reconnects on its own; recovery belongs
//! to the publisher's state machine.

use super::{MqttTransport, OutboundMessage, TransportCallback};
use crate::config::MqttSettings;
use crate::error::{ConfigError, ConnectionError, PublishError};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE_SECS: u64 = 5;

type CallbackSlot = Arc<Mutex<Option<Weak<dyn TransportCallback>>>>;

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

pub struct RumqttTransport {
    options: MqttOptions,
    runtime: Option<Runtime>,
    callback: CallbackSlot,
    session: Mutex<Option<Session>>,
    closing: Arc<AtomicBool>,
}

impl RumqttTransport {
    pub fn new(
        client_id: &str,
        host: &str,
        port: u16,
        keep_alive: Duration,
    ) -> Result<Self, ConnectionError> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(keep_alive);
        options.set_clean_session(true);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mqtt-io")
            .enable_all()
            .build()
            .map_err(|e| ConnectionError::Transport(format!("failed to start runtime: {}", e)))?;

        info!("MQTT client '{}' targeting {}:{}", client_id, host, port);
        Ok(Self {
            options,
            runtime: Some(runtime),
            callback: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds the transport from the `mqtt` configuration section.
    pub fn from_settings(settings: &MqttSettings, platform: &str) -> Result<Self, ConfigError> {
        let (host, port) = settings.broker_endpoint()?;
        let client_id = settings.client_id(platform);
        Self::new(
            &client_id,
            &host,
            port,
            Duration::from_secs(settings.keep_alive_sec.max(MIN_KEEP_ALIVE_SECS)),
        )
        .map_err(|e| ConfigError::InvalidField {
            field: "mqtt",
            reason: e.to_string(),
        })
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> Result<&Runtime, ConnectionError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| ConnectionError::Transport("runtime already shut down".into()))
    }
}

fn notify(slot: &CallbackSlot, event: impl FnOnce(&dyn TransportCallback)) {
    let callback = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .and_then(Weak::upgrade);
    if let Some(callback) = callback {
        event(callback.as_ref());
    }
}

/// Polls one connection until it fails, is refused, or we disconnect.
async fn drive(mut eventloop: EventLoop, callback: CallbackSlot, closing: Arc<AtomicBool>) {
    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    notify(&callback, |cb| cb.on_connect_success());
                } else {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    notify(&callback, |cb| cb.on_connect_failure(&reason));
                    return;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                notify(&callback, |cb| cb.on_delivery_complete(u64::from(ack.pkid)));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                notify(&callback, |cb| cb.on_delivery_complete(u64::from(comp.pkid)));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    return;
                }
                let reason = e.to_string();
                if connected {
                    notify(&callback, |cb| cb.on_connection_lost(&reason));
                } else {
                    notify(&callback, |cb| cb.on_connect_failure(&reason));
                }
                return;
            }
        }
    }
}

fn to_qos(level: u8) -> Result<QoS, PublishError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(PublishError::InvalidQos(other)),
    }
}

impl MqttTransport for RumqttTransport {
    fn set_callback(&self, callback: Weak<dyn TransportCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn start_connect(&self) -> Result<(), ConnectionError> {
        let runtime = self.runtime()?;
        self.closing.store(false, Ordering::SeqCst);

        let mut session = self.session();
        if let Some(stale) = session.take() {
            stale.task.abort();
        }

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);
        let task = runtime.spawn(drive(
            eventloop,
            Arc::clone(&self.callback),
            Arc::clone(&self.closing),
        ));
        *session = Some(Session { client, task });
        Ok(())
    }

    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let qos = to_qos(message.qos)?;
        let session = self.session();
        let session = session
            .as_ref()
            .ok_or_else(|| PublishError::Transport("no active session".into()))?;
        session
            .client
            .try_publish(message.topic, qos, message.retained, message.payload)
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    fn disconnect(&self, timeout: Duration) -> Result<(), ConnectionError> {
        self.closing.store(true, Ordering::SeqCst);
        let Some(session) = self.session().take() else {
            return Ok(());
        };
        let runtime = self.runtime()?;
        let Session { client, task } = session;

        if let Err(e) = client.try_disconnect() {
            warn!("failed to queue MQTT disconnect: {}", e);
        }
        let abort = task.abort_handle();
        let finished = runtime.block_on(tokio::time::timeout(timeout, task));
        match finished {
            Ok(_) => {
                info!("MQTT session closed");
                Ok(())
            }
            Err(_) => {
                abort.abort();
                Err(ConnectionError::Timeout(timeout))
            }
        }
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for RumqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (host, port) = self.options.broker_address();
        f.debug_struct("RumqttTransport")
            .field("client_id", &self.options.client_id())
            .field("broker", &format!("{}:{}", host, port))
            .finish()
    }
}
