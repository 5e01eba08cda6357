//! MQTT publisher with a connection/reconnection state machine.
//!
//! The network transport completes connects asynchronously and reports back
//! through [`TransportCallback`]. [`MqttPublisher::connect`] turns that back
//! into a blocking call bounded by a timeout. Retries after a failure or a
//! lost link run on short-lived worker threads, never on the callback thread.

pub mod loopback;
pub mod rumqtt;

pub use loopback::{ConnectBehavior, LoopbackTransport, MESSAGE_HISTORY_CAPACITY};
pub use rumqtt::RumqttTransport;

use crate::config::MqttSettings;
use crate::error::{ConnectionError, PublishError};
use crate::scheduler::MeasurementSink;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DISCONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

/// Events a transport reports back. May be invoked from any thread, including
/// synchronously from inside [`MqttTransport::start_connect`].
pub trait TransportCallback: Send + Sync {
    fn on_connect_success(&self);
    fn on_connect_failure(&self, reason: &str);
    fn on_connection_lost(&self, reason: &str);
    fn on_delivery_complete(&self, token: u64);
}

pub trait MqttTransport: Send + Sync + 'static {
    /// Registers the receiver of connection events. Held weakly.
    fn set_callback(&self, callback: Weak<dyn TransportCallback>);

    /// Starts a connect and returns without waiting for the broker.
    fn start_connect(&self) -> Result<(), ConnectionError>;

    /// Queues one message. Acceptance is not delivery.
    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError>;

    fn disconnect(&self, timeout: Duration) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub qos: u8,
    pub retained: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            disconnect_timeout: Duration::from_secs(DEFAULT_DISCONNECT_TIMEOUT_SECS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            qos: 0,
            retained: false,
        }
    }
}

impl PublisherOptions {
    pub fn from_settings(settings: &MqttSettings) -> Self {
        Self {
            qos: settings.qos,
            retained: settings.retained,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub links_lost: u64,
    pub published: u64,
    pub rejected: u64,
    pub delivered: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    links_lost: AtomicU64,
    published: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            links_lost: self.links_lost.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptOutcome {
    Connected,
    Refused(String),
    Lost(String),
}

/// Rendezvous between a blocked `connect()` and the transport callbacks.
#[derive(Debug, Default)]
struct ConnectAttempt {
    in_progress: bool,
    outcome: Option<AttemptOutcome>,
}

struct Shared<T: MqttTransport> {
    transport: T,
    options: PublisherOptions,
    state: AtomicU8,
    attempt: Mutex<ConnectAttempt>,
    settled: Condvar,
    retries: AtomicU32,
    retry_pending: AtomicBool,
    closing: AtomicBool,
    stats: AtomicStats,
    me: Weak<Shared<T>>,
}

impl<T: MqttTransport> Shared<T> {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!("publisher state {:?} -> {:?}", previous, state);
        }
    }

    fn lock_attempt(&self) -> MutexGuard<'_, ConnectAttempt> {
        self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attempt_connect(&self) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        {
            let mut attempt = self.lock_attempt();
            if attempt.in_progress {
                return Err(ConnectionError::InProgress);
            }
            attempt.in_progress = true;
            attempt.outcome = None;
        }

        self.set_state(ConnectionState::Connecting);
        AtomicStats::bump(&self.stats.connect_attempts);
        info!("connecting to MQTT broker");

        // The lock is not held here: the transport may call back synchronously
        if let Err(e) = self.transport.start_connect() {
            error!("failed to start connect: {}", e);
            self.on_connect_failure(&e.to_string());
            self.lock_attempt().in_progress = false;
            return Err(e);
        }

        let guard = self.lock_attempt();
        let (mut attempt, wait) = self
            .settled
            .wait_timeout_while(guard, self.options.connect_timeout, |a| a.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        attempt.in_progress = false;

        match attempt.outcome.take() {
            Some(AttemptOutcome::Connected) => Ok(()),
            Some(AttemptOutcome::Refused(reason)) => Err(ConnectionError::Refused(reason)),
            Some(AttemptOutcome::Lost(reason)) => Err(ConnectionError::Lost(reason)),
            None => {
                debug_assert!(wait.timed_out());
                drop(attempt);
                // Leave a late success alone; it may already have landed
                let _ = self.state.compare_exchange(
                    ConnectionState::Connecting as u8,
                    ConnectionState::Disconnected as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                warn!(
                    "connect did not complete within {:?}",
                    self.options.connect_timeout
                );
                Err(ConnectionError::Timeout(self.options.connect_timeout))
            }
        }
    }

    fn settle(&self, outcome: AttemptOutcome) {
        let mut attempt = self.lock_attempt();
        if attempt.in_progress {
            attempt.outcome = Some(outcome);
        }
        self.settled.notify_all();
    }

    /// Arms at most one pending retry, bounded by the attempt ceiling.
    fn schedule_retry(&self) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("publisher closing, no reconnect scheduled");
            return;
        }
        if self.retry_pending.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
        let ceiling = self.options.max_reconnect_attempts;
        if attempt > ceiling {
            if attempt == ceiling + 1 {
                warn!("giving up after {} reconnect attempts", ceiling);
            }
            return;
        }
        info!(
            "reconnect attempt {}/{} in {:?}",
            attempt, ceiling, self.options.reconnect_backoff
        );
        self.spawn_attempt(self.options.reconnect_backoff);
    }

    fn spawn_attempt(&self, delay: Duration) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name("mqtt-reconnect".into())
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                let Some(shared) = me.upgrade() else {
                    return;
                };
                shared.retry_pending.store(false, Ordering::SeqCst);
                if shared.closing.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = shared.attempt_connect() {
                    debug!("reconnect attempt failed: {}", e);
                }
            });
        if let Err(e) = spawned {
            self.retry_pending.store(false, Ordering::SeqCst);
            error!("failed to spawn reconnect worker: {}", e);
        }
    }
}

impl<T: MqttTransport> TransportCallback for Shared<T> {
    fn on_connect_success(&self) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("connect acknowledged after disconnect, staying disconnected");
            self.settle(AttemptOutcome::Lost("publisher disconnected".into()));
            return;
        }
        self.retries.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!("connected to MQTT broker");
        self.settle(AttemptOutcome::Connected);
    }

    fn on_connect_failure(&self, reason: &str) {
        self.set_state(ConnectionState::Disconnected);
        AtomicStats::bump(&self.stats.connect_failures);
        warn!("MQTT connect failed: {}", reason);
        self.settle(AttemptOutcome::Refused(reason.to_string()));
        self.schedule_retry();
    }

    fn on_connection_lost(&self, reason: &str) {
        self.set_state(ConnectionState::Disconnected);
        AtomicStats::bump(&self.stats.links_lost);
        warn!("MQTT connection lost: {}", reason);
        self.settle(AttemptOutcome::Lost(reason.to_string()));
        self.schedule_retry();
    }

    fn on_delivery_complete(&self, token: u64) {
        AtomicStats::bump(&self.stats.delivered);
        debug!("delivery complete for token {}", token);
    }
}

/// Synchronous publishing surface over an asynchronous transport.
///
/// Dropping the publisher disconnects it.
pub struct MqttPublisher<T: MqttTransport = RumqttTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: MqttTransport> MqttPublisher<T> {
    pub fn new(transport: T, options: PublisherOptions) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            transport,
            options,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            attempt: Mutex::new(ConnectAttempt::default()),
            settled: Condvar::new(),
            retries: AtomicU32::new(0),
            retry_pending: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            stats: AtomicStats::default(),
            me: me.clone(),
        });
        let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
        let callback: Weak<dyn TransportCallback> = weak;
        shared.transport.set_callback(callback);
        Self { shared }
    }

    /// Blocks until the broker answers or the connect timeout elapses.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.attempt_connect()
    }

    /// Non-blocking: starts one connect attempt in the background unless one
    /// is already running or pending.
    pub fn request_reconnect(&self) {
        let shared = &self.shared;
        if shared.closing.load(Ordering::SeqCst) || shared.state() == ConnectionState::Connected {
            return;
        }
        if shared.lock_attempt().in_progress {
            return;
        }
        shared.spawn_attempt(Duration::ZERO);
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retained: bool,
    ) -> Result<(), PublishError> {
        if qos > 2 {
            return Err(PublishError::InvalidQos(qos));
        }
        if self.shared.state() != ConnectionState::Connected {
            AtomicStats::bump(&self.shared.stats.rejected);
            warn!("cannot publish to {}, not connected", topic);
            return Err(PublishError::NotConnected);
        }

        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retained,
        };
        match self.shared.transport.publish(message) {
            Ok(()) => {
                AtomicStats::bump(&self.shared.stats.published);
                debug!("published {} bytes to {}", payload.len(), topic);
                Ok(())
            }
            Err(e) => {
                AtomicStats::bump(&self.shared.stats.rejected);
                error!("failed to publish to {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Only acts while connected. Always ends Disconnected, and no retry is
    /// scheduled afterwards.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::SeqCst);
        if shared.state() != ConnectionState::Connected {
            return Ok(());
        }
        info!("disconnecting from MQTT broker");
        let result = shared.transport.disconnect(shared.options.disconnect_timeout);
        if let Err(e) = &result {
            warn!("disconnect did not complete cleanly: {}", e);
        }
        shared.set_state(ConnectionState::Disconnected);
        result
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.shared.options
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn get_stats(&self) -> PublisherStats {
        self.shared.stats.snapshot()
    }
}

impl<T: MqttTransport> MeasurementSink for MqttPublisher<T> {
    fn is_connected(&self) -> bool {
        MqttPublisher::is_connected(self)
    }

    fn submit(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        let options = &self.shared.options;
        self.publish(topic, payload.as_bytes(), options.qos, options.retained)
    }

    fn request_reconnect(&self) {
        MqttPublisher::request_reconnect(self);
    }
}

impl<T: MqttTransport> Drop for MqttPublisher<T> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("error while disconnecting on drop: {}", e);
        }
    }
}

impl<T: MqttTransport> std::fmt::Debug for MqttPublisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPublisher")
            .field("state", &self.state())
            .field("options", &self.shared.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
        assert_eq!(ConnectionState::from_u8(99), ConnectionState::Disconnected);
    }

    #[test]
    fn test_default_options() {
        let options = PublisherOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.disconnect_timeout, Duration::from_secs(10));
        assert_eq!(options.max_reconnect_attempts, 5);
        assert_eq!(options.reconnect_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_qos_rejected_before_state_check() {
        let publisher = MqttPublisher::new(LoopbackTransport::new(), PublisherOptions::default());
        assert!(matches!(
            publisher.publish("t", b"x", 3, false),
            Err(PublishError::InvalidQos(3))
        ));
    }

    #[test]
    fn test_connect_and_publish_over_loopback() {
        let publisher = MqttPublisher::new(LoopbackTransport::new(), PublisherOptions::default());
        publisher.connect().unwrap();
        assert!(publisher.is_connected());

        publisher.publish("sensors/env", b"{}", 1, false).unwrap();
        let messages = publisher.transport().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "sensors/env");
        assert_eq!(publisher.get_stats().delivered, 1);
    }
}
