//! In-process transport: nothing leaves the machine.
//!
//! Used for `--dry-run` and as the scripted broker in tests.

use super::{MqttTransport, OutboundMessage, TransportCallback};
use crate::error::{ConnectionError, PublishError};
use heapless::Deque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Most recent messages kept for inspection; older ones are discarded.
pub const MESSAGE_HISTORY_CAPACITY: usize = 256;

/// How the loopback answers the next connect requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse,
    /// Never answer; the caller's timeout has to fire.
    Ignore,
}

#[derive(Debug)]
struct LoopbackState {
    behavior: ConnectBehavior,
    connected: bool,
    messages: Deque<OutboundMessage, MESSAGE_HISTORY_CAPACITY>,
    published: u64,
    connect_attempts: u32,
    disconnects: u32,
    next_token: u64,
}

#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    callback: Mutex<Option<Weak<dyn TransportCallback>>>,
    echo: bool,
}

impl Default for LoopbackState {
    fn default() -> Self {
        Self {
            behavior: ConnectBehavior::Accept,
            connected: false,
            messages: Deque::new(),
            published: 0,
            connect_attempts: 0,
            disconnects: 0,
            next_token: 1,
        }
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every accepted message at info level.
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        let transport = Self::default();
        transport.set_behavior(behavior);
        transport
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callback(&self) -> Option<Arc<dyn TransportCallback>> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        self.lock().behavior = behavior;
    }

    /// Delivers a connect success nobody may be waiting for any more.
    pub fn complete_pending_connect(&self) {
        self.lock().connected = true;
        if let Some(callback) = self.callback() {
            callback.on_connect_success();
        }
    }

    /// Simulates the broker going away.
    pub fn drop_link(&self, reason: &str) {
        self.lock().connected = false;
        if let Some(callback) = self.callback() {
            callback.on_connection_lost(reason);
        }
    }

    /// The retained tail of accepted messages, oldest first.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.lock().messages.iter().cloned().collect()
    }

    /// Every message accepted since creation, including discarded ones.
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }

    pub fn is_link_up(&self) -> bool {
        self.lock().connected
    }
}

impl MqttTransport for LoopbackTransport {
    fn set_callback(&self, callback: Weak<dyn TransportCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn start_connect(&self) -> Result<(), ConnectionError> {
        let behavior = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.behavior == ConnectBehavior::Accept {
                state.connected = true;
            }
            state.behavior
        };
        debug!("loopback connect request answered with {:?}", behavior);

        // Callbacks run with no loopback lock held
        if let Some(callback) = self.callback() {
            match behavior {
                ConnectBehavior::Accept => callback.on_connect_success(),
                ConnectBehavior::Refuse => callback.on_connect_failure("connection refused by loopback"),
                ConnectBehavior::Ignore => {}
            }
        }
        Ok(())
    }

    fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let (token, qos) = {
            let mut state = self.lock();
            if !state.connected {
                return Err(PublishError::Transport("loopback link is down".into()));
            }
            let token = state.next_token;
            state.next_token += 1;
            if self.echo {
                info!(
                    "[dry-run] {} <- {}",
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                );
            }
            let qos = message.qos;
            if state.messages.is_full() {
                state.messages.pop_front();
            }
            let _ = state.messages.push_back(message);
            state.published += 1;
            (token, qos)
        };

        if qos > 0 {
            if let Some(callback) = self.callback() {
                callback.on_delivery_complete(token);
            }
        }
        Ok(())
    }

    fn disconnect(&self, _timeout: Duration) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("state", &*self.lock())
            .field("echo", &self.echo)
            .finish()
    }
}
