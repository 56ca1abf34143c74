//! Connection state machine
//!
//! The canonical flow is disconnected → connecting → (connected | error),
//! connected → disconnecting → disconnected, with any failed operation
//! driving the machine to `Error`. Listener fan-out snapshots the listener
//! list under the lock and invokes callbacks after releasing it, so
//! listeners may re-enter the read side.

use std::sync::Arc;

use parking_lot::RwLock;

/// VPN connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Disconnecting => "disconnecting",
            State::Error => "error",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked when the VPN state changes.
pub type StateListener = Arc<dyn Fn(State, Option<String>) + Send + Sync>;

/// Callback invoked with traffic statistics (upload, download, upSpeed,
/// downSpeed — bytes and bytes/s).
pub type StatsListener = Arc<dyn Fn(u64, u64, u64, u64) + Send + Sync>;

#[derive(Default)]
struct Inner {
    state: State,
    last_error: Option<String>,
    state_listeners: Vec<StateListener>,
    stats_listeners: Vec<StatsListener>,
}

/// Manages VPN state transitions and notifies listeners.
#[derive(Default)]
pub struct StateMachine {
    inner: RwLock<Inner>,
}

impl StateMachine {
    /// Create a new state machine in the disconnected state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.read().state
    }

    /// Last stored error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    /// Transition to a new state and notify listeners.
    ///
    /// Listeners are invoked with a consistent snapshot, outside the lock.
    pub fn set_state(&self, state: State, error: Option<String>) {
        let listeners = {
            let mut inner = self.inner.write();
            inner.state = state;
            inner.last_error = error.clone();
            inner.state_listeners.clone()
        };

        for listener in listeners {
            listener(state, error.clone());
        }
    }

    /// Register a state change listener.
    pub fn on_state_change(&self, listener: impl Fn(State, Option<String>) + Send + Sync + 'static) {
        self.inner.write().state_listeners.push(Arc::new(listener));
    }

    /// Register a stats update listener.
    pub fn on_stats(&self, listener: impl Fn(u64, u64, u64, u64) + Send + Sync + 'static) {
        self.inner.write().stats_listeners.push(Arc::new(listener));
    }

    /// Notify all stats listeners. Does not mutate state.
    pub fn notify_stats(&self, upload: u64, download: u64, up_speed: u64, down_speed: u64) {
        let listeners = self.inner.read().stats_listeners.clone();

        for listener in listeners {
            listener(upload, download, up_speed, down_speed);
        }
    }
}
