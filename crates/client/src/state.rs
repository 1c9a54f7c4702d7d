//! Connection state tracking with synchronous change notification.
//!
//! [`ConnectionStateManager`] holds the current [`ConnectionState`], the
//! last error message and the time of the last transition. Transitions are
//! driven by the relay client; every transition notifies registered
//! listeners before the call that caused it returns, and is also published
//! on a broadcast channel for async observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Capacity of the state-change broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Connection state of a relay client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected to the relay.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting to retry after an unexpected close.
    Reconnecting,
    /// Connection failed; see the error message.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub error_message: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Handle returned by [`ConnectionStateManager::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&StateSnapshot) + Send + Sync>;

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks connection state and notifies observers of every transition.
///
/// Listeners run synchronously on the transitioning task, in registration
/// order. They must not trigger transitions themselves.
pub struct ConnectionStateManager {
    current: Mutex<StateSnapshot>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    /// Serializes update + notify so observers see transitions in order.
    transition_lock: Mutex<()>,
    events: broadcast::Sender<StateSnapshot>,
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateManager {
    /// Creates a manager in the `Disconnected` state.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(StateSnapshot {
                state: ConnectionState::Disconnected,
                error_message: None,
                changed_at: Utc::now(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            transition_lock: Mutex::new(()),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.current).state
    }

    pub fn error_message(&self) -> Option<String> {
        lock(&self.current).error_message.clone()
    }

    /// Time of the most recent transition (creation time if none).
    pub fn last_state_change(&self) -> DateTime<Utc> {
        lock(&self.current).changed_at
    }

    pub fn snapshot(&self) -> StateSnapshot {
        lock(&self.current).clone()
    }

    /// True only in the `Error` state.
    pub fn has_error(&self) -> bool {
        self.state() == ConnectionState::Error
    }

    /// True while connecting or waiting to reconnect.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Registers a listener called synchronously on every transition.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateSnapshot) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Subscribes to transitions as an async broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.events.subscribe()
    }

    /// Moves to `state` with an optional error message.
    ///
    /// A transition to the same state with the same message is ignored, so
    /// observers never see duplicates. Returns whether anything changed.
    pub(crate) fn transition(&self, state: ConnectionState, error_message: Option<String>) -> bool {
        let _ordered = lock(&self.transition_lock);

        let snapshot = {
            let mut current = lock(&self.current);
            if current.state == state && current.error_message == error_message {
                return false;
            }
            let changed_at = Utc::now().max(current.changed_at);
            *current = StateSnapshot {
                state,
                error_message,
                changed_at,
            };
            current.clone()
        };

        tracing::debug!(state = ?snapshot.state, error = ?snapshot.error_message, "connection state changed");

        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }

        // No receivers is fine.
        let _ = self.events.send(snapshot);
        true
    }
}

impl std::fmt::Debug for ConnectionStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateManager")
            .field("current", &self.snapshot())
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}
