//! Online/offline tracking
//!
//! The [`OfflineListener`] subscribes to `online`/`offline` notifications of a
//! [`ConnectivityHost`] on both the global scope and the document body. When
//! at least one subscription succeeds the host's navigator flag is read once
//! and the state is afterwards driven by events only. When no subscription can
//! be made, every [`OfflineListener::is_online`] call asks the navigator flag
//! directly.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Observed connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
    Unknown,
}

impl ConnectivityState {
    fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => ConnectivityState::Online,
            Some(false) => ConnectivityState::Offline,
            None => ConnectivityState::Unknown,
        }
    }
}

/// Where a listener is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Global,
    DocumentBody,
}

pub type ListenerId = u64;

/// Receives `true` for an `online` event and `false` for `offline`
pub type ConnectivityHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Environment the channel runs in
pub trait ConnectivityHost: Send + Sync {
    /// Current navigator flag, `None` when the host cannot tell
    fn navigator_on_line(&self) -> Option<bool>;

    fn add_event_listener(&self, target: EventTarget, handler: ConnectivityHandler) -> Result<ListenerId>;

    fn remove_event_listener(&self, target: EventTarget, id: ListenerId);
}

struct Registration {
    target: EventTarget,
    id: ListenerId,
    handler: ConnectivityHandler,
}

struct ManualState {
    on_line: Option<bool>,
    supports_events: bool,
    registrations: Vec<Registration>,
    next_id: ListenerId,
}

/// Host whose connectivity is driven by the application, e.g. from an OS
/// network-change hook. Also used by tests.
pub struct ManualConnectivity {
    state: Mutex<ManualState>,
}

impl ManualConnectivity {
    pub fn new(on_line: Option<bool>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                on_line,
                supports_events: true,
                registrations: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Host that refuses listeners, forcing the polling fallback
    pub fn without_events(on_line: Option<bool>) -> Self {
        let host = Self::new(on_line);
        if let Ok(mut state) = host.state.lock() {
            state.supports_events = false;
        }
        host
    }

    /// Update the navigator flag without dispatching events
    pub fn set_navigator_on_line(&self, on_line: Option<bool>) {
        if let Ok(mut state) = self.state.lock() {
            state.on_line = on_line;
        }
    }

    /// Update the navigator flag and dispatch the matching event to every
    /// registered listener
    pub fn set_online(&self, online: bool) {
        let handlers: Vec<ConnectivityHandler> = match self.state.lock() {
            Ok(mut state) => {
                state.on_line = Some(online);
                state
                    .registrations
                    .iter()
                    .map(|r| r.handler.clone())
                    .collect()
            }
            Err(_) => return,
        };
        for handler in handlers {
            handler(online);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.registrations.len())
            .unwrap_or(0)
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(Some(true))
    }
}

impl ConnectivityHost for ManualConnectivity {
    fn navigator_on_line(&self) -> Option<bool> {
        self.state.lock().ok().and_then(|state| state.on_line)
    }

    fn add_event_listener(&self, target: EventTarget, handler: ConnectivityHandler) -> Result<ListenerId> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Transport("connectivity host unavailable".to_string()))?;
        if !state.supports_events {
            return Err(Error::Configuration(
                "host does not support connectivity events".to_string(),
            ));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.registrations.push(Registration {
            target,
            id,
            handler,
        });
        Ok(id)
    }

    fn remove_event_listener(&self, target: EventTarget, id: ListenerId) {
        if let Ok(mut state) = self.state.lock() {
            state
                .registrations
                .retain(|r| !(r.target == target && r.id == id));
        }
    }
}

pub type StateCallback = Box<dyn Fn(ConnectivityState) + Send + Sync>;

struct Shared {
    state: Mutex<ConnectivityState>,
    callbacks: Mutex<Vec<StateCallback>>,
}

impl Shared {
    fn on_event(&self, online: bool) {
        let next = ConnectivityState::from_flag(Some(online));
        let changed = match self.state.lock() {
            Ok(mut state) if *state != next => {
                *state = next;
                true
            }
            _ => false,
        };
        if !changed {
            return;
        }
        tracing::debug!(state = ?next, "connectivity changed");
        if let Ok(callbacks) = self.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(next);
            }
        }
    }
}

/// Tracks whether transmission is worth attempting
pub struct OfflineListener {
    host: Arc<dyn ConnectivityHost>,
    shared: Arc<Shared>,
    registrations: Mutex<Vec<(EventTarget, ListenerId)>>,
}

impl OfflineListener {
    pub fn new(host: Arc<dyn ConnectivityHost>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectivityState::Unknown),
            callbacks: Mutex::new(Vec::new()),
        });

        let mut registrations = Vec::new();
        for target in [EventTarget::Global, EventTarget::DocumentBody] {
            let events = shared.clone();
            let handler: ConnectivityHandler = Arc::new(move |online| events.on_event(online));
            match host.add_event_listener(target, handler) {
                Ok(id) => registrations.push((target, id)),
                Err(e) => tracing::debug!(?target, error = %e, "could not attach connectivity listener"),
            }
        }

        if !registrations.is_empty() {
            if let Ok(mut state) = shared.state.lock() {
                *state = ConnectivityState::from_flag(host.navigator_on_line());
            }
        }

        Self {
            host,
            shared,
            registrations: Mutex::new(registrations),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.registrations
            .lock()
            .map(|r| !r.is_empty())
            .unwrap_or(false)
    }

    /// Current state; `Unknown` counts as online
    pub fn state(&self) -> ConnectivityState {
        if self.is_listening() {
            self.shared
                .state
                .lock()
                .map(|s| *s)
                .unwrap_or(ConnectivityState::Unknown)
        } else {
            ConnectivityState::from_flag(self.host.navigator_on_line())
        }
    }

    pub fn is_online(&self) -> bool {
        self.state() != ConnectivityState::Offline
    }

    /// Register a callback run once per observed transition
    pub fn add_listener(&self, callback: impl Fn(ConnectivityState) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.shared.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Detach from the host. Safe to call any number of times.
    pub fn unload(&self) {
        let registrations = match self.registrations.lock() {
            Ok(mut r) => std::mem::take(&mut *r),
            Err(_) => return,
        };
        for (target, id) in registrations {
            self.host.remove_event_listener(target, id);
        }
    }
}

impl Drop for OfflineListener {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn initial_state_read_once_then_event_driven() {
        let host = Arc::new(ManualConnectivity::new(Some(false)));
        let listener = OfflineListener::new(host.clone());
        assert!(listener.is_listening());
        assert!(!listener.is_online());

        // Flag changes without events are not observed
        host.set_navigator_on_line(Some(true));
        assert!(!listener.is_online());

        host.set_online(true);
        assert!(listener.is_online());
        assert_eq!(listener.state(), ConnectivityState::Online);
    }

    #[test]
    fn callbacks_fire_once_per_transition() {
        let host = Arc::new(ManualConnectivity::new(Some(true)));
        let listener = OfflineListener::new(host.clone());
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        listener.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Each event reaches two registrations (global and body)
        host.set_online(false);
        host.set_online(false);
        host.set_online(true);
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn falls_back_to_polling_without_events() {
        let host = Arc::new(ManualConnectivity::without_events(Some(true)));
        let listener = OfflineListener::new(host.clone());
        assert!(!listener.is_listening());
        assert!(listener.is_online());

        host.set_navigator_on_line(Some(false));
        assert!(!listener.is_online());

        host.set_navigator_on_line(None);
        assert_eq!(listener.state(), ConnectivityState::Unknown);
        assert!(listener.is_online());
    }

    #[test]
    fn unload_is_idempotent() {
        let host = Arc::new(ManualConnectivity::default());
        let listener = OfflineListener::new(host.clone());
        assert_eq!(host.listener_count(), 2);

        listener.unload();
        listener.unload();
        assert!(!listener.is_listening());
        assert_eq!(host.listener_count(), 0);
    }
}
