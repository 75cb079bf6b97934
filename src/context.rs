//! Context providers consulted during enrichment

use std::sync::RwLock;
use uuid::Uuid;

/// Source of the ids copied into envelope tags.
///
/// Implementations are read-only from the channel's point of view.
pub trait ContextProvider: Send + Sync {
    /// Id of the current operation, used to correlate related telemetry
    fn correlation_id(&self) -> Option<String>;
    fn user_id(&self) -> Option<String>;
    fn session_id(&self) -> Option<String>;
}

/// Provider that never supplies any ids
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

impl ContextProvider for NoContext {
    fn correlation_id(&self) -> Option<String> {
        None
    }

    fn user_id(&self) -> Option<String> {
        None
    }

    fn session_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone)]
struct ContextIds {
    correlation_id: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
}

/// Provider holding ids set by the host application
#[derive(Debug, Default)]
pub struct StaticContext {
    ids: RwLock<ContextIds>,
}

impl StaticContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with a freshly generated session id
    pub fn with_new_session() -> Self {
        let context = Self::new();
        context.renew_session();
        context
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        if let Ok(mut ids) = self.ids.write() {
            ids.user_id = user_id;
        }
    }

    pub fn set_correlation_id(&self, correlation_id: Option<String>) {
        if let Ok(mut ids) = self.ids.write() {
            ids.correlation_id = correlation_id;
        }
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        if let Ok(mut ids) = self.ids.write() {
            ids.session_id = session_id;
        }
    }

    /// Start a new session and return its id
    pub fn renew_session(&self) -> String {
        let session_id = Uuid::new_v4().simple().to_string();
        self.set_session_id(Some(session_id.clone()));
        session_id
    }

    /// Start a new operation and return its id
    pub fn start_operation(&self) -> String {
        let operation_id = Uuid::new_v4().simple().to_string();
        self.set_correlation_id(Some(operation_id.clone()));
        operation_id
    }

    fn read(&self) -> ContextIds {
        self.ids.read().map(|ids| ids.clone()).unwrap_or_default()
    }
}

impl ContextProvider for StaticContext {
    fn correlation_id(&self) -> Option<String> {
        self.read().correlation_id
    }

    fn user_id(&self) -> Option<String> {
        self.read().user_id
    }

    fn session_id(&self) -> Option<String> {
        self.read().session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_context_round_trips_ids() {
        let context = StaticContext::with_new_session();
        assert_eq!(context.session_id().map(|s| s.len()), Some(32));

        context.set_user_id(Some("user-1".to_string()));
        let op = context.start_operation();
        assert_eq!(context.user_id().as_deref(), Some("user-1"));
        assert_eq!(context.correlation_id(), Some(op));

        context.set_user_id(None);
        assert!(context.user_id().is_none());
    }
}
