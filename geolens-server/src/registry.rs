//! Connection registry: session identifier to live connection handle.
//!
//! The registry holds only the id-to-handle mapping, never session state, so
//! connection bookkeeping stays decoupled from pipeline state. It is an
//! injected instance owned by the server state, not module-global.

use crate::protocol::{Envelope, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Handle to one client connection: serialized frames pushed through here
/// are forwarded to the WebSocket by the connection's writer task.
pub type ConnectionHandle = mpsc::UnboundedSender<String>;

/// Concurrency-safe map of live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a session, replacing any prior handle.
    ///
    /// A replaced handle is considered superseded; sends queued to it are
    /// no longer routed through the registry.
    pub async fn bind(&self, session_id: &str, handle: ConnectionHandle) {
        let previous = self
            .connections
            .write()
            .await
            .insert(session_id.to_string(), handle);
        if previous.is_some() {
            tracing::debug!(session_id, "Superseded existing connection binding");
        }
    }

    /// Remove the mapping for a session. No-op if absent.
    pub async fn unbind(&self, session_id: &str) {
        self.connections.write().await.remove(session_id);
    }

    /// Remove the mapping only if `handle` is still the bound connection.
    ///
    /// A superseded connection tearing itself down must not unbind its live
    /// replacement. Returns whether the mapping was removed.
    pub async fn unbind_if(&self, session_id: &str, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(session_id) {
            Some(bound) if bound.same_channel(handle) => {
                connections.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Whether a connection is currently bound for this session.
    pub async fn is_bound(&self, session_id: &str) -> bool {
        self.connections.read().await.contains_key(session_id)
    }

    /// Serialize an event and deliver it to the bound connection.
    ///
    /// Silently drops the event when no connection is bound or the writer
    /// has gone away: a stage may still be mid-flight after a disconnect,
    /// and from its perspective the session is already gone.
    pub async fn send(&self, session_id: &str, event: ServerEvent) {
        let handle = {
            let connections = self.connections.read().await;
            connections.get(session_id).cloned()
        };
        let Some(handle) = handle else {
            tracing::trace!(session_id, "Dropping event for unbound session");
            return;
        };

        let envelope = Envelope {
            session_id: session_id.to_string(),
            event,
        };
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(session_id, error = %err, "Failed to serialize event");
                return;
            }
        };

        if handle.send(frame).is_err() {
            tracing::trace!(session_id, "Writer task gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> ServerEvent {
        ServerEvent::ReasoningChunk { text: text.into() }
    }

    #[tokio::test]
    async fn send_delivers_in_call_order() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.bind("s1", tx).await;

        registry.send("s1", chunk("one")).await;
        registry.send("s1", chunk("two")).await;

        let first = rx.recv().await.expect("first frame");
        let second = rx.recv().await.expect("second frame");
        assert!(first.contains("one"));
        assert!(second.contains("two"));

        let envelope: Envelope = serde_json::from_str(&first).expect("parse envelope");
        assert_eq!(envelope.session_id, "s1");
    }

    #[tokio::test]
    async fn send_to_unbound_session_is_a_silent_noop() {
        let registry = ConnectionRegistry::new();
        // Must not panic or error
        registry.send("missing", chunk("dropped")).await;
        assert!(!registry.is_bound("missing").await);
    }

    #[tokio::test]
    async fn unbind_is_noop_when_absent() {
        let registry = ConnectionRegistry::new();
        registry.unbind("never-bound").await;
    }

    #[tokio::test]
    async fn unbind_if_only_removes_the_matching_handle() {
        let registry = ConnectionRegistry::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();

        registry.bind("s1", old_tx.clone()).await;
        registry.bind("s1", new_tx.clone()).await;

        // The superseded handle cannot unbind its replacement
        assert!(!registry.unbind_if("s1", &old_tx).await);
        assert!(registry.is_bound("s1").await);
        registry.send("s1", chunk("still routed")).await;
        assert!(new_rx.recv().await.is_some());

        // The live handle can
        assert!(registry.unbind_if("s1", &new_tx).await);
        assert!(!registry.is_bound("s1").await);
    }

    #[tokio::test]
    async fn rebinding_supersedes_the_first_connection() {
        let registry = ConnectionRegistry::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        registry.bind("s1", first_tx).await;
        registry.bind("s1", second_tx).await;

        registry.send("s1", chunk("after rebind")).await;

        assert!(second_rx.recv().await.is_some());
        // The superseded channel's sender was dropped by the registry
        assert!(first_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_unbind_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.bind("s1", tx).await;
        registry.unbind("s1").await;

        registry.send("s1", chunk("late")).await;
        assert!(rx.recv().await.is_none());
        assert!(!registry.is_bound("s1").await);
    }

    #[tokio::test]
    async fn send_with_closed_writer_does_not_error() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.bind("s1", tx).await;
        drop(rx);
        registry.send("s1", chunk("into the void")).await;
    }
}
