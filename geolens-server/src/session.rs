//! Session lifecycle: creation at upload time, connection binding, the
//! single-stage-at-a-time latch, and teardown on disconnect.

use crate::error::StageError;
use crate::protocol::{HistoryTurn, Role};
use crate::upload::UploadHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One conversation turn. Append-only; insertion order is meaningful because
/// it reconstructs context for the reasoning collaborator.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: i64,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One client's end-to-end interaction: uploaded image reference plus
/// conversation history. Discarded wholesale when the session closes.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub upload: Option<UploadHandle>,
    pub turns: Vec<ConversationTurn>,
    stage_active: bool,
}

/// Owner of all live sessions.
///
/// Within one session all stage work is strictly sequential (the stage latch
/// enforces it), so history never needs synchronization beyond this map.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to a stored upload, returning its identifier.
    pub async fn create_with_upload(&self, upload: UploadHandle) -> String {
        let id = Uuid::new_v4().to_string();
        let session = Session {
            upload: Some(upload),
            ..Default::default()
        };
        self.sessions.write().await.insert(id.clone(), session);
        tracing::info!(session_id = %id, "Session created");
        id
    }

    /// Ensure a session exists for this identifier.
    ///
    /// A client may connect before uploading; the connection is accepted and
    /// the first command fails with `ImageNotFound` instead.
    pub async fn ensure(&self, session_id: &str) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default();
    }

    /// Bind an upload to an existing session (upload after connect).
    pub async fn set_upload(&self, session_id: &str, upload: UploadHandle) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.to_string()).or_default();
        session.upload = Some(upload);
    }

    /// Look up the upload reference bound to a session.
    pub async fn upload_of(&self, session_id: &str) -> Option<UploadHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.upload.clone())
    }

    /// Mark a stage active for this session.
    ///
    /// Fails with `StageBusy` when a stage is already running; commands are
    /// rejected rather than queued so two runs never race history writes.
    pub async fn try_begin_stage(&self, session_id: &str) -> Result<(), StageError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.to_string()).or_default();
        if session.stage_active {
            return Err(StageError::StageBusy);
        }
        session.stage_active = true;
        Ok(())
    }

    /// Mark the running stage finished. No-op if the session is gone.
    pub async fn end_stage(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.stage_active = false;
        }
    }

    /// Append a turn to the session history.
    pub async fn append_turn(&self, session_id: &str, role: Role, text: impl Into<String>) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.turns.push(ConversationTurn::new(role, text));
        }
    }

    /// Snapshot of the session's conversation history.
    pub async fn history(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    /// Seed history from a client-supplied transcript, only when the server
    /// side history is empty (reconnect after a dropped session).
    pub async fn seed_history_if_empty(&self, session_id: &str, turns: &[HistoryTurn]) {
        if turns.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if session.turns.is_empty() {
                session.turns = turns
                    .iter()
                    .map(|t| ConversationTurn::new(t.role, t.text.clone()))
                    .collect();
            }
        }
    }

    /// Discard a session and all its state.
    pub async fn remove(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            tracing::info!(session_id, "Session discarded");
        }
    }

    /// Whether a session exists.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn handle() -> UploadHandle {
        UploadHandle {
            path: PathBuf::from("uploads/test.jpg"),
            mime: "image/jpeg".into(),
        }
    }

    #[tokio::test]
    async fn create_with_upload_binds_the_image() {
        let manager = SessionManager::new();
        let id = manager.create_with_upload(handle()).await;
        assert!(manager.contains(&id).await);
        assert!(manager.upload_of(&id).await.is_some());
    }

    #[tokio::test]
    async fn ensure_creates_session_without_upload() {
        let manager = SessionManager::new();
        manager.ensure("s1").await;
        assert!(manager.contains("s1").await);
        assert!(manager.upload_of("s1").await.is_none());
    }

    #[tokio::test]
    async fn second_stage_is_rejected_while_one_is_active() {
        let manager = SessionManager::new();
        manager.ensure("s1").await;

        manager.try_begin_stage("s1").await.expect("first begin");
        let second = manager.try_begin_stage("s1").await;
        assert!(matches!(second, Err(StageError::StageBusy)));

        manager.end_stage("s1").await;
        manager
            .try_begin_stage("s1")
            .await
            .expect("begin after end");
    }

    #[tokio::test]
    async fn stages_on_distinct_sessions_are_independent() {
        let manager = SessionManager::new();
        manager.try_begin_stage("a").await.expect("begin a");
        manager.try_begin_stage("b").await.expect("begin b");
    }

    #[tokio::test]
    async fn history_preserves_insertion_order() {
        let manager = SessionManager::new();
        manager.ensure("s1").await;
        manager.append_turn("s1", Role::User, "first").await;
        manager.append_turn("s1", Role::Assistant, "second").await;

        let turns = manager.history("s1").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "first");
        assert_eq!(turns[1].text, "second");
        assert!(turns[0].timestamp <= turns[1].timestamp);
    }

    #[tokio::test]
    async fn seed_only_applies_to_empty_history() {
        let manager = SessionManager::new();
        manager.ensure("s1").await;
        let transcript = vec![HistoryTurn {
            role: Role::User,
            text: "from client".into(),
        }];

        manager.seed_history_if_empty("s1", &transcript).await;
        assert_eq!(manager.history("s1").await.len(), 1);

        // Server history is now authoritative; a second seed is ignored
        let other = vec![
            HistoryTurn {
                role: Role::User,
                text: "a".into(),
            },
            HistoryTurn {
                role: Role::Assistant,
                text: "b".into(),
            },
        ];
        manager.seed_history_if_empty("s1", &other).await;
        assert_eq!(manager.history("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn remove_discards_all_state() {
        let manager = SessionManager::new();
        let id = manager.create_with_upload(handle()).await;
        manager.append_turn(&id, Role::User, "hello").await;

        manager.remove(&id).await;
        assert!(!manager.contains(&id).await);
        assert!(manager.history(&id).await.is_empty());
    }
}
