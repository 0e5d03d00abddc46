//! Conversation handler: follow-up questions over an existing analysis.
//!
//! Retrieval is re-run fresh for every question rather than cached from the
//! initial run, so each question gets its own relevance filtering. The
//! recalculation sub-protocol is driven solely by the reserved sentinel
//! token in the model's response.

use crate::collab::Namespace;
use crate::error::StageError;
use crate::pipeline::{emit_coordinates, retrieve, StageContext};
use crate::prompt::{self, RECALC_SENTINEL};
use crate::protocol::{HistoryTurn, Role, ServerEvent};

/// Run a follow-up turn for a session.
///
/// Stage boundary: any failure becomes exactly one `error` event.
pub async fn run_follow_up(
    ctx: &StageContext,
    session_id: &str,
    text: &str,
    history: &[HistoryTurn],
    override_session: Option<&str>,
) {
    if let Err(err) = follow_up(ctx, session_id, text, history, override_session).await {
        tracing::warn!(session_id, error = %err, "Follow-up stage failed");
        ctx.registry
            .send(
                session_id,
                ServerEvent::Error {
                    message: err.to_string(),
                },
            )
            .await;
    }
}

async fn follow_up(
    ctx: &StageContext,
    session_id: &str,
    text: &str,
    history: &[HistoryTurn],
    override_session: Option<&str>,
) -> Result<(), StageError> {
    // Validate the upload before any collaborator side-effect or history
    // mutation.
    let upload = ctx
        .sessions
        .upload_of(session_id)
        .await
        .ok_or(StageError::ImageNotFound)?;
    if let Some(other) = override_session {
        let other_upload = ctx
            .sessions
            .upload_of(other)
            .await
            .ok_or(StageError::ImageNotFound)?;
        if other_upload.path != upload.path {
            return Err(StageError::ImageNotFound);
        }
    }
    let image = ctx.uploads.get(&upload).await?;

    ctx.sessions.seed_history_if_empty(session_id, history).await;
    let prior = ctx.sessions.history(session_id).await;
    ctx.sessions.append_turn(session_id, Role::User, text).await;

    // Fresh retrieval per question
    let visual = retrieve(ctx, &image, Namespace::Images).await?;
    let features = retrieve(ctx, &image, Namespace::Features).await?;

    let chat_prompt = prompt::chat_prompt(
        text,
        &prompt::format_context(&prior),
        &prompt::format_visual_matches(&visual),
        &prompt::format_feature_matches(&features),
    );
    let mut stream = ctx.model.stream(&chat_prompt, &image).await?;

    let mut scrubber = SentinelScrubber::default();
    let mut shown = String::new();
    while let Some(fragment) = stream.next_fragment().await? {
        let emit = scrubber.feed(&fragment);
        if !emit.is_empty() {
            shown.push_str(&emit);
            ctx.registry
                .send(session_id, ServerEvent::ChatResponseChunk { text: emit })
                .await;
        }
    }
    let (rest, recalculate) = scrubber.finish();
    if !rest.is_empty() {
        shown.push_str(&rest);
        ctx.registry
            .send(session_id, ServerEvent::ChatResponseChunk { text: rest })
            .await;
    }

    if recalculate {
        tracing::info!(session_id, "Sentinel detected, recalculating coordinates");
        ctx.registry
            .send(
                session_id,
                ServerEvent::ChatResponseCoordinates {
                    text: "Recalculating coordinates".into(),
                },
            )
            .await;
        emit_coordinates(ctx, session_id, &shown).await?;
    }

    ctx.sessions
        .append_turn(session_id, Role::Assistant, shown)
        .await;
    ctx.registry
        .send(
            session_id,
            ServerEvent::Complete {
                message: "Response complete".into(),
            },
        )
        .await;
    Ok(())
}

/// Streaming scrubber for the recalculation sentinel.
///
/// Fragments may split the token across chunk boundaries, so the scrubber
/// holds back any trailing partial match until enough text arrives to decide.
/// The token itself is never emitted.
#[derive(Debug, Default)]
struct SentinelScrubber {
    pending: String,
    found: bool,
}

impl SentinelScrubber {
    /// Feed one fragment, returning the text that is safe to emit.
    fn feed(&mut self, fragment: &str) -> String {
        self.pending.push_str(fragment);

        while let Some(pos) = self.pending.find(RECALC_SENTINEL) {
            self.found = true;
            self.pending
                .replace_range(pos..pos + RECALC_SENTINEL.len(), "");
        }

        let holdback = longest_partial_sentinel_suffix(&self.pending);
        let emit_len = self.pending.len() - holdback;
        let remainder = self.pending.split_off(emit_len);
        std::mem::replace(&mut self.pending, remainder)
    }

    /// Flush held-back text and report whether the sentinel was seen.
    fn finish(self) -> (String, bool) {
        (self.pending, self.found)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// sentinel token.
fn longest_partial_sentinel_suffix(text: &str) -> usize {
    let max = (RECALC_SENTINEL.len() - 1).min(text.len());
    for len in (1..=max).rev() {
        if text.ends_with(&RECALC_SENTINEL[..len]) {
            return len;
        }
    }
    0
}
