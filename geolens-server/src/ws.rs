//! WebSocket handling: one connection per session.
//!
//! The socket is split into a writer task fed by the registry's channel and
//! a read loop that parses commands. Each accepted command runs as its own
//! spawned stage task; the read loop stays free to reject concurrent
//! commands with `StageBusy` while a stage is running.

use crate::chat;
use crate::pipeline::{self, StageContext};
use crate::protocol::{ClientCommand, ServerEvent};
use crate::routes::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// WebSocket upgrade handler for `/ws/{session_id}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state.ctx))
}

/// Drive one connection from bind to teardown.
async fn handle_socket(socket: WebSocket, session_id: String, ctx: StageContext) {
    tracing::info!(session_id, "WebSocket connected");

    // A connection without a prior upload is accepted; the first command
    // will fail with ImageNotFound instead.
    ctx.sessions.ensure(&session_id).await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    ctx.registry.bind(&session_id, outbound_tx.clone()).await;

    // Writer task: forward serialized frames to the socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                tracing::debug!("WebSocket send failed, client disconnected");
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                tracing::debug!(session_id, "Client sent close frame");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(session_id, error = %err, "WebSocket transport error");
                break;
            }
        };

        let command: ClientCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(session_id, error = %err, "Unparseable command");
                ctx.registry
                    .send(
                        &session_id,
                        ServerEvent::Error {
                            message: format!("Unrecognized command: {err}"),
                        },
                    )
                    .await;
                continue;
            }
        };

        dispatch_command(&ctx, &session_id, command).await;
    }

    // Teardown: unbind first so a still-running stage's sends become no-ops,
    // then discard session state. A connection superseded by a rebind skips
    // both steps; the replacement owns the binding and the session now.
    if ctx.registry.unbind_if(&session_id, &outbound_tx).await {
        ctx.sessions.remove(&session_id).await;
    } else {
        tracing::debug!(session_id, "Superseded connection closed, session kept");
    }
    writer.abort();
    tracing::info!(session_id, "WebSocket closed");
}

/// Accept or reject one command and spawn its stage task.
///
/// A command arriving while a stage is active for the session is rejected
/// with `StageBusy`, never queued or interleaved.
pub(crate) async fn dispatch_command(
    ctx: &StageContext,
    session_id: &str,
    command: ClientCommand,
) {
    if let Err(err) = ctx.sessions.try_begin_stage(session_id).await {
        ctx.registry
            .send(
                session_id,
                ServerEvent::Error {
                    message: err.to_string(),
                },
            )
            .await;
        return;
    }

    let ctx = ctx.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        match command {
            ClientCommand::ProcessImage => {
                pipeline::run_analysis(&ctx, &session_id).await;
            }
            ClientCommand::ChatMessage {
                text,
                history,
                session_id: override_session,
            } => {
                chat::run_follow_up(
                    &ctx,
                    &session_id,
                    &text,
                    &history,
                    override_session.as_deref(),
                )
                .await;
            }
        }
        ctx.sessions.end_stage(&session_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{
        attach_upload, context_with, drain_events, event_tags, CannedIndex, ScriptedModel,
    };
    use crate::protocol::Role;

    #[tokio::test]
    async fn busy_session_rejects_second_command_without_history_mutation() {
        let (ctx, mut rx, _model, _dir) =
            context_with(CannedIndex::default(), ScriptedModel::default(), "s1").await;
        attach_upload(&ctx, "s1").await;
        ctx.sessions.append_turn("s1", Role::User, "hello").await;

        // Hold the stage latch as if a pipeline run were in flight
        ctx.sessions.try_begin_stage("s1").await.expect("latch");

        dispatch_command(
            &ctx,
            "s1",
            ClientCommand::ChatMessage {
                text: "second".into(),
                history: Vec::new(),
                session_id: None,
            },
        )
        .await;

        let events = drain_events(&mut rx);
        assert_eq!(event_tags(&events), vec!["error"]);
        let ServerEvent::Error { message } = &events[0] else {
            panic!("expected error event");
        };
        assert!(message.contains("already running"));

        // No turn was appended by the rejected command
        assert_eq!(ctx.sessions.history("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn dispatched_analysis_releases_the_latch_when_done() {
        let (ctx, mut rx, _model, _dir) =
            context_with(CannedIndex::default(), ScriptedModel::default(), "s1").await;
        attach_upload(&ctx, "s1").await;

        dispatch_command(&ctx, "s1", ClientCommand::ProcessImage).await;

        // The stage runs on a spawned task; wait for it to release the latch
        for _ in 0..500 {
            if ctx.sessions.try_begin_stage("s1").await.is_ok() {
                let tags = event_tags(&drain_events(&mut rx));
                assert!(tags.contains(&"complete"));
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        panic!("stage latch never released");
    }
}
