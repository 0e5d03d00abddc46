//! Pipeline stage executor: the initial analysis run.
//!
//! Drives retrieval, the streamed reasoning narrative, and coordinate
//! extraction for one session, emitting typed events after each unit of
//! progress. Every failure inside a run is caught at the stage boundary and
//! converted into a single `error` event; a stage never crashes the session
//! or the process.

use crate::collab::{
    filter_by_threshold, CoordinateOutput, Match, Namespace, ReasoningModel, SimilarityIndex,
};
use crate::error::StageError;
use crate::prompt;
use crate::protocol::ServerEvent;
use crate::recover::recover_coordinates;
use crate::registry::ConnectionRegistry;
use crate::session::SessionManager;
use crate::upload::{ImagePayload, UploadStore};
use geolens_common::config::RetrievalConfig;
use std::sync::Arc;

/// Shared dependencies for pipeline and conversation stages.
#[derive(Clone)]
pub struct StageContext {
    pub registry: ConnectionRegistry,
    pub sessions: SessionManager,
    pub uploads: Arc<UploadStore>,
    pub index: Arc<dyn SimilarityIndex>,
    pub model: Arc<dyn ReasoningModel>,
    pub retrieval: RetrievalConfig,
}

/// Run the full analysis pipeline for a session.
///
/// This is the stage boundary: any error from the steps inside becomes
/// exactly one `error` event and the stage ends.
pub async fn run_analysis(ctx: &StageContext, session_id: &str) {
    if let Err(err) = analyze(ctx, session_id).await {
        tracing::warn!(session_id, error = %err, "Analysis stage failed");
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

async fn analyze(ctx: &StageContext, session_id: &str) -> Result<(), StageError> {
    status(ctx, session_id, "Analyzing uploaded image").await;
    let image = resolve_image(ctx, session_id).await?;

    status(ctx, session_id, "Retrieving similar locations").await;
    let visual = retrieve(ctx, &image, Namespace::Images).await?;
    let features = retrieve(ctx, &image, Namespace::Features).await?;
    tracing::debug!(
        session_id,
        visual = visual.len(),
        features = features.len(),
        "Retrieval complete"
    );

    status(ctx, session_id, "Reasoning about the location").await;
    let analysis = prompt::analysis_prompt(
        &prompt::format_visual_matches(&visual),
        &prompt::format_feature_matches(&features),
    );
    let mut stream = ctx.model.stream(&analysis, &image).await?;

    let mut reasoning = String::new();
    while let Some(fragment) = stream.next_fragment().await? {
        reasoning.push_str(&fragment);
        ctx.registry
            .send(session_id, ServerEvent::ReasoningChunk { text: fragment })
            .await;
    }

    status(ctx, session_id, "Estimating coordinates").await;
    emit_coordinates(ctx, session_id, &reasoning).await?;

    ctx.registry
        .send(
            session_id,
            ServerEvent::Complete {
                message: "Analysis complete".into(),
            },
        )
        .await;
    Ok(())
}

/// Resolve the session's uploaded image, or fail the run with no partial
/// output.
pub(crate) async fn resolve_image(
    ctx: &StageContext,
    session_id: &str,
) -> Result<ImagePayload, StageError> {
    let handle = ctx
        .sessions
        .upload_of(session_id)
        .await
        .ok_or(StageError::ImageNotFound)?;
    Ok(ctx.uploads.get(&handle).await?)
}

/// Query one namespace and re-apply the relevance threshold on the caller
/// side.
pub(crate) async fn retrieve(
    ctx: &StageContext,
    image: &ImagePayload,
    namespace: Namespace,
) -> Result<Vec<Match>, StageError> {
    let params = match namespace {
        Namespace::Images => &ctx.retrieval.images,
        Namespace::Features => &ctx.retrieval.features,
    };
    let matches = ctx
        .index
        .query_image(image, namespace, params.top_k, params.threshold)
        .await?;
    Ok(filter_by_threshold(matches, params.threshold))
}

/// Run coordinate extraction and emit its events.
///
/// Supports both collaborator behaviours: a single free-text response goes
/// through the recovery parser into one `coordinates` event; a streamed
/// response is forwarded chunk by chunk.
pub(crate) async fn emit_coordinates(
    ctx: &StageContext,
    session_id: &str,
    reasoning: &str,
) -> Result<(), StageError> {
    match ctx.model.infer_coordinates(reasoning).await? {
        CoordinateOutput::Full(raw) => {
            ctx.registry
                .send(
                    session_id,
                    ServerEvent::Coordinates {
                        text: recover_coordinates(&raw),
                    },
                )
                .await;
        }
        CoordinateOutput::Streamed(mut stream) => {
            while let Some(fragment) = stream.next_fragment().await? {
                ctx.registry
                    .send(session_id, ServerEvent::CoordinatesChunk { text: fragment })
                    .await;
            }
        }
    }
    Ok(())
}

async fn status(ctx: &StageContext, session_id: &str, message: &str) {
    ctx.registry
        .send(
            session_id,
            ServerEvent::Status {
                message: message.into(),
            },
        )
        .await;
}
