//! geolens-server service entry point.

use anyhow::{Context, Result};
use geolens_common::config::Config;
use geolens_common::logging::init_logging;
use geolens_server::collab::gemini::GeminiModel;
use geolens_server::collab::mapillary::MapillaryClient;
use geolens_server::collab::pinecone::PineconeIndex;
use geolens_server::{
    build_router, AppState, ConnectionRegistry, SessionManager, StageContext, UploadStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_with_env()?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("GeoLens Server v{}", env!("CARGO_PKG_VERSION"));

    let uploads = Arc::new(
        UploadStore::new(&config.upload.dir).context("Failed to initialize upload store")?,
    );
    let index =
        Arc::new(PineconeIndex::new(&config.pinecone).context("Failed to configure Pinecone")?);
    let model = Arc::new(GeminiModel::new(&config.gemini));
    if !model.has_credentials() {
        anyhow::bail!("Gemini API key not found. Set GEMINI_API_KEY or GOOGLE_API_KEY.");
    }

    // Street-view lookup is optional; the route reports unavailable
    let street_view = match MapillaryClient::new(&config.mapillary) {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            tracing::warn!(error = %err, "Street-view lookup disabled");
            None
        }
    };

    let ctx = StageContext {
        registry: ConnectionRegistry::new(),
        sessions: SessionManager::new(),
        uploads,
        index,
        model,
        retrieval: config.retrieval.clone(),
    };
    let state = AppState {
        ctx,
        street_view,
        max_upload_bytes: config.upload.max_bytes,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = build_router(state).layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
