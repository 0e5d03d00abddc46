//! geolens-server - Streaming geolocation analysis over WebSocket.
//!
//! A client uploads a photo over HTTP, then opens a WebSocket for its
//! session and receives a staged analysis: retrieval of visually similar
//! reference data, a streamed reasoning narrative, ranked candidate
//! coordinates, and follow-up chat about the result.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod chat;
pub mod collab;
pub mod error;
pub mod pipeline;
pub mod prompt;
pub mod protocol;
pub mod recover;
pub mod registry;
pub mod routes;
pub mod session;
pub mod upload;
pub mod ws;

pub use error::{ServerError, StageError};
pub use pipeline::StageContext;
pub use protocol::{CandidateLocation, ClientCommand, Envelope, ServerEvent};
pub use registry::ConnectionRegistry;
pub use routes::{build_router, AppState};
pub use session::SessionManager;
pub use upload::{ImagePayload, UploadStore};
