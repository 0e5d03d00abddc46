//! Configuration management for GeoLens services.
//!
//! Configuration lives in a JSON file at `~/.geolens/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (GEOLENS_* prefix, plus collaborator API keys)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `GEOLENS_PORT` → server.port
//! - `GEOLENS_BIND_ADDRESS` → server.bind
//! - `GEOLENS_UPLOAD_DIR` → upload.dir
//! - `GEOLENS_LOG_LEVEL` → observability.log_level
//! - `PINECONE_API_KEY` → pinecone.api_key
//! - `PINECONE_INDEX_HOST` → pinecone.index_host
//! - `GOOGLE_API_KEY` / `GEMINI_API_KEY` → gemini.api_key
//! - `MAPILLARY_API_KEY` → mapillary.api_key

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".geolens"),
        |dirs| dirs.home_dir().join(".geolens"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Server Configuration
// ============================================================================

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Default: "127.0.0.1" (local only).
    /// Set to "0.0.0.0" for remote access.
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port for the service.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins. Empty list means allow any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

// ============================================================================
// Upload Configuration
// ============================================================================

/// Image upload store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory where uploaded images are stored.
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,

    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

// ============================================================================
// Retrieval Configuration
// ============================================================================

/// Per-namespace retrieval parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Number of nearest neighbours to request.
    pub top_k: usize,
    /// Minimum similarity score; matches below are discarded by the caller
    /// even if the index honours its own threshold parameter.
    pub threshold: f32,
}

/// Similarity retrieval configuration for both query namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Geotagged reference image namespace.
    #[serde(default = "default_images_namespace")]
    pub images: NamespaceConfig,

    /// Detected feature description namespace.
    #[serde(default = "default_features_namespace")]
    pub features: NamespaceConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            images: default_images_namespace(),
            features: default_features_namespace(),
        }
    }
}

fn default_images_namespace() -> NamespaceConfig {
    NamespaceConfig {
        top_k: 25,
        threshold: 0.7,
    }
}

fn default_features_namespace() -> NamespaceConfig {
    NamespaceConfig {
        top_k: 10,
        threshold: 0.6,
    }
}

// ============================================================================
// Collaborator Configuration
// ============================================================================

/// Pinecone vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PineconeConfig {
    /// Index host URL (e.g. "https://geolens-abc123.svc.pinecone.io").
    #[serde(default)]
    pub index_host: Option<String>,

    /// API key. Usually supplied via `PINECONE_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Embedding service endpoint used to vectorize query images.
    #[serde(default)]
    pub embedding_endpoint: Option<String>,
}

/// Gemini reasoning model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Model identifier.
    #[serde(default = "default_gemini_model")]
    pub model: String,

    /// API key. Usually supplied via `GOOGLE_API_KEY` or `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: default_gemini_model(),
            api_key: None,
        }
    }
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".into()
}

/// Mapillary street-view lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MapillaryConfig {
    /// API key. Usually supplied via `MAPILLARY_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for GeoLens services.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub pinecone: PineconeConfig,

    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default)]
    pub mapillary: MapillaryConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration and apply environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("GEOLENS_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(bind) = std::env::var("GEOLENS_BIND_ADDRESS") {
            self.server.bind = bind;
        }
        if let Ok(dir) = std::env::var("GEOLENS_UPLOAD_DIR") {
            self.upload.dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("GEOLENS_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        // Collaborator API key fallbacks
        if let Ok(key) = std::env::var("PINECONE_API_KEY") {
            self.pinecone.api_key = Some(key);
        }
        if let Ok(host) = std::env::var("PINECONE_INDEX_HOST") {
            self.pinecone.index_host = Some(host);
        }
        if let Ok(key) =
            std::env::var("GOOGLE_API_KEY").or_else(|_| std::env::var("GEMINI_API_KEY"))
        {
            self.gemini.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("MAPILLARY_API_KEY") {
            self.mapillary.api_key = Some(key);
        }
    }
}
