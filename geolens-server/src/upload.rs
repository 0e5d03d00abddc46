//! Disk-backed upload store.
//!
//! Stores raw image bytes under the configured uploads directory and hands
//! out content handles that sessions keep instead of the bytes themselves.

use geolens_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Reference to a stored upload. Sessions hold this, never raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadHandle {
    pub path: PathBuf,
    pub mime: String,
}

/// A resolved image: raw bytes plus their MIME type, ready to be embedded
/// or forwarded to a collaborator.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Supported image formats, sniffed from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    /// Sniff the format from the first bytes of the payload.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(Self::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }

    pub const fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }
}

/// Filesystem-backed upload store.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store an image and return its content handle.
    pub async fn put(&self, bytes: &[u8], format: ImageFormat) -> Result<UploadHandle> {
        let filename = format!("{}.{}", Uuid::new_v4(), format.extension());
        let path = self.dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "Upload stored");
        Ok(UploadHandle {
            path,
            mime: format.mime().to_string(),
        })
    }

    /// Resolve a handle back to the stored bytes.
    pub async fn get(&self, handle: &UploadHandle) -> Result<ImagePayload> {
        let bytes = tokio::fs::read(&handle.path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("upload {}", handle.path.display()))
            } else {
                Error::Io(err)
            }
        })?;
        Ok(ImagePayload {
            bytes,
            mime: handle.mime.clone(),
        })
    }
}
