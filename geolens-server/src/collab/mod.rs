//! Collaborator interfaces consumed by the orchestrator.
//!
//! Everything the pipeline calls out to lives behind these traits so the
//! retrieval index and reasoning model are swappable I/O edges. The real
//! clients are in the submodules; tests supply mocks.

pub mod gemini;
pub mod mapillary;
pub mod pinecone;

use crate::upload::ImagePayload;
use async_trait::async_trait;
use geolens_common::Result;
use serde::{Deserialize, Serialize};

/// Retrieval namespace within the similarity index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Geotagged reference images (broad visual match set).
    Images,
    /// Detected feature descriptions.
    Features,
}

impl Namespace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Features => "features",
        }
    }
}

/// One similarity match with its collaborator-assigned score and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Match {
    pub fn latitude(&self) -> Option<f64> {
        self.metadata.get("latitude").and_then(|v| v.as_f64())
    }

    pub fn longitude(&self) -> Option<f64> {
        self.metadata.get("longitude").and_then(|v| v.as_f64())
    }

    pub fn text(&self) -> Option<&str> {
        self.metadata.get("text").and_then(|v| v.as_str())
    }
}

/// Drop matches below the relevance threshold.
///
/// The index accepts a threshold parameter but is not guaranteed to honour
/// it, so the caller filters again before any match reaches a prompt.
pub fn filter_by_threshold(matches: Vec<Match>, threshold: f32) -> Vec<Match> {
    matches.into_iter().filter(|m| m.score >= threshold).collect()
}

/// Vector-similarity search over an image query.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Query a namespace for the nearest matches to an image.
    ///
    /// Returned matches keep the index's own ranking order.
    async fn query_image(
        &self,
        image: &ImagePayload,
        namespace: Namespace,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<Match>>;
}

/// A lazy, finite, non-restartable producer of text fragments.
///
/// Pull-based: `next_fragment` yields the next chunk or `None` once the
/// stream is exhausted. Consumers forward each fragment as it arrives.
#[async_trait]
pub trait FragmentStream: Send {
    async fn next_fragment(&mut self) -> Result<Option<String>>;
}

pub type BoxFragmentStream = Box<dyn FragmentStream>;

impl std::fmt::Debug for dyn FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FragmentStream")
    }
}

/// Output of the coordinate-extraction call: either the full free text in
/// one piece, or a fragment stream when the collaborator streams.
pub enum CoordinateOutput {
    Full(String),
    Streamed(BoxFragmentStream),
}

/// Generative reasoning collaborator.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    /// Stream a reasoning narrative for a prompt grounded on an image.
    async fn stream(&self, prompt: &str, image: &ImagePayload) -> Result<BoxFragmentStream>;

    /// Turn accumulated reasoning text into loosely formatted coordinate
    /// candidates (free text expected to embed a JSON array).
    async fn infer_coordinates(&self, reasoning: &str) -> Result<CoordinateOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scored(score: f32) -> Match {
        Match {
            score,
            metadata: json!({}),
        }
    }

    #[test]
    fn namespace_wire_names() {
        assert_eq!(Namespace::Images.as_str(), "images");
        assert_eq!(Namespace::Features.as_str(), "features");
    }

    #[test]
    fn threshold_filter_drops_sub_relevance_matches() {
        let matches = vec![scored(0.9), scored(0.6), scored(0.55)];
        let kept = filter_by_threshold(matches, 0.6);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|m| m.score >= 0.6));
    }

    #[test]
    fn match_metadata_accessors() {
        let m = Match {
            score: 0.8,
            metadata: json!({"latitude": 48.85, "longitude": 2.29, "text": "wrought-iron lattice"}),
        };
        assert_eq!(m.latitude(), Some(48.85));
        assert_eq!(m.longitude(), Some(2.29));
        assert_eq!(m.text(), Some("wrought-iron lattice"));

        let empty = scored(0.5);
        assert!(empty.latitude().is_none());
        assert!(empty.text().is_none());
    }
}
