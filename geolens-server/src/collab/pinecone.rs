//! Pinecone-backed similarity index.
//!
//! Query images are vectorized by an external embedding service, then the
//! vector is searched against the configured Pinecone index host. Metadata
//! is passed through untyped; the namespaces carry different shapes
//! (lat/lon for images, description text for features).

use super::{Match, Namespace, SimilarityIndex};
use crate::upload::ImagePayload;
use async_trait::async_trait;
use base64::Engine;
use geolens_common::config::PineconeConfig;
use geolens_common::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Pinecone REST client plus its embedding sidecar.
#[derive(Debug)]
pub struct PineconeIndex {
    index_host: String,
    api_key: String,
    embedding_endpoint: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    image: String,
    mime: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    #[serde(rename = "topK")]
    top_k: usize,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    score: f32,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl PineconeIndex {
    /// Create a client from configuration.
    ///
    /// Fails when the index host, API key, or embedding endpoint is missing;
    /// the service cannot run retrieval without all three.
    pub fn new(config: &PineconeConfig) -> Result<Self> {
        let index_host = config
            .index_host
            .clone()
            .ok_or_else(|| Error::Config("pinecone.index_host is not set".into()))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("PINECONE_API_KEY is not set".into()))?;
        let embedding_endpoint = config
            .embedding_endpoint
            .clone()
            .ok_or_else(|| Error::Config("pinecone.embedding_endpoint is not set".into()))?;

        Ok(Self {
            index_host,
            api_key,
            embedding_endpoint,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        })
    }

    /// Vectorize an image through the embedding service.
    async fn embed(&self, image: &ImagePayload) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            image: base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            mime: &image.mime,
        };
        let response = self
            .client
            .post(&self.embedding_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::External(format!("Embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::External(format!(
                "Embedding service error ({})",
                status.as_u16()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::External(format!("Failed to parse embedding response: {e}")))?;
        if parsed.vector.is_empty() {
            return Err(Error::External("Embedding service returned an empty vector".into()));
        }
        Ok(parsed.vector)
    }
}

#[async_trait]
impl SimilarityIndex for PineconeIndex {
    async fn query_image(
        &self,
        image: &ImagePayload,
        namespace: Namespace,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<Match>> {
        let vector = self.embed(image).await?;

        let request = QueryRequest {
            vector: &vector,
            top_k,
            include_metadata: true,
            namespace: namespace.as_str(),
        };
        let url = format!("{}/query", self.index_host.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::External(format!("Pinecone query failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "Pinecone error ({}): {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::External(format!("Failed to parse Pinecone response: {e}")))?;

        // Pre-filter here too; callers still re-apply their own threshold
        Ok(parsed
            .matches
            .into_iter()
            .filter(|m| threshold <= 0.0 || m.score >= threshold)
            .map(|m| Match {
                score: m.score,
                metadata: m.metadata,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn image() -> ImagePayload {
        ImagePayload {
            bytes: vec![0xFF, 0xD8, 0xFF],
            mime: "image/jpeg".into(),
        }
    }

    fn config(server: &MockServer) -> PineconeConfig {
        PineconeConfig {
            index_host: Some(server.uri()),
            api_key: Some("pc-key".into()),
            embedding_endpoint: Some(format!("{}/embed", server.uri())),
        }
    }

    async fn mount_embed(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"vector": [0.1, 0.2]})),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn missing_config_is_rejected() {
        let err = PineconeIndex::new(&PineconeConfig::default()).expect_err("config error");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn query_embeds_then_searches_the_namespace() {
        let server = MockServer::start().await;
        mount_embed(&server).await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(header("Api-Key", "pc-key"))
            .and(body_partial_json(
                serde_json::json!({"namespace": "images", "topK": 25, "includeMetadata": true}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "matches": [
                    {"score": 0.92, "metadata": {"latitude": 48.85, "longitude": 2.29}},
                    {"score": 0.45, "metadata": {"latitude": 0.0, "longitude": 0.0}}
                ]
            })))
            .mount(&server)
            .await;

        let index = PineconeIndex::new(&config(&server)).expect("client");
        let matches = index
            .query_image(&image(), Namespace::Images, 25, 0.7)
            .await
            .expect("query");

        // The sub-threshold match was already dropped client-side
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].latitude(), Some(48.85));
    }

    #[tokio::test]
    async fn upstream_failure_is_an_external_error() {
        let server = MockServer::start().await;
        mount_embed(&server).await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(500).set_body_string("index unavailable"))
            .mount(&server)
            .await;

        let index = PineconeIndex::new(&config(&server)).expect("client");
        let err = index
            .query_image(&image(), Namespace::Features, 10, 0.6)
            .await
            .expect_err("upstream error");
        assert!(matches!(err, Error::External(_)));
    }
}
