//! Mapillary street-view lookup.
//!
//! Fetches thumbnail URLs for imagery captured near a coordinate, used by
//! the frontend to show reference views next to a candidate location.

use geolens_common::config::MapillaryConfig;
use geolens_common::{Error, Result};
use reqwest::Client;
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://graph.mapillary.com";

/// Bounding-box half-width in degrees around the query point.
const BBOX_DELTA: f64 = 0.003;

/// Mapillary graph API client.
#[derive(Debug)]
pub struct MapillaryClient {
    api_key: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    thumb_1024_url: Option<String>,
}

impl MapillaryClient {
    pub fn new(config: &MapillaryConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("MAPILLARY_API_KEY is not set".into()))?;
        Ok(Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| Client::new()),
        })
    }

    /// Point the client at a different API host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Thumbnail URLs for imagery near a coordinate.
    pub async fn nearby_images(&self, lat: f64, lon: f64, limit: usize) -> Result<Vec<String>> {
        let bbox = format!(
            "{},{},{},{}",
            lon - BBOX_DELTA,
            lat - BBOX_DELTA,
            lon + BBOX_DELTA,
            lat + BBOX_DELTA
        );
        let url = format!("{}/images", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("access_token", self.api_key.as_str()),
                ("fields", "id,thumb_1024_url"),
                ("bbox", bbox.as_str()),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::External(format!("Mapillary request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::External(format!(
                "Mapillary error ({})",
                status.as_u16()
            )));
        }

        let parsed: ImagesResponse = response
            .json()
            .await
            .map_err(|e| Error::External(format!("Failed to parse Mapillary response: {e}")))?;
        Ok(parsed
            .data
            .into_iter()
            .filter_map(|entry| entry.thumb_1024_url)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MapillaryClient {
        MapillaryClient::new(&MapillaryConfig {
            api_key: Some("map-key".into()),
        })
        .expect("client")
        .with_base_url(server.uri())
    }

    #[test]
    fn missing_key_is_rejected() {
        let err = MapillaryClient::new(&MapillaryConfig::default()).expect_err("config error");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn returns_thumbnail_urls_and_skips_entries_without_one() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images"))
            .and(query_param("access_token", "map-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"id": "1", "thumb_1024_url": "https://img.example/1.jpg"},
                    {"id": "2"}
                ]
            })))
            .mount(&server)
            .await;

        let urls = client(&server)
            .nearby_images(48.8584, 2.2945, 5)
            .await
            .expect("lookup");
        assert_eq!(urls, vec!["https://img.example/1.jpg"]);
    }

    #[tokio::test]
    async fn upstream_error_is_external() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server)
            .nearby_images(0.0, 0.0, 5)
            .await
            .expect_err("error");
        assert!(matches!(err, Error::External(_)));
    }
}
