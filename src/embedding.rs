// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Embedding model client.
//!
//! One-shot POST against a Vertex-style prediction endpoint:
//! `{"instances": ["<prompt>"]}` in, `{"predictions": [[f, f, ...], ...]}`
//! out. Every failure mode collapses to `None`; the caller treats a missing
//! embedding as "skip the semantic lookup", never as an error.

use async_trait::async_trait;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadline for one embedding fetch. This is the effective bound on
/// request-turn latency when the cache is cold.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of prompt embeddings. The production implementation is
/// [`EmbeddingClient`]; tests substitute scripted fetchers.
#[async_trait]
pub trait EmbeddingFetcher: Send + Sync {
    /// Returns the embedding vector for `prompt`, or `None` when the fetch
    /// fails for any reason.
    async fn fetch_embedding(&self, prompt: &str) -> Option<Vec<f64>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    instances: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    predictions: Vec<Vec<f64>>,
}

/// HTTP client for the embedding model server.
pub struct EmbeddingClient {
    server_url: String,
    model_host: String,
    client: reqwest::Client,
}

impl EmbeddingClient {
    /// Creates a client for `server_url`. A non-empty `model_host` is sent as
    /// the HTTP `Host` header so the request can be routed through a gateway
    /// that expects a virtual host.
    pub fn new(server_url: impl Into<String>, model_host: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            model_host: model_host.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingFetcher for EmbeddingClient {
    async fn fetch_embedding(&self, prompt: &str) -> Option<Vec<f64>> {
        debug!("[Embedding] fetching embedding from {}", self.server_url);

        let request = EmbeddingRequest {
            instances: vec![prompt],
        };

        let mut builder = self
            .client
            .post(&self.server_url)
            .timeout(FETCH_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&request);
        if !self.model_host.is_empty() {
            builder = builder.header(reqwest::header::HOST, &self.model_host);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("[Embedding] fetch failed: {}", e);
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            error!("[Embedding] unexpected status: {}", status);
            return None;
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                error!("[Embedding] failed to read response body: {}", e);
                return None;
            }
        };

        parse_predictions(&body)
    }
}

/// Pulls `predictions[0]` out of a response body. An empty vector is treated
/// the same as a missing one.
fn parse_predictions(body: &[u8]) -> Option<Vec<f64>> {
    let parsed: EmbeddingResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("[Embedding] failed to parse response: {}", e);
            return None;
        }
    };

    let embedding = parsed.predictions.into_iter().next()?;
    if embedding.is_empty() {
        None
    } else {
        Some(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_predictions() {
        let body = br#"{"predictions": [[0.1, -0.2, 0.3]]}"#;
        assert_eq!(parse_predictions(body), Some(vec![0.1, -0.2, 0.3]));
    }

    #[test]
    fn test_parse_predictions_returns_first_vector() {
        let body = br#"{"predictions": [[1.0, 0.0], [0.0, 1.0]]}"#;
        assert_eq!(parse_predictions(body), Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_parse_predictions_empty_list() {
        assert_eq!(parse_predictions(br#"{"predictions": []}"#), None);
    }

    #[test]
    fn test_parse_predictions_empty_vector() {
        assert_eq!(parse_predictions(br#"{"predictions": [[]]}"#), None);
    }

    #[test]
    fn test_parse_predictions_missing_field() {
        assert_eq!(parse_predictions(br#"{"outputs": [[1.0]]}"#), None);
    }

    #[test]
    fn test_parse_predictions_invalid_json() {
        assert_eq!(parse_predictions(b"not json"), None);
    }
}
