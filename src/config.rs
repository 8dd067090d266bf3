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
//! Environment-variable configuration.
//!
//! All configuration comes from the process environment; there is no config
//! file and no persisted state. Features whose dependencies are absent are
//! disabled at startup with a warning rather than treated as errors.

use log::warn;
use serde::Deserialize;
use std::env;

/// Disables a risk check when an env var carries exactly this value.
const DISABLE_VALUE: &str = "yes";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port for the ext_proc gRPC listener (`EXT_PROC_PORT`).
    pub port: u16,

    /// Port for the plain-HTTP health probe (`HEALTH_CHECK_PORT`).
    pub health_check_port: u16,

    /// Embedding endpoint URL (`EMBEDDING_MODEL_SERVER`); empty disables
    /// semantic lookups.
    pub embedding_server_url: String,

    /// Optional Host header override for the embedding endpoint
    /// (`EMBEDDING_MODEL_HOST`).
    pub embedding_model_host: String,

    /// Cosine-similarity cutoff for cache hits (`SIMILARITY_THRESHOLD`),
    /// a decimal in [0, 1].
    pub similarity_threshold: f64,

    /// Judge base URL (`GUARDIAN_URL`); the judge endpoint is
    /// `${GUARDIAN_URL}/openai/v1`.
    pub guardian_url: String,

    /// Judge credential (`GUARDIAN_API_KEY`).
    pub guardian_api_key: String,

    /// Request-side safety check, on unless `DISABLE_PROMPT_RISK_CHECK=yes`.
    pub prompt_risk_enabled: bool,

    /// Response-side safety check, on unless `DISABLE_RESPONSE_RISK_CHECK=yes`.
    pub response_risk_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 50051,
            health_check_port: 8080,
            embedding_server_url: String::new(),
            embedding_model_host: String::new(),
            similarity_threshold: 0.75,
            guardian_url: String::new(),
            guardian_api_key: String::new(),
            prompt_risk_enabled: true,
            response_risk_enabled: true,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment, falling back to
    /// defaults for anything absent or malformed.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(raw) = env::var("EXT_PROC_PORT") {
            match parse_port(&raw) {
                Some(port) => config.port = port,
                None => warn!("[Config] ignoring invalid EXT_PROC_PORT={}", raw),
            }
        }

        if let Ok(raw) = env::var("HEALTH_CHECK_PORT") {
            match parse_port(&raw) {
                Some(port) => config.health_check_port = port,
                None => warn!("[Config] ignoring invalid HEALTH_CHECK_PORT={}", raw),
            }
        }

        config.embedding_server_url = env::var("EMBEDDING_MODEL_SERVER").unwrap_or_default();
        config.embedding_model_host = env::var("EMBEDDING_MODEL_HOST").unwrap_or_default();
        if config.embedding_server_url.is_empty() {
            warn!("[Config] EMBEDDING_MODEL_SERVER is not set; semantic cache lookups are disabled");
        }

        if let Ok(raw) = env::var("SIMILARITY_THRESHOLD") {
            match parse_threshold(&raw) {
                Some(threshold) => config.similarity_threshold = threshold,
                None => warn!("[Config] ignoring invalid SIMILARITY_THRESHOLD={}", raw),
            }
        }

        config.guardian_url = env::var("GUARDIAN_URL").unwrap_or_default();
        config.guardian_api_key = env::var("GUARDIAN_API_KEY").unwrap_or_default();
        if config.guardian_url.is_empty() {
            warn!("[Config] GUARDIAN_URL is not set; risk checks are a no-op");
        }
        if config.guardian_api_key.is_empty() {
            warn!("[Config] GUARDIAN_API_KEY is not set; risk checks are a no-op");
        }

        config.prompt_risk_enabled = !risk_check_disabled(env::var("DISABLE_PROMPT_RISK_CHECK").ok());
        config.response_risk_enabled =
            !risk_check_disabled(env::var("DISABLE_RESPONSE_RISK_CHECK").ok());

        config
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.parse().ok()
}

/// Similarity thresholds outside [0, 1] are rejected so a typo cannot turn
/// every lookup into a hit (or a miss).
fn parse_threshold(raw: &str) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    if (0.0..=1.0).contains(&value) {
        Some(value)
    } else {
        None
    }
}

fn risk_check_disabled(value: Option<String>) -> bool {
    value.as_deref() == Some(DISABLE_VALUE)
}
