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
//! Token-usage extraction.
//!
//! Parses an OpenAI-style `usage` object out of an upstream response body and
//! turns it into response headers. Pure: no I/O, no shared state, and no
//! observable effect on bodies without a `usage` field.

use crate::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use crate::envoy::service::ext_proc::v3::ProcessingResponse;
use crate::utils::mutations;
use log::debug;
use serde::Deserialize;

pub const PROMPT_TOKENS_HEADER: &str = "x-kuadrant-openai-prompt-tokens";
pub const COMPLETION_TOKENS_HEADER: &str = "x-kuadrant-openai-completion-tokens";
pub const TOTAL_TOKENS_HEADER: &str = "x-kuadrant-openai-total-tokens";

#[derive(Deserialize)]
struct UsageEnvelope {
    usage: Option<TokenUsage>,
}

/// OpenAI-style usage counters. Counters absent from the payload default to
/// zero; the `usage` key itself being absent means "no metrics".
#[derive(Debug, Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Default)]
pub struct TokenUsageMetrics;

impl TokenUsageMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Extracts token-usage headers from a response body. Returns `None` for
    /// invalid JSON, a missing `usage` key, or a `usage` value that does not
    /// match the expected shape.
    pub fn extract_headers(body: &[u8]) -> Option<Vec<HeaderValueOption>> {
        let envelope: UsageEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("[TokenUsage] response body has no parseable usage: {}", e);
                return None;
            }
        };

        let usage = envelope.usage?;
        Some(vec![
            usage_header(PROMPT_TOKENS_HEADER, usage.prompt_tokens),
            usage_header(COMPLETION_TOKENS_HEADER, usage.completion_tokens),
            usage_header(TOTAL_TOKENS_HEADER, usage.total_tokens),
        ])
    }

    /// Builds the ResponseBody acknowledgement for a final upstream body.
    /// Returns the response plus whether usage metrics were found; without
    /// metrics the acknowledgement is an empty pass-through.
    pub fn process_response_body(&self, body: &[u8]) -> (ProcessingResponse, bool) {
        match Self::extract_headers(body) {
            Some(headers) => {
                debug!("[TokenUsage] token usage headers added to response");
                (mutations::response_body_headers_ack(headers), true)
            }
            None => (mutations::response_body_ack(), false),
        }
    }
}

/// Headers replace any existing value rather than appending, so a retried or
/// proxied exchange cannot accumulate stale counters.
#[allow(deprecated)]
fn usage_header(key: &str, count: i64) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            raw_value: count.to_string().into_bytes(),
            ..Default::default()
        }),
        append: Some(false),
        append_action: 0,
        keep_empty_value: false,
    }
}
