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
//! The consolidated stream processor.
//!
//! One handler drives all three features over a single ext_proc stream:
//! request-side safety check and semantic-cache lookup, the buffered-body
//! mode override on response headers, and response-side safety check, cache
//! population and token-usage headers on the final body. They are combined in
//! one processor because the response body must be buffered and parsed
//! exactly once; separate filters would each request buffering and each parse
//! the same JSON.
//!
//! Payload parse failures and external-service failures downgrade the current
//! turn to a pass-through acknowledgement. Blocks are only emitted on
//! positive risk verdicts and cached responses only on positive similarity
//! hits.

use crate::config::Config;
use crate::embedding::{EmbeddingClient, EmbeddingFetcher};
use crate::envoy::service::ext_proc::v3::{
    processing_request::Request as ProcessingRequestVariant, ProcessingRequest, ProcessingResponse,
};
use crate::prompt_guard::PromptGuard;
use crate::semantic_cache::{CacheEntry, SemanticCache};
use crate::token_usage::TokenUsageMetrics;
use crate::utils::mutations;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

const PROMPT_BLOCKED_MESSAGE: &str = "Prompt blocked by content policy";
const RESPONSE_BLOCKED_MESSAGE: &str = "LLM output blocked by safety filter";

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Processing failed: {0}")]
    Failed(String),
}

/// Scratch state scoped to one ext_proc stream. The service loop creates a
/// context with a unique id when Envoy opens the stream; the handler for that
/// stream is the sole writer, and the context is dropped at stream end.
#[derive(Debug, Default)]
pub struct StreamContext {
    stream_id: u64,
    prompt: Option<String>,
    request_body: Vec<u8>,
    response_body: Vec<u8>,
}

impl StreamContext {
    pub fn new(stream_id: u64) -> Self {
        Self {
            stream_id,
            ..Default::default()
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

/// An external processor: one method per ext_proc message kind, invoked by
/// the per-stream service loop with that stream's scratch context.
#[async_trait]
pub trait ExtProcessor: Send + Sync + 'static {
    async fn process_request_headers(
        &self,
        req: &ProcessingRequest,
        ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError>;
    async fn process_response_headers(
        &self,
        req: &ProcessingRequest,
        ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError>;
    async fn process_request_body(
        &self,
        req: &ProcessingRequest,
        ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError>;
    async fn process_response_body(
        &self,
        req: &ProcessingRequest,
        ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError>;
}

/// The gateway processor combining semantic cache, safety guard and
/// token-usage extraction.
pub struct GatewayProcessor {
    semantic_cache: Arc<SemanticCache>,
    prompt_guard: Arc<PromptGuard>,
    token_metrics: TokenUsageMetrics,
    prompt_risk_enabled: bool,
    response_risk_enabled: bool,
}

impl GatewayProcessor {
    pub fn new(config: &Config) -> Self {
        let fetcher: Option<Arc<dyn EmbeddingFetcher>> = if config.embedding_server_url.is_empty()
        {
            info!("[Processor] no embedding server configured, semantic lookups disabled");
            None
        } else {
            Some(Arc::new(EmbeddingClient::new(
                config.embedding_server_url.clone(),
                config.embedding_model_host.clone(),
            )))
        };

        Self::with_parts(
            Arc::new(SemanticCache::new(fetcher, config.similarity_threshold)),
            Arc::new(PromptGuard::new(
                &config.guardian_url,
                &config.guardian_api_key,
            )),
            config.prompt_risk_enabled,
            config.response_risk_enabled,
        )
    }

    /// Assembles a processor from pre-built collaborators.
    pub fn with_parts(
        semantic_cache: Arc<SemanticCache>,
        prompt_guard: Arc<PromptGuard>,
        prompt_risk_enabled: bool,
        response_risk_enabled: bool,
    ) -> Self {
        Self {
            semantic_cache,
            prompt_guard,
            token_metrics: TokenUsageMetrics::new(),
            prompt_risk_enabled,
            response_risk_enabled,
        }
    }

    /// Request decision procedure, run once on the complete request body.
    async fn finish_request_body(
        &self,
        body: &[u8],
        ctx: &mut StreamContext,
    ) -> ProcessingResponse {
        let payload: Value = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[Processor] failed to parse request body: {}", e);
                return mutations::request_body_ack();
            }
        };

        let prompt = match extract_prompt(&payload) {
            Some(prompt) => prompt,
            None => {
                debug!(
                    "[Processor] stream {}: no prompt in request body, passing through",
                    ctx.stream_id
                );
                return mutations::request_body_ack();
            }
        };

        debug!("[Processor] stream {}: prompt '{}'", ctx.stream_id, prompt);
        ctx.prompt = Some(prompt.clone());

        if self.prompt_risk_enabled && self.prompt_guard.check_risk(&prompt).await {
            info!("[Processor] risky prompt detected, returning 403");
            return mutations::forbidden_response(PROMPT_BLOCKED_MESSAGE);
        }

        let embedding = match self.semantic_cache.resolve_embedding(&prompt).await {
            Some(embedding) => embedding,
            None => return mutations::request_body_ack(),
        };

        let (best, similarity) = self.semantic_cache.lookup(&embedding);
        if let Some(entry) = best {
            let threshold = self.semantic_cache.similarity_threshold();
            if similarity >= threshold && !entry.response.is_empty() {
                info!(
                    "[Processor] semantic cache hit with similarity {:.3}",
                    similarity
                );
                let headers =
                    TokenUsageMetrics::extract_headers(&entry.response).unwrap_or_default();
                return mutations::cached_response(entry.response.clone(), headers);
            }
            debug!(
                "[Processor] best similarity {:.3} below threshold {:.3}, no cache hit",
                similarity, threshold
            );
        }

        mutations::request_body_ack()
    }

    /// Response finalization procedure, run once on the complete upstream
    /// body: safety check on the generated text, cache population, then
    /// token-usage headers.
    async fn finish_response_body(
        &self,
        body: Vec<u8>,
        ctx: &mut StreamContext,
    ) -> ProcessingResponse {
        if self.response_risk_enabled {
            if let Some(generated) = extract_generated_text(&body) {
                if !generated.is_empty() && self.prompt_guard.check_risk(&generated).await {
                    info!("[Processor] risky model output detected, blocking response");
                    return mutations::forbidden_response(RESPONSE_BLOCKED_MESSAGE);
                }
            }
        }

        if let Some(prompt) = ctx.prompt.take() {
            if let Some(embedding) = self.semantic_cache.memo_get(&prompt) {
                self.semantic_cache.append(CacheEntry {
                    prompt: prompt.clone(),
                    embedding,
                    response: body.clone(),
                    create_time: SystemTime::now(),
                });
                debug!(
                    "[Processor] stream {}: cached response for prompt '{}'",
                    ctx.stream_id, prompt
                );
            }
        }

        let (response, _metrics_found) = self.token_metrics.process_response_body(&body);
        response
    }
}

#[async_trait]
impl ExtProcessor for GatewayProcessor {
    async fn process_request_headers(
        &self,
        _req: &ProcessingRequest,
        _ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError> {
        Ok(mutations::request_headers_ack())
    }

    async fn process_response_headers(
        &self,
        _req: &ProcessingRequest,
        _ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError> {
        Ok(mutations::buffered_response_headers_ack())
    }

    async fn process_request_body(
        &self,
        req: &ProcessingRequest,
        ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError> {
        if let Some(ProcessingRequestVariant::RequestBody(body)) = &req.request {
            ctx.request_body.extend_from_slice(&body.body);
            if !body.end_of_stream {
                return Ok(mutations::request_body_ack());
            }

            let buffered = std::mem::take(&mut ctx.request_body);
            return Ok(self.finish_request_body(&buffered, ctx).await);
        }

        Ok(ProcessingResponse::default())
    }

    async fn process_response_body(
        &self,
        req: &ProcessingRequest,
        ctx: &mut StreamContext,
    ) -> Result<ProcessingResponse, ProcessingError> {
        if let Some(ProcessingRequestVariant::ResponseBody(body)) = &req.request {
            ctx.response_body.extend_from_slice(&body.body);
            if !body.end_of_stream {
                return Ok(mutations::response_body_ack());
            }

            let buffered = std::mem::take(&mut ctx.response_body);
            return Ok(self.finish_response_body(buffered, ctx).await);
        }

        Ok(ProcessingResponse::default())
    }
}

/// Extracts the prompt from a request payload: the `prompt` string field, or
/// the joined contents of chat-style `messages` when `prompt` is absent.
fn extract_prompt(payload: &Value) -> Option<String> {
    if let Some(prompt) = payload.get("prompt").and_then(Value::as_str) {
        return Some(prompt.to_string());
    }

    let messages = payload.get("messages")?.as_array()?;
    let parts: Vec<&str> = messages
        .iter()
        .filter_map(|message| message.get("content").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Extracts the generated text from an upstream response payload:
/// `choices[0].text` in the completion layout, `choices[0].message.content`
/// in the chat layout.
fn extract_generated_text(body: &[u8]) -> Option<String> {
    let payload: Value = serde_json::from_slice(body).ok()?;
    let first = payload.get("choices")?.as_array()?.first()?;

    if let Some(text) = first.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    first
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}
