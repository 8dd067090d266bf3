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
//! Prompt and response safety guard.
//!
//! Wraps an OpenAI-style chat-completion call against a guardian judge model.
//! The judge answers `Yes` or `No`; everything that is not a clear `Yes`,
//! including an unconfigured client, a timeout, a transport error, or an
//! empty reply, is treated as safe (fail-open).

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const JUDGE_MODEL: &str = "granite-guardian";
const RISKY_TOKEN: &str = "Yes";

/// Deadline for one judge call. Independent of the stream context so a slow
/// judge cannot tie up stream lifecycle.
const JUDGE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("judge transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("judge returned status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

/// Chat-completion backend for the guard. The production implementation is
/// [`JudgeChatClient`]; tests substitute scripted completers.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, JudgeError>;
}

/// HTTP client for an OpenAI-compatible chat-completion endpoint.
pub struct JudgeChatClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl JudgeChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatCompleter for JudgeChatClient {
    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, JudgeError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(JudgeError::UnexpectedStatus(status));
        }

        Ok(response.json().await?)
    }
}

/// Orchestrates the judge with the policy knobs around it.
pub struct PromptGuard {
    model_name: String,
    risky_token: String,
    timeout: Duration,
    client: Option<Arc<dyn ChatCompleter>>,
}

impl PromptGuard {
    /// Builds a guard for the configured judge endpoint. An empty URL or key
    /// leaves the guard unconfigured: every check reports safe.
    pub fn new(guardian_url: &str, api_key: &str) -> Self {
        if guardian_url.is_empty() {
            warn!("[PromptGuard] guardian URL is not set, risk checks will be skipped");
        }
        if api_key.is_empty() {
            warn!("[PromptGuard] guardian API key is not set, risk checks will be skipped");
        }

        let client: Option<Arc<dyn ChatCompleter>> =
            if guardian_url.is_empty() || api_key.is_empty() {
                None
            } else {
                let full_base_url = format!("{}/openai/v1", guardian_url);
                debug!("[PromptGuard] initialized with base URL: {}", full_base_url);
                Some(Arc::new(JudgeChatClient::new(full_base_url, api_key)))
            };

        Self::with_client(client)
    }

    /// Builds a guard around an explicit completer.
    pub fn with_client(client: Option<Arc<dyn ChatCompleter>>) -> Self {
        Self {
            model_name: JUDGE_MODEL.to_string(),
            risky_token: RISKY_TOKEN.to_string(),
            timeout: JUDGE_TIMEOUT,
            client,
        }
    }

    /// Asks the judge whether `text` is risky. `true` only on a positive
    /// verdict: the trimmed content of the first choice matching the risky
    /// token case-insensitively.
    pub async fn check_risk(&self, text: &str) -> bool {
        let client = match &self.client {
            Some(client) => client,
            None => {
                debug!("[PromptGuard] client not initialized, skipping risk check");
                return false;
            }
        };

        let request = ChatCompletionRequest {
            model: self.model_name.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: text.to_string(),
            }],
            temperature: 0.01,
            max_tokens: 50,
        };

        let response = match tokio::time::timeout(
            self.timeout,
            client.create_chat_completion(request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("[PromptGuard] risk model call failed: {}", e);
                return false;
            }
            Err(_) => {
                warn!("[PromptGuard] risk model call timed out");
                return false;
            }
        };

        let verdict = match response.choices.first() {
            Some(choice) => choice.message.content.trim(),
            None => {
                warn!("[PromptGuard] no choices in judge response");
                return false;
            }
        };

        debug!("[PromptGuard] risk model verdict: {}", verdict);
        verdict.eq_ignore_ascii_case(&self.risky_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Completer that replies with a fixed verdict or error.
    struct ScriptedCompleter {
        reply: Result<&'static str, ()>,
    }

    #[async_trait]
    impl ChatCompleter for ScriptedCompleter {
        async fn create_chat_completion(
            &self,
            _request: ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, JudgeError> {
            match self.reply {
                Ok(content) => Ok(ChatCompletionResponse {
                    choices: vec![ChatChoice {
                        message: ChatMessage {
                            role: "assistant".to_string(),
                            content: content.to_string(),
                        },
                    }],
                }),
                Err(()) => Err(JudgeError::UnexpectedStatus(
                    reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                )),
            }
        }
    }

    /// Completer that never answers.
    struct StalledCompleter;

    #[async_trait]
    impl ChatCompleter for StalledCompleter {
        async fn create_chat_completion(
            &self,
            _request: ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, JudgeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ChatCompletionResponse::default())
        }
    }

    fn guard_with_reply(reply: Result<&'static str, ()>) -> PromptGuard {
        PromptGuard::with_client(Some(Arc::new(ScriptedCompleter { reply })))
    }

    #[tokio::test]
    async fn test_check_risk_positive_verdict() {
        assert!(guard_with_reply(Ok("Yes")).check_risk("do harm").await);
    }

    #[tokio::test]
    async fn test_check_risk_trims_and_ignores_case() {
        assert!(guard_with_reply(Ok(" Yes ")).check_risk("do harm").await);
        assert!(guard_with_reply(Ok("yes")).check_risk("do harm").await);
        assert!(guard_with_reply(Ok("YES")).check_risk("do harm").await);
    }

    #[tokio::test]
    async fn test_check_risk_negative_verdict() {
        assert!(!guard_with_reply(Ok("No")).check_risk("hello").await);
        assert!(!guard_with_reply(Ok("Yes, and more")).check_risk("hello").await);
        assert!(!guard_with_reply(Ok("")).check_risk("hello").await);
    }

    #[tokio::test]
    async fn test_check_risk_fails_open_on_error() {
        assert!(!guard_with_reply(Err(())).check_risk("do harm").await);
    }

    #[tokio::test]
    async fn test_check_risk_fails_open_without_client() {
        let guard = PromptGuard::with_client(None);
        assert!(!guard.check_risk("do harm").await);
    }

    #[tokio::test]
    async fn test_check_risk_fails_open_on_empty_choices() {
        struct EmptyCompleter;

        #[async_trait]
        impl ChatCompleter for EmptyCompleter {
            async fn create_chat_completion(
                &self,
                _request: ChatCompletionRequest,
            ) -> Result<ChatCompletionResponse, JudgeError> {
                Ok(ChatCompletionResponse::default())
            }
        }

        let guard = PromptGuard::with_client(Some(Arc::new(EmptyCompleter)));
        assert!(!guard.check_risk("do harm").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_risk_fails_open_on_timeout() {
        let guard = PromptGuard::with_client(Some(Arc::new(StalledCompleter)));
        assert!(!guard.check_risk("do harm").await);
    }

    #[tokio::test]
    async fn test_unconfigured_guard_has_no_client() {
        assert!(!PromptGuard::new("", "").check_risk("anything").await);
        assert!(!PromptGuard::new("http://judge", "").check_risk("anything").await);
        assert!(!PromptGuard::new("", "key").check_risk("anything").await);
    }
}
