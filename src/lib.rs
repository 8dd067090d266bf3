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
//! Envoy `ext_proc` callout for LLM inference gateways.
//!
//! One consolidated external processor combines three concerns over a single
//! bidirectional stream: a semantic response cache keyed by prompt-embedding
//! similarity, prompt/response safety checks against a guardian judge model,
//! and token-usage headers extracted from the upstream response body.

mod gen;

pub use gen::envoy;
pub use gen::grpc;

pub mod config;
pub mod embedding;
pub mod processor;
pub mod prompt_guard;
pub mod semantic_cache;
pub mod server;
pub mod service;
pub mod token_usage;
pub mod utils;
