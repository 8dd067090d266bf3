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
//! Semantic response cache.
//!
//! Two layers of state, both process-wide:
//!
//! - the **corpus**: an append-only sequence of cached exchanges, scanned
//!   linearly under a single mutex for the best cosine match;
//! - the **embedding memo**: a concurrent prompt → embedding map that avoids
//!   re-fetching the embedding for an exact prompt already seen.
//!
//! The linear scan is adequate for tens to low hundreds of entries; a larger
//! corpus would need an approximate-nearest-neighbor index behind the same
//! `lookup` interface.

use crate::embedding::EmbeddingFetcher;
use dashmap::DashMap;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// A cached exchange. The response holds the raw upstream body, stored
/// verbatim so it can be replayed byte-for-byte on a hit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub prompt: String,
    pub embedding: Vec<f64>,
    pub response: Vec<u8>,
    pub create_time: SystemTime,
}

pub struct SemanticCache {
    entries: Mutex<Vec<Arc<CacheEntry>>>,
    embedding_memo: DashMap<String, Vec<f64>>,
    fetcher: Option<Arc<dyn EmbeddingFetcher>>,
    similarity_threshold: f64,
}

impl SemanticCache {
    /// Creates a cache. A `None` fetcher disables embedding resolution for
    /// prompts that are not already memoized, which in turn disables
    /// semantic lookups for them.
    pub fn new(fetcher: Option<Arc<dyn EmbeddingFetcher>>, similarity_threshold: f64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            embedding_memo: DashMap::new(),
            fetcher,
            similarity_threshold,
        }
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Returns the best-matching entry over the current corpus and its cosine
    /// similarity. Ties are broken in favor of the first-inserted entry; an
    /// empty corpus yields `(None, 0.0)`.
    ///
    /// The whole scan runs under the corpus mutex, so a concurrent `append`
    /// is observed either entirely or not at all.
    pub fn lookup(&self, embedding: &[f64]) -> (Option<Arc<CacheEntry>>, f64) {
        let entries = self.entries.lock().expect("corpus mutex poisoned");
        let mut best: Option<Arc<CacheEntry>> = None;
        let mut best_similarity = 0.0;
        for entry in entries.iter() {
            let similarity = cosine_similarity(embedding, &entry.embedding);
            if similarity > best_similarity {
                best_similarity = similarity;
                best = Some(entry.clone());
            }
        }
        (best, best_similarity)
    }

    /// Appends an entry to the corpus.
    pub fn append(&self, entry: CacheEntry) {
        let mut entries = self.entries.lock().expect("corpus mutex poisoned");
        entries.push(Arc::new(entry));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("corpus mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memo_get(&self, prompt: &str) -> Option<Vec<f64>> {
        self.embedding_memo.get(prompt).map(|entry| entry.value().clone())
    }

    pub fn memo_put(&self, prompt: &str, embedding: Vec<f64>) {
        self.embedding_memo.insert(prompt.to_string(), embedding);
    }

    /// Resolves the embedding for `prompt`: memo hit first, then the
    /// configured fetcher, memoizing on success. `None` when no fetcher is
    /// configured or the fetch came back empty.
    pub async fn resolve_embedding(&self, prompt: &str) -> Option<Vec<f64>> {
        if let Some(embedding) = self.memo_get(prompt) {
            debug!("[SemanticCache] exact-match memo hit for embedding");
            return Some(embedding);
        }

        let fetcher = self.fetcher.as_ref()?;
        let embedding = fetcher.fetch_embedding(prompt).await?;
        if embedding.is_empty() {
            return None;
        }

        debug!("[SemanticCache] memoized new embedding, len={}", embedding.len());
        self.memo_put(prompt, embedding.clone());
        Some(embedding)
    }
}

/// Cosine similarity, with the convention that either vector having zero norm
/// yields 0. Callers are expected to compare vectors of equal length; both
/// sides come from the same embedding service.
fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher that always returns the same vector and counts invocations.
    struct FixedFetcher {
        embedding: Vec<f64>,
        calls: AtomicUsize,
    }

    impl FixedFetcher {
        fn new(embedding: Vec<f64>) -> Self {
            Self {
                embedding,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingFetcher for FixedFetcher {
        async fn fetch_embedding(&self, _prompt: &str) -> Option<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.embedding.clone())
        }
    }

    fn entry(prompt: &str, embedding: Vec<f64>, response: &[u8]) -> CacheEntry {
        CacheEntry {
            prompt: prompt.to_string(),
            embedding,
            response: response.to_vec(),
            create_time: SystemTime::now(),
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let similarity = cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!((similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let similarity = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((similarity + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_similarity_zero_norm() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 1.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_lookup_empty_corpus() {
        let cache = SemanticCache::new(None, 0.75);
        let (best, similarity) = cache.lookup(&[1.0, 0.0]);
        assert!(best.is_none());
        assert_eq!(similarity, 0.0);
    }

    #[test]
    fn test_lookup_picks_best_match() {
        let cache = SemanticCache::new(None, 0.75);
        cache.append(entry("a", vec![1.0, 0.0], b"response-a"));
        cache.append(entry("b", vec![0.0, 1.0], b"response-b"));

        let (best, similarity) = cache.lookup(&[0.1, 0.9]);
        let best = best.expect("expected a best entry");
        assert_eq!(best.prompt, "b");
        assert!(similarity > 0.9);
    }

    #[test]
    fn test_lookup_tie_prefers_first_inserted() {
        let cache = SemanticCache::new(None, 0.75);
        cache.append(entry("first", vec![1.0, 0.0], b"first"));
        cache.append(entry("second", vec![1.0, 0.0], b"second"));

        let (best, similarity) = cache.lookup(&[1.0, 0.0]);
        assert_eq!(best.expect("expected a best entry").prompt, "first");
        assert!((similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_returns_response_bytes_verbatim() {
        let cache = SemanticCache::new(None, 0.75);
        let body = br#"{"choices":[{"text":"x"}]}"#;
        cache.append(entry("a", vec![1.0, 0.0], body));

        let (best, _) = cache.lookup(&[1.0, 0.0]);
        assert_eq!(best.expect("expected a best entry").response, body.to_vec());
    }

    #[test]
    fn test_memo_roundtrip() {
        let cache = SemanticCache::new(None, 0.75);
        assert!(cache.memo_get("q").is_none());
        cache.memo_put("q", vec![0.5, 0.5]);
        assert_eq!(cache.memo_get("q"), Some(vec![0.5, 0.5]));
    }

    #[tokio::test]
    async fn test_resolve_embedding_memoizes_fetch() {
        let fetcher = Arc::new(FixedFetcher::new(vec![1.0, 0.0]));
        let cache = SemanticCache::new(Some(fetcher.clone()), 0.75);

        assert_eq!(cache.resolve_embedding("q").await, Some(vec![1.0, 0.0]));
        assert_eq!(cache.resolve_embedding("q").await, Some(vec![1.0, 0.0]));

        // second resolution must come from the memo
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_embedding_without_fetcher() {
        let cache = SemanticCache::new(None, 0.75);
        assert_eq!(cache.resolve_embedding("q").await, None);

        // memoized prompts still resolve with no fetcher configured
        cache.memo_put("seen", vec![0.2]);
        assert_eq!(cache.resolve_embedding("seen").await, Some(vec![0.2]));
    }

    #[tokio::test]
    async fn test_resolve_embedding_empty_fetch_not_memoized() {
        let fetcher = Arc::new(FixedFetcher::new(Vec::new()));
        let cache = SemanticCache::new(Some(fetcher), 0.75);

        assert_eq!(cache.resolve_embedding("q").await, None);
        assert!(cache.memo_get("q").is_none());
    }
}
