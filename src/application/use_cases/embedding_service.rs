//! Text embedding with a small in-process cache.
//!
//! All vectors come from the configured provider model and share one
//! fixed dimension declared at startup; a mismatch is a configuration
//! fault, not a retryable condition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::domain::error::{AppError, Result};
use crate::infrastructure::llm_clients::LlmClient;
use crate::shared::backoff::{retry_transient, BackoffPolicy};

/// Cache entry with TTL support.
#[derive(Clone)]
struct CacheEntry {
    embedding: Vec<f32>,
    created_at: Instant,
}

/// LRU-like cache for embeddings with TTL. Keyed by (model, text).
pub struct EmbeddingCache {
    cache: HashMap<String, CacheEntry>,
    max_size: usize,
    ttl: Duration,
    /// Track access order for LRU eviction
    access_order: Vec<String>,
}

impl EmbeddingCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            cache: HashMap::new(),
            max_size,
            ttl: Duration::from_secs(ttl_secs),
            access_order: Vec::new(),
        }
    }

    /// Get an embedding from cache if it exists and is not expired.
    pub fn get(&mut self, model: &str, text: &str) -> Option<Vec<f32>> {
        let key = Self::make_key(model, text);

        let result = if let Some(entry) = self.cache.get(&key) {
            if entry.created_at.elapsed() < self.ttl {
                Some(entry.embedding.clone())
            } else {
                None
            }
        } else {
            None
        };

        if result.is_some() {
            self.touch(&key);
        } else if self.cache.contains_key(&key) {
            // Expired, remove it
            self.cache.remove(&key);
            self.access_order.retain(|k| k != &key);
        }

        result
    }

    /// Put an embedding into cache, evicting the oldest entries at capacity.
    pub fn put(&mut self, model: &str, text: &str, embedding: Vec<f32>) {
        let key = Self::make_key(model, text);

        while self.cache.len() >= self.max_size && !self.access_order.is_empty() {
            let oldest = self.access_order.remove(0);
            self.cache.remove(&oldest);
        }

        self.cache.insert(
            key.clone(),
            CacheEntry {
                embedding,
                created_at: Instant::now(),
            },
        );
        self.access_order.push(key);
    }

    fn touch(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
        self.access_order.push(key.to_string());
    }

    /// Hash (model, text) so long inputs do not bloat the key set.
    fn make_key(model: &str, text: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        text.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.access_order.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Default cache size (1000 embeddings)
const DEFAULT_CACHE_SIZE: usize = 1000;
/// Default TTL in seconds (1 hour)
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Embedding front-end shared by retrieval, DRG resolution and learning.
pub struct EmbeddingService {
    llm: Arc<dyn LlmClient>,
    model: String,
    dimension: usize,
    backoff: BackoffPolicy,
    cache: Mutex<EmbeddingCache>,
}

impl EmbeddingService {
    pub fn new(llm: Arc<dyn LlmClient>, model: String, dimension: usize) -> Self {
        Self {
            llm,
            model,
            dimension,
            backoff: BackoffPolicy::default(),
            cache: Mutex::new(EmbeddingCache::new(
                DEFAULT_CACHE_SIZE,
                DEFAULT_CACHE_TTL_SECS,
            )),
        }
    }

    /// The declared vector dimension every embedding must carry.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed `text`, serving repeats from the cache.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(embedding) = cache.get(&self.model, text) {
                return Ok(embedding);
            }
        }

        let embedding =
            retry_transient(&self.backoff, || self.llm.embed(&self.model, text)).await?;

        if embedding.len() != self.dimension {
            return Err(AppError::Internal(format!(
                "Embedder returned dimension {} but {} is configured for model {}",
                embedding.len(),
                self.dimension,
                self.model
            )));
        }

        {
            let mut cache = self.cache.lock().unwrap();
            cache.put(&self.model, text, embedding.clone());
        }

        Ok(embedding)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot_product / (norm_a * norm_b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::llm_clients::{ChatRequest, ToolSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        dimension: usize,
    }

    #[async_trait]
    impl LlmClient for CountingEmbedder {
        async fn chat(&self, _request: &ChatRequest) -> Result<String> {
            unimplemented!()
        }

        async fn chat_with_tool(
            &self,
            _request: &ChatRequest,
            _tool: &ToolSpec,
        ) -> Result<serde_json::Value> {
            unimplemented!()
        }

        async fn embed(&self, _model: &str, input: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seed = input.len() as f32;
            Ok((0..self.dimension).map(|i| seed + i as f32).collect())
        }
    }

    fn service(dimension: usize, declared: usize) -> (Arc<CountingEmbedder>, EmbeddingService) {
        let client = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            dimension,
        });
        let service = EmbeddingService::new(
            Arc::clone(&client) as Arc<dyn LlmClient>,
            "test-embed".to_string(),
            declared,
        );
        (client, service)
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_second_call() {
        let (client, service) = service(8, 8);
        let first = service.embed("hip replacement").await.unwrap();
        let second = service.embed("hip replacement").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let (_, service) = service(8, 1536);
        let err = service.embed("hip replacement").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let similarity = EmbeddingService::cosine_similarity(&a, &b);
        assert!((similarity - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0];
        let similarity = EmbeddingService::cosine_similarity(&a, &c);
        assert!(similarity.abs() < 0.001);
    }

    #[test]
    fn test_cache_eviction() {
        let mut cache = EmbeddingCache::new(2, 3600);
        cache.put("m", "a", vec![1.0]);
        cache.put("m", "b", vec![2.0]);
        cache.put("m", "c", vec![3.0]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("m", "a").is_none());
        assert!(cache.get("m", "c").is_some());
    }
}
