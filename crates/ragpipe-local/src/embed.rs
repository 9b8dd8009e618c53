use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use ragpipe_core::{EmbeddingBackend, Error, Result};

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str) -> bool {
    env(key)
        .and_then(|s| s.parse::<bool>().ok())
        .unwrap_or(false)
}

pub const DEFAULT_HASH_DIMENSIONS: usize = 256;

/// Deterministic embeddings from hashed character trigrams.
///
/// Not a semantic model: two texts score close when they share vocabulary,
/// not meaning. Good enough to rank and diversify chunks without any
/// external service, and byte-for-byte reproducible across runs, which is
/// what the offline path and the test suite need.
#[derive(Debug, Clone)]
pub struct HashedEmbeddings {
    dimensions: usize,
}

impl HashedEmbeddings {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(Error::NotConfigured(
                "embedding dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let lower = text.to_lowercase();

        // Stop words carry no signal and would dominate the frequency map.
        let stop_words: HashSet<&str> = [
            "the", "is", "at", "which", "on", "a", "an", "as", "are", "was", "were", "for", "to",
            "of", "in", "and", "or", "but", "with", "by", "from", "this", "that", "be", "have",
            "has", "had", "it", "its", "their", "they", "them",
        ]
        .iter()
        .copied()
        .collect();

        let words: Vec<&str> = lower
            .split_whitespace()
            .filter(|w| !stop_words.contains(w) && w.len() > 2)
            .collect();

        let mut word_freq: HashMap<&str, u32> = HashMap::new();
        for word in &words {
            *word_freq.entry(word).or_insert(0) += 1;
        }

        for (word, freq) in word_freq.iter() {
            // Each character trigram of the word lights up one dimension.
            let chars: Vec<char> = word.chars().collect();
            for i in 0..chars.len().saturating_sub(2) {
                let trigram = format!("{}{}{}", chars[i], chars[i + 1], chars[i + 2]);
                let hash = trigram
                    .bytes()
                    .fold(0u64, |acc, b| acc.wrapping_mul(37).wrapping_add(b as u64));
                let dim_idx = (hash % self.dimensions as u64) as usize;
                // sqrt scale so a repeated word does not drown out the rest.
                embedding[dim_idx] += (*freq as f32).sqrt();
            }

            // The whole word gets a dimension too, at full frequency weight.
            let word_hash = word
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            let word_idx = (word_hash % self.dimensions as u64) as usize;
            embedding[word_idx] += *freq as f32;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in embedding.iter_mut() {
                *v /= norm;
            }
        }

        embedding
    }
}

#[async_trait::async_trait]
impl EmbeddingBackend for HashedEmbeddings {
    fn name(&self) -> &'static str {
        "hashed"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

const DEFAULT_OLLAMA_EMBED_MODEL: &str = "nomic-embed-text";
const DEFAULT_OLLAMA_EMBED_DIMENSIONS: usize = 768;
const EMBED_MAX_ATTEMPTS: u32 = 3;
const EMBED_INITIAL_BACKOFF_MS: u64 = 100;
const EMBED_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Embeddings from a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaEmbeddings {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbeddings {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        // Opt-in: don't accidentally start calling localhost if the user didn't ask for it.
        let enabled = env_bool("RAGPIPE_OLLAMA_EMBED");
        if !enabled {
            return Err(Error::NotConfigured(
                "RAGPIPE_OLLAMA_EMBED is not set (or false)".to_string(),
            ));
        }
        let base_url =
            env("RAGPIPE_OLLAMA_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        let model = env("RAGPIPE_OLLAMA_EMBED_MODEL")
            .unwrap_or_else(|| DEFAULT_OLLAMA_EMBED_MODEL.to_string());
        let dimensions = env("RAGPIPE_EMBED_DIMENSIONS")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_OLLAMA_EMBED_DIMENSIONS);
        Ok(Self {
            client,
            base_url,
            model,
            dimensions,
        })
    }

    fn endpoint_embeddings(&self) -> String {
        format!("{}/api/embeddings", self.base_url.trim_end_matches('/'))
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>> {
        let req = OllamaEmbedRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let resp = self
            .client
            .post(self.endpoint_embeddings())
            .timeout(std::time::Duration::from_secs(EMBED_REQUEST_TIMEOUT_SECS))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Embed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Embed(format!("ollama embeddings HTTP {status}")));
        }

        let parsed: OllamaEmbedResponse =
            resp.json().await.map_err(|e| Error::Embed(e.to_string()))?;
        if parsed.embedding.len() != self.dimensions {
            return Err(Error::Embed(format!(
                "ollama returned {} dimensions, expected {} (check RAGPIPE_EMBED_DIMENSIONS)",
                parsed.embedding.len(),
                self.dimensions
            )));
        }
        Ok(parsed.embedding)
    }

    async fn embed_with_retries(&self, text: &str) -> Result<Vec<f32>> {
        let mut last_err = None;
        for attempt in 0..EMBED_MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff_ms = EMBED_INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            }
            match self.embed_once(text).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "ollama embed attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Embed("ollama embeddings: no attempts made".to_string())))
    }
}

#[async_trait::async_trait]
impl EmbeddingBackend for OllamaEmbeddings {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // The /api/embeddings endpoint takes one prompt per call.
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_with_retries(text).await?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

/// Pick an embedding backend from the environment.
///
/// Defaults to the hashed backend, which needs no server and no key.
/// Set `RAGPIPE_OLLAMA_EMBED=true` to route through a local Ollama instead.
pub fn embeddings_from_env(client: &reqwest::Client) -> Result<Box<dyn EmbeddingBackend>> {
    if env_bool("RAGPIPE_OLLAMA_EMBED") {
        return Ok(Box::new(OllamaEmbeddings::from_env(client.clone())?));
    }
    let dimensions = env("RAGPIPE_EMBED_DIMENSIONS")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_HASH_DIMENSIONS);
    Ok(Box::new(HashedEmbeddings::new(dimensions)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }

        fn unset(k: &'static str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::remove_var(k);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = self.prev.take() {
                std::env::set_var(self.k, v);
            } else {
                std::env::remove_var(self.k);
            }
        }
    }

    #[tokio::test]
    async fn hashed_vectors_are_unit_length() {
        let backend = HashedEmbeddings::new(DEFAULT_HASH_DIMENSIONS).unwrap();
        let v = backend.embed("rabies virus incubation period in humans").await.unwrap();
        assert_eq!(v.len(), DEFAULT_HASH_DIMENSIONS);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001, "norm was {norm}");
    }

    #[tokio::test]
    async fn hashed_vectors_are_deterministic() {
        let backend = HashedEmbeddings::new(128).unwrap();
        let a = backend.embed("post-exposure prophylaxis schedule").await.unwrap();
        let b = backend.embed("post-exposure prophylaxis schedule").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn distinct_texts_get_distinct_vectors() {
        let backend = HashedEmbeddings::new(128).unwrap();
        let a = backend.embed("rabies symptoms in dogs").await.unwrap();
        let b = backend.embed("async runtime scheduling internals").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn stop_words_alone_embed_to_zero() {
        let backend = HashedEmbeddings::new(64).unwrap();
        let v = backend.embed("the and with from of").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let backend = HashedEmbeddings::new(64).unwrap();
        let texts = vec!["first topic entirely".to_string(), "second topic entirely".to_string()];
        let batch = backend.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], backend.embed(&texts[0]).await.unwrap());
        assert_eq!(batch[1], backend.embed(&texts[1]).await.unwrap());
    }

    #[test]
    fn zero_dimensions_is_rejected() {
        assert!(HashedEmbeddings::new(0).is_err());
    }

    #[test]
    fn factory_defaults_to_hashed() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::unset("RAGPIPE_OLLAMA_EMBED");
        let _g2 = EnvGuard::unset("RAGPIPE_EMBED_DIMENSIONS");
        let client = reqwest::Client::new();
        let backend = embeddings_from_env(&client).unwrap();
        assert_eq!(backend.name(), "hashed");
        assert_eq!(backend.dimensions(), DEFAULT_HASH_DIMENSIONS);
    }

    #[test]
    fn factory_honors_dimension_override() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::unset("RAGPIPE_OLLAMA_EMBED");
        let _g2 = EnvGuard::set("RAGPIPE_EMBED_DIMENSIONS", "96");
        let client = reqwest::Client::new();
        let backend = embeddings_from_env(&client).unwrap();
        assert_eq!(backend.dimensions(), 96);
    }

    #[test]
    fn factory_routes_to_ollama_when_gated_on() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _g1 = EnvGuard::set("RAGPIPE_OLLAMA_EMBED", "true");
        let _g2 = EnvGuard::unset("RAGPIPE_EMBED_DIMENSIONS");
        let client = reqwest::Client::new();
        let backend = embeddings_from_env(&client).unwrap();
        assert_eq!(backend.name(), "ollama");
        assert_eq!(backend.dimensions(), DEFAULT_OLLAMA_EMBED_DIMENSIONS);
    }
}
