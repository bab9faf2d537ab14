//! Token counting using tiktoken-rs.
//!
//! Uses the cl100k_base encoding. The encoder is built once; counts are
//! cached by content hash since the same chunk text is counted on every
//! answer against a namespace.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

const TOKEN_CACHE_SIZE: usize = 10_000;

lazy_static! {
    static ref BPE: Option<CoreBPE> = match cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            warn!(error = %e, "cl100k_base unavailable, falling back to estimates");
            None
        }
    };
    static ref TOKEN_CACHE: RwLock<TokenCache> = RwLock::new(TokenCache::new(TOKEN_CACHE_SIZE));
}

/// Cache for token counts, keyed by content hash
pub struct TokenCache {
    cache: HashMap<u64, u32>,
    max_size: usize,
}

impl TokenCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size),
            max_size,
        }
    }

    pub fn get(&self, hash: u64) -> Option<u32> {
        self.cache.get(&hash).copied()
    }

    pub fn insert(&mut self, hash: u64, count: u32) {
        // At capacity: drop half
        if self.cache.len() >= self.max_size {
            let keys_to_remove: Vec<_> =
                self.cache.keys().take(self.max_size / 2).copied().collect();
            for key in keys_to_remove {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(hash, count);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Count tokens in text using cl100k_base encoding.
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let content_hash = hash_content(text);
    if let Some(count) = TOKEN_CACHE.read().get(content_hash) {
        return count;
    }

    let count = match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => estimate_tokens_quick(text),
    };

    TOKEN_CACHE.write().insert(content_hash, count);
    count
}

/// Quick estimate: ~4 chars per token
pub fn estimate_tokens_quick(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_empty() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_count_tokens_simple() {
        let count = count_tokens("Hello, world!");
        assert!(count > 0);
        assert!(count < 10);
    }

    #[test]
    fn test_count_tokens_cached() {
        let text = "Maternity expenses are covered after a waiting period of 24 months.";
        let count1 = count_tokens(text);
        let count2 = count_tokens(text);
        assert_eq!(count1, count2);
    }

    #[test]
    fn test_estimate_tokens_quick() {
        let text = "Hello world this is a test";
        let estimate = estimate_tokens_quick(text);
        let actual = count_tokens(text);
        assert!(estimate <= actual * 2);
        assert!(estimate >= actual / 2);
    }

    #[test]
    fn test_cache_evicts_half_at_capacity() {
        let mut cache = TokenCache::new(4);
        for i in 0..4 {
            cache.insert(i, i as u32);
        }
        assert_eq!(cache.len(), 4);
        cache.insert(99, 7);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(99), Some(7));
    }
}
