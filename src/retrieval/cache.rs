//! LRU + TTL cache for retrieval results.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::types::Document;

/// Cache key for a `(query, top_k)` pair. Queries are trimmed and lowercased
/// first, so "What's my bill?" and " what's my BILL? " share an entry.
pub fn cache_key(query: &str, top_k: usize) -> String {
    let normalized = format!("{}:{top_k}", query.trim().to_lowercase());
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}

#[derive(Debug)]
struct Entry {
    documents: Vec<Document>,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct RetrievalCache {
    entries: HashMap<String, Entry>,
    /// Least recently used at the front.
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl RetrievalCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    /// Cached documents, if present and fresh. Expired entries are removed.
    pub fn get(&mut self, key: &str) -> Option<Vec<Document>> {
        let expired = self.entries.get(key)?.stored_at.elapsed() > self.ttl;
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.documents.clone())
    }

    pub fn insert(&mut self, key: String, documents: Vec<Document>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.contains_key(&key) {
            self.touch(&key);
        } else {
            while self.entries.len() >= self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
            self.order.push_back(key.clone());
        }
        self.entries.insert(
            key,
            Entry {
                documents,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}
