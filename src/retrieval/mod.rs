//! Retrieval engine: cached embedding + vector search.
//!
//! Two trigger paths share one cache. Confirmed or likely intents that need
//! retrieval start a background lookup whose result is published as a
//! [`RetrievalEvent`]; the controller may also call
//! [`RetrievalEngine::retrieve_with_timeout`] directly when it needs context
//! before generating. A failed lookup is retried once after a short pause;
//! a second failure, or a timeout, yields an empty result.

pub mod backends;
pub mod cache;
pub mod embedding;
pub mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::events::{IntentConfidence, RetrievalEvent};
use crate::bus::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::config::RetrievalConfig;
use crate::error::{AgentError, Result};

pub use backends::{EmbeddingProvider, InMemoryVectorStore, VectorStore};
pub use cache::{RetrievalCache, cache_key};
pub use embedding::HttpEmbeddingProvider;
pub use types::{Document, RetrievalResult};

const SOURCE: &str = "retrieval";

/// Pause before the single retry of a failed embed + search.
const RETRY_BACKOFF: Duration = Duration::from_millis(150);

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RetrievalStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
    /// Percentage of lookups served from cache.
    pub hit_rate: f64,
}

struct Inner {
    bus: EventBus,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    cache: Mutex<RetrievalCache>,
    top_k: usize,
    event_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    subscription: Mutex<Option<SubscriptionId>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Retrieval engine handle. Clones share the cache and counters.
#[derive(Clone)]
pub struct RetrievalEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("top_k", &self.inner.top_k)
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RetrievalEngine {
    pub fn new(
        bus: EventBus,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                embedder,
                store,
                cache: Mutex::new(RetrievalCache::new(
                    config.cache_size,
                    Duration::from_secs(config.cache_ttl_s),
                )),
                top_k: config.top_k,
                event_timeout: Duration::from_millis(config.event_timeout_ms),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                subscription: Mutex::new(None),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to intent events.
    pub fn start(&self) {
        let mut subscription = lock(&self.inner.subscription);
        if subscription.is_none() {
            let handler: Arc<dyn EventHandler> =
                Arc::new(IntentListener(Arc::clone(&self.inner)));
            *subscription = Some(self.inner.bus.subscribe(EventKind::Intent, handler));
            info!("retrieval engine started (top_k={})", self.inner.top_k);
        }
    }

    /// Unsubscribe and abandon background lookups.
    pub async fn stop(&self) {
        if let Some(id) = lock(&self.inner.subscription).take() {
            self.inner.bus.unsubscribe(EventKind::Intent, id);
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("retrieval engine stopped");
    }

    /// Look up `query`, serving from cache when possible. Never fails: a
    /// backend error yields an empty result.
    pub async fn retrieve(&self, query: &str) -> RetrievalResult {
        self.inner.retrieve(query).await
    }

    /// [`retrieve`](Self::retrieve) bounded by `timeout`.
    pub async fn retrieve_with_timeout(&self, query: &str, timeout: Duration) -> RetrievalResult {
        self.inner.retrieve_with_timeout(query, timeout).await
    }

    pub fn stats(&self) -> RetrievalStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        RetrievalStats {
            lookups,
            cache_hits: hits,
            cache_misses: misses,
            cache_size: lock(&self.inner.cache).len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64 * 100.0
            },
        }
    }

    pub fn clear_cache(&self) {
        lock(&self.inner.cache).clear();
    }
}

impl Inner {
    async fn retrieve(&self, query: &str) -> RetrievalResult {
        let started = Instant::now();
        let key = cache_key(query, self.top_k);

        let cached = lock(&self.cache).get(&key);
        if let Some(documents) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("retrieval cache hit for {query:?}");
            return RetrievalResult {
                documents,
                query: query.to_owned(),
                latency_ms: elapsed_ms(started),
                cache_hit: true,
            };
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut searched = self.search(query).await;
        if let Err(e) = &searched {
            warn!("retrieval failed for {query:?}, retrying once: {e}");
            tokio::time::sleep(RETRY_BACKOFF).await;
            searched = self.search(query).await;
        }

        match searched {
            Ok(documents) => {
                lock(&self.cache).insert(key, documents.clone());
                let result = RetrievalResult {
                    documents,
                    query: query.to_owned(),
                    latency_ms: elapsed_ms(started),
                    cache_hit: false,
                };
                debug!(
                    "retrieved {} documents in {:.1}ms",
                    result.documents.len(),
                    result.latency_ms
                );
                result
            }
            Err(e) => {
                warn!("retrieval failed for {query:?}: {e}");
                RetrievalResult {
                    latency_ms: elapsed_ms(started),
                    ..RetrievalResult::empty(query)
                }
            }
        }
    }

    /// Embed `query` and search the store off the async runtime.
    async fn search(&self, query: &str) -> Result<Vec<Document>> {
        let embedder = Arc::clone(&self.embedder);
        let store = Arc::clone(&self.store);
        let text = query.to_owned();
        let top_k = self.top_k;
        tokio::task::spawn_blocking(move || {
            let vector = embedder.embed(&text)?;
            store.search(&vector, top_k)
        })
        .await
        .map_err(|e| AgentError::Retrieval(format!("search task failed: {e}")))
        .and_then(|r| r)
    }

    async fn retrieve_with_timeout(&self, query: &str, timeout: Duration) -> RetrievalResult {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.retrieve(query)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("retrieval timed out after {timeout:?} for {query:?}");
                RetrievalResult {
                    latency_ms: elapsed_ms(started),
                    ..RetrievalResult::empty(query)
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Bus-facing side of the engine: starts a background lookup per intent.
struct IntentListener(Arc<Inner>);

#[async_trait]
impl EventHandler for IntentListener {
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        let Some(intent) = event.as_intent() else {
            return Ok(());
        };
        if intent.confidence == IntentConfidence::Speculative || !intent.requires_retrieval {
            return Ok(());
        }
        let query = intent.transcript_text.clone();
        if query.trim().is_empty() {
            return Ok(());
        }
        let speculative = intent.confidence == IntentConfidence::Likely;

        let inner = Arc::clone(&self.0);
        self.0.tasks.spawn(async move {
            tokio::select! {
                () = inner.shutdown.cancelled() => {}
                result = inner.retrieve_with_timeout(&query, inner.event_timeout) => {
                    inner.bus.publish(Event::new(
                        SOURCE,
                        RetrievalEvent { result, speculative }.into(),
                    ));
                }
            }
        });
        Ok(())
    }
}
