//! Priority-queued publish/subscribe backbone.
//!
//! Components talk to each other only through the bus. Queued events are
//! dispatched by [`EventBus::run`] in `(priority, sequence)` order; barge-in
//! signals use [`EventBus::publish_immediate`] to bypass the queue, since the
//! queue cannot preempt a handler that is already running.

pub mod events;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::Result;

pub use events::{Event, EventKind, EventPayload, EventPriority};

/// Identifies one subscription for [`EventBus::unsubscribe`].
pub type SubscriptionId = u64;

/// A subscriber. Errors and panics are logged by the bus and never reach
/// other handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<Event>) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub queued: usize,
    pub dispatched: u64,
    pub dropped: u64,
    pub avg_latency_ms: f64,
}

struct Queued {
    priority: EventPriority,
    seq: u64,
    event: Arc<Event>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

type HandlerList = Vec<(SubscriptionId, Arc<dyn EventHandler>)>;

struct BusInner {
    handlers: RwLock<HashMap<EventKind, HandlerList>>,
    queue: Mutex<BinaryHeap<Queued>>,
    wake: Notify,
    seq: AtomicU64,
    next_subscription: AtomicU64,
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
    capacity: usize,
    latency_window: usize,
    shutdown: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queued", &self.queue_len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                wake: Notify::new(),
                seq: AtomicU64::new(0),
                next_subscription: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                dispatched: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                latencies: Mutex::new(VecDeque::new()),
                capacity: config.queue_capacity.max(1),
                latency_window: config.latency_window.max(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Subscribing the same handler `Arc` twice to one kind is a no-op that
    /// returns the existing id.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let list = handlers.entry(kind).or_default();
        let target = Arc::as_ptr(&handler).cast::<()>();
        if let Some((id, _)) = list
            .iter()
            .find(|(_, h)| Arc::as_ptr(h).cast::<()>() == target)
        {
            return *id;
        }
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        list.push((id, handler));
        debug!("subscribed handler {id} to {kind:?}");
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        before != list.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Queue an event for dispatch by [`run`](Self::run). Never blocks.
    ///
    /// Returns `false` if the event was dropped (queue full or bus stopped).
    pub fn publish(&self, event: impl Into<Arc<Event>>) -> bool {
        let event = event.into();
        if self.inner.shutdown.is_cancelled() {
            debug!("bus stopped, discarding {:?} event {}", event.kind(), event.id);
            return false;
        }
        {
            let mut queue = lock(&self.inner.queue);
            if queue.len() >= self.inner.capacity {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "event queue full ({}), dropping {:?} event {}",
                    self.inner.capacity,
                    event.kind(),
                    event.id
                );
                return false;
            }
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
            queue.push(Queued {
                priority: event.priority,
                seq,
                event,
            });
        }
        self.inner.wake.notify_one();
        true
    }

    /// Dispatch directly to handlers, bypassing the queue.
    ///
    /// Resolves once every handler has run.
    pub async fn publish_immediate(&self, event: impl Into<Arc<Event>>) {
        let event = event.into();
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.dispatch(event).await;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drain the queue until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        info!("event bus started");
        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            match self.pop() {
                Some(event) => {
                    self.dispatch(event).await;
                    self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    tokio::select! {
                        () = self.inner.shutdown.cancelled() => break,
                        () = self.inner.wake.notified() => {}
                    }
                }
            }
        }
        info!("event bus stopped");
    }

    /// Stop the run loop. Queued events are discarded.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.queue).clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until the queue is empty and no dispatch is in progress.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let settled = async {
            loop {
                if self.is_idle() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, settled).await.is_ok()
    }

    fn is_idle(&self) -> bool {
        let queue = lock(&self.inner.queue);
        queue.is_empty() && self.inner.in_flight.load(Ordering::SeqCst) == 0
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Mean of (dispatch time - creation time) over the recent window, in ms.
    pub fn avg_latency_ms(&self) -> f64 {
        let samples = lock(&self.inner.latencies);
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            queued: self.queue_len(),
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }

    fn pop(&self) -> Option<Arc<Event>> {
        let mut queue = lock(&self.inner.queue);
        let item = queue.pop()?;
        // Counted under the queue lock so drain() never sees a gap.
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(item.event)
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    fn record_latency(&self, event: &Event) {
        let ms = event.age().as_secs_f64() * 1000.0;
        let mut samples = lock(&self.inner.latencies);
        if samples.len() >= self.inner.latency_window {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    async fn dispatch(&self, event: Arc<Event>) {
        if event.is_cancelled() {
            debug!("skipping cancelled {:?} event {}", event.kind(), event.id);
            return;
        }
        self.record_latency(&event);
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);

        for handler in self.handlers_for(event.kind()) {
            // A handler earlier in the list may have cancelled or superseded it.
            if event.is_cancelled() {
                debug!("{:?} event {} cancelled mid-dispatch", event.kind(), event.id);
                return;
            }
            let outcome = AssertUnwindSafe(handler.handle(Arc::clone(&event)))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("handler failed for {:?} event {}: {e}", event.kind(), event.id);
                }
                Err(_) => {
                    error!("handler panicked on {:?} event {}", event.kind(), event.id);
                }
            }
        }
    }
}
