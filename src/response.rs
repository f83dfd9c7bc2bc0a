//! Response ids: the cooperative half of two-tier cancellation.
//!
//! Every response the controller starts is stamped with a monotonically
//! increasing id. Long-running work holds a [`ResponseTicket`] and rechecks
//! it at safe points; once a newer id has been issued the ticket is stale
//! and the work must be abandoned regardless of arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared monotonic response id counter.
#[derive(Debug, Clone, Default)]
pub struct ResponseIds {
    current: Arc<AtomicU64>,
}

impl ResponseIds {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the most recently issued response.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Invalidate every outstanding ticket and return the new current id.
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advance and hand out a ticket for the new id.
    pub fn issue(&self) -> ResponseTicket {
        let id = self.advance();
        ResponseTicket {
            ids: self.clone(),
            id,
        }
    }

    /// A ticket for the current id without advancing.
    pub fn ticket(&self) -> ResponseTicket {
        ResponseTicket {
            ids: self.clone(),
            id: self.current(),
        }
    }
}

/// A claim on one response id.
#[derive(Debug, Clone)]
pub struct ResponseTicket {
    ids: ResponseIds,
    id: u64,
}

impl ResponseTicket {
    /// The id this ticket was issued for.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether no newer response has been issued since this ticket.
    pub fn is_current(&self) -> bool {
        self.ids.current() == self.id
    }

    /// Inverse of [`is_current`](Self::is_current).
    pub fn is_stale(&self) -> bool {
        !self.is_current()
    }
}
