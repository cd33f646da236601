//! Request sequencing
//!
//! Each fetch takes a ticket before it goes out. When responses resolve out of
//! order, only a ticket newer than the last applied one may overwrite state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic request id for one kind of fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
pub struct RequestSequence {
    issued: AtomicU64,
    applied: AtomicU64,
}

impl RequestSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next ticket
    pub fn begin(&self) -> Ticket {
        Ticket(self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Claim the right to apply a response. Returns false if a newer response
    /// has already been applied.
    pub fn try_apply(&self, ticket: Ticket) -> bool {
        self.applied
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |applied| {
                (ticket.0 > applied).then_some(ticket.0)
            })
            .is_ok()
    }

    /// Invalidate every ticket issued so far
    pub fn reset(&self) {
        let issued = self.issued.load(Ordering::SeqCst);
        self.applied.fetch_max(issued, Ordering::SeqCst);
    }
}
