//! Thread-safe ticket counter for command slot claims.
//!
//! # What is a ticket? (for beginners)
//!
//! Every time a band's command slot is claimed, the claim is stamped with a
//! fresh, monotonically increasing number called a *ticket*.  The transport
//! echoes the ticket back with the command's completion.  Tickets are used to:
//!
//! - **Match completions to requests** – a completion is only applied if its
//!   ticket equals the ticket of the slot's current claim.
//! - **Drop stale completions** – if a band was disconnected (which force-frees
//!   its slot) and a new command was issued, a late completion for the old
//!   command carries an old ticket and is discarded.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64`, so two threads claiming slots on different
//! bands at the same moment never receive the same ticket.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one command slot claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandTicket(u64);

impl CommandTicket {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}

/// A thread-safe, monotonically increasing source of [`CommandTicket`]s.
///
/// Tickets start at 1.  The counter wraps around at `u64::MAX` without
/// panicking.
///
/// # Examples
///
/// ```rust
/// use ncl_core::protocol::TicketCounter;
///
/// let counter = TicketCounter::new();
/// assert_eq!(counter.next().raw(), 1);
/// assert_eq!(counter.next().raw(), 2);
/// ```
#[derive(Debug)]
pub struct TicketCounter {
    inner: AtomicU64,
}

impl TicketCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next ticket and atomically advances the counter.
    ///
    /// `Ordering::Relaxed` is enough: tickets only need to be unique, they do
    /// not publish any other memory.
    pub fn next(&self) -> CommandTicket {
        CommandTicket(self.inner.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the value the next call to [`next`](Self::next) will hand out.
    pub fn peek(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for TicketCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ticket_counter_starts_at_one() {
        // Arrange
        let counter = TicketCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, CommandTicket::new(1));
    }

    #[test]
    fn test_ticket_counter_increments_monotonically() {
        // Arrange
        let counter = TicketCounter::new();

        // Act
        let values: Vec<CommandTicket> = (0..100).map(|_| counter.next()).collect();

        // Assert
        for window in values.windows(2) {
            assert!(window[1] > window[0], "tickets must be monotonically increasing");
        }
    }

    #[test]
    fn test_ticket_counter_wraps_at_u64_max() {
        // Arrange – start the counter one step before overflow
        let counter = TicketCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap.raw(), u64::MAX);
        assert_eq!(after_wrap.raw(), 0, "counter must wrap after u64::MAX");
    }

    #[test]
    fn test_ticket_counter_is_thread_safe() {
        // Arrange
        let counter = Arc::new(TicketCounter::new());
        let thread_count = 8;
        let claims_per_thread = 1000;

        // Act – claim from many threads simultaneously
        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..claims_per_thread).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<CommandTicket> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no two claims share a ticket
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), thread_count * claims_per_thread);
    }

    #[test]
    fn test_peek_does_not_advance() {
        // Arrange
        let counter = TicketCounter::default();
        counter.next();

        // Act
        let peeked = counter.peek();
        let next = counter.next();

        // Assert
        assert_eq!(peeked, 2);
        assert_eq!(next.raw(), 2);
    }
}
