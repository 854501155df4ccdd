//! Application layer: the session engine.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer sits between the shared domain types in `ncl-core`
//! and the infrastructure adapters (radio transports, files, the error
//! stream).  Code here:
//!
//! - **Orchestrates** the domain to fulfil a request such as "agree with
//!   band 3" or "deliver this completion to the callbacks".
//! - **Depends on abstractions** (the [`transport::NymiTransport`] trait)
//!   rather than on a concrete radio.
//! - **Performs no I/O of its own.**
//!
//! # Sub-modules
//!
//! - **`registry`** – Maps handles to device records.
//! - **`negotiation`** – The per-band lifecycle and the session-wide scan mode.
//! - **`arbiter`** – The single command slot each band carries.
//! - **`behaviors`** – Registered (callback, user data, filters) tuples.
//! - **`delivery`** – The two event delivery strategies.
//! - **`transport`** – The port a radio transport implements.
//! - **`session`** – The [`session::Ncl`] facade that composes all of the above.

pub mod arbiter;
pub mod behaviors;
pub mod delivery;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
