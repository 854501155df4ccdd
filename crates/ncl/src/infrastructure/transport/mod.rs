//! Transport adapters implementing [`crate::application::transport::NymiTransport`].
//!
//! - **`simulated`** – an in-process radio that records every call and lets
//!   tests (and demos without hardware) script band behaviour.

pub mod simulated;

pub use simulated::{SimulatedTransport, TransportCall};
