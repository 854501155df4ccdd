//! File-system storage: session configuration and the provision store.

pub mod config;
pub mod provisions;
