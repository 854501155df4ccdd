//! Infrastructure layer.
//!
//! Contains adapters to the outside world: transports, the error stream,
//! file-system storage, and the logging bootstrap.
//!
//! **Dependency rule**: this layer may depend on `application` and `ncl_core`,
//! but the engine in `application` only reaches it through the transport
//! trait, the error sink, and the configuration types.

pub mod error_sink;
pub mod logging;
pub mod storage;
pub mod transport;
