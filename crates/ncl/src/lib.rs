//! # ncl
//!
//! Session core of the Nymi Communication Library.
//!
//! An application creates one [`Ncl`] per transport, calls
//! [`Ncl::init`] with a callback, and from then on drives bands through
//! discovery, agreement, and provisioning, or through finding and validation
//! followed by privileged commands.  Results arrive as [`NclEvent`]s delivered
//! to the registered behaviors, either on a dedicated dispatch thread
//! (asynchronous mode) or when the application calls [`Ncl::update`]
//! (synchronous mode).
//!
//! Re-exports all public modules so that integration tests in `tests/` share
//! the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::behaviors::{callback, Behavior, Callback, UserData};
pub use application::delivery::{DeliveryMode, DrainOutcome};
pub use application::negotiation::{NegotiationState, TransportStatus};
pub use application::registry::{DeviceSnapshot, LinkStatus};
pub use application::session::{Ncl, NclInfo, NclMode};
pub use application::transport::{
    ConnectionParams, NymiTransport, ProvisionMatch, ScanKind, TransportError, TransportEvent,
    TransportOptions, TransportSink,
};
pub use ncl_core::{
    DisconnectionReason, ErrorCode, EventFilter, EventKind, HandleFilter, NclError, NclEvent,
    NymiHandle, Provision, SignatureScheme, NYMI_HANDLE_ANY,
};
