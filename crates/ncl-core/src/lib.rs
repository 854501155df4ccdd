//! # ncl-core
//!
//! Shared library for the Nymi Communication Library (NCL) containing the
//! device-facing domain types, the event model delivered to applications, the
//! binary command codec, and local signature helpers.
//!
//! This crate has no threads, no I/O, and no transport.  The session core in
//! the `ncl` crate builds on it.
//!
//! # Architecture overview (for beginners)
//!
//! A Nymi Band is a wearable token that talks to a host over Bluetooth LE.  An
//! application asks the library to *discover* unprovisioned bands, *agree* on a
//! visual LED pattern with the user, *provision* the band (exchange a shared
//! secret), and later *find* and *validate* the band again to run privileged
//! commands such as signing a message.
//!
//! This crate (`ncl-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Handles, device identities, provisions, key material
//!   sizes, and the signature schemes a band supports.
//!
//! - **`event`** – [`NclEvent`], the tagged union every application callback
//!   receives.  Each variant carries only the fields of its own kind.
//!
//! - **`error`** – [`ErrorCode`] (the wire/event-level classification) and
//!   [`NclError`] (the typed error returned by every fallible call).
//!
//! - **`protocol`** – How command requests and completions travel between the
//!   library and a band: the [`Command`] set, the response frame codec, and
//!   the ticket counter that ties a completion to its request.
//!
//! - **`crypto`** – Local ECDSA verification and advertisement signing.

pub mod crypto;
pub mod domain;
pub mod error;
pub mod event;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `ncl_core::NymiHandle` instead of `ncl_core::domain::device::NymiHandle`.
pub use crypto::{partner_public_key, sign_advertisement, verify};
pub use domain::device::{DeviceIdentity, HandleFilter, NymiHandle, NYMI_HANDLE_ANY};
pub use domain::keys::SignatureScheme;
pub use domain::provision::Provision;
pub use error::{ErrorCode, NclError};
pub use event::{DisconnectionReason, EventFilter, EventKind, NclEvent};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError, ResponseFrame};
pub use protocol::command::{Command, CommandResponse, Opcode};
pub use protocol::ticket::{CommandTicket, TicketCounter};
