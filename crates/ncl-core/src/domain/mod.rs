//! Domain types shared by every layer of the library.
//!
//! Nothing in here performs I/O.  The types describe *what* a band is to the
//! library (a handle, a radio identity, a provision) and the fixed sizes of
//! the key material exchanged with it.

/// Handles, handle filters, and radio identities.
pub mod device;

/// Fixed sizes of key material and the signature schemes a band supports.
pub mod keys;

/// The persistent trust relationship between one band and one application.
pub mod provision;
