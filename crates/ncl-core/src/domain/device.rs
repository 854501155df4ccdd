//! Device handles and radio identities.
//!
//! A [`NymiHandle`] is the small integer an application uses to talk about a
//! band.  A [`DeviceIdentity`] is the 48-bit radio address the transport uses.
//! The registry in the `ncl` crate maps one to the other and never hands the
//! same handle to two identities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw value that means "any band" in a behavior filter.
///
/// The registry never allocates this value as a real handle.
pub const NYMI_HANDLE_ANY: i32 = -1;

/// Opaque handle assigned to a band the first time the library observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NymiHandle(i32);

impl NymiHandle {
    /// Wraps a raw handle value.
    ///
    /// Any value can be wrapped; whether it refers to a tracked band is
    /// decided by the registry, which rejects unknown handles.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer value.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for NymiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nymi#{}", self.0)
    }
}

/// Which bands a behavior wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandleFilter {
    /// Every event, including events that carry no handle.
    #[default]
    Any,
    /// Only events tagged with this handle.
    Only(NymiHandle),
}

impl HandleFilter {
    /// Builds a filter from a raw handle, treating [`NYMI_HANDLE_ANY`] as the wildcard.
    pub const fn from_raw(raw: i32) -> Self {
        if raw == NYMI_HANDLE_ANY {
            HandleFilter::Any
        } else {
            HandleFilter::Only(NymiHandle::new(raw))
        }
    }

    /// Returns `true` when an event tagged with `handle` passes this filter.
    pub fn matches(self, handle: Option<NymiHandle>) -> bool {
        match self {
            HandleFilter::Any => true,
            HandleFilter::Only(wanted) => handle == Some(wanted),
        }
    }
}

impl From<NymiHandle> for HandleFilter {
    fn from(handle: NymiHandle) -> Self {
        HandleFilter::Only(handle)
    }
}

/// 48-bit Bluetooth LE address of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentity([u8; 6]);

impl DeviceIdentity {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}
