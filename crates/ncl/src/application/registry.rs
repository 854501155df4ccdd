//! Device registry: handle allocation and the per-band records.
//!
//! The registry is the single owner of every [`DeviceRecord`].  The
//! negotiation state machine and the command arbiter borrow records through
//! [`DeviceRegistry::resolve_mut`] while holding the session lock; nothing
//! keeps its own copy of a record's mutable fields.
//!
//! # Handle lifecycle (for beginners)
//!
//! ```text
//! first advertisement ──► register(identity) ──► handle h
//!        ...same identity again ──► register(identity) ──► the same h
//!                          clear() ──► every handle forgotten, counter restarts
//! ```
//!
//! A handle never names two different identities while tracked.  After
//! `clear()` the counter restarts, so a handle obtained before the clear must
//! not be trusted afterwards.

use std::collections::{BTreeMap, HashMap};

use ncl_core::domain::keys::{ProvisionId, VkId};
use ncl_core::{DeviceIdentity, NclError, NymiHandle, Provision, NYMI_HANDLE_ANY};
use tracing::debug;

use crate::application::arbiter::CommandSlot;
use crate::application::negotiation::NegotiationState;

/// State of the radio link to one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    /// A connection was requested and has not been confirmed yet.
    Connecting,
    Connected,
    /// A disconnection was requested and has not been confirmed yet.
    Disconnecting,
}

impl LinkStatus {
    /// Returns `true` while the band holds (or is acquiring) a link.
    pub fn is_linked(self) -> bool {
        !matches!(self, LinkStatus::Idle)
    }
}

/// Everything the library knows about one band.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub handle: NymiHandle,
    pub identity: DeviceIdentity,
    pub state: NegotiationState,
    pub link: LinkStatus,
    pub slot: CommandSlot,
    /// Last reported signal strength.
    pub rssi: Option<i32>,
    /// Provision the band advertised during the last find.  Needed to validate.
    pub matched_provision: Option<Provision>,
    /// Whether the last find of this band was strong.
    pub strong_find: bool,
    /// The band advertised during finding, so its advertisement can be fetched.
    pub advertised: bool,
    /// ECG samples are only surfaced between `EcgStart` and `EcgStop`.
    pub streaming_ecg: bool,
    /// Signature key pairs created on this band during the session.
    pub verification_keys: Vec<VkId>,
}

impl DeviceRecord {
    fn new(handle: NymiHandle, identity: DeviceIdentity) -> Self {
        Self {
            handle,
            identity,
            state: NegotiationState::Unknown,
            link: LinkStatus::Idle,
            slot: CommandSlot::Free,
            rssi: None,
            matched_provision: None,
            strong_find: false,
            advertised: false,
            streaming_ecg: false,
            verification_keys: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            handle: self.handle,
            identity: self.identity,
            state: self.state,
            link: self.link,
            busy: self.slot.is_busy(),
            rssi: self.rssi,
            strong_find: self.strong_find,
            provision_id: self.matched_provision.as_ref().map(|p| p.id),
        }
    }
}

/// Read-only copy of a record, handed to applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub handle: NymiHandle,
    pub identity: DeviceIdentity,
    pub state: NegotiationState,
    pub link: LinkStatus,
    /// Whether the command slot is claimed.
    pub busy: bool,
    pub rssi: Option<i32>,
    pub strong_find: bool,
    pub provision_id: Option<ProvisionId>,
}

/// In-memory map from handles to device records.
///
/// A `BTreeMap` keeps records in handle order so listings are stable; the
/// reverse `HashMap` gives O(1) lookup when the transport reports an identity.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    next_handle: i32,
    devices: BTreeMap<NymiHandle, DeviceRecord>,
    by_identity: HashMap<DeviceIdentity, NymiHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle of `identity`, allocating one on first sight.
    ///
    /// The boolean is `true` when a new record was created.
    pub fn register(&mut self, identity: DeviceIdentity) -> (NymiHandle, bool) {
        if let Some(handle) = self.by_identity.get(&identity) {
            return (*handle, false);
        }
        let handle = self.allocate();
        self.devices.insert(handle, DeviceRecord::new(handle, identity));
        self.by_identity.insert(identity, handle);
        debug!(%handle, %identity, "band registered");
        (handle, true)
    }

    /// Returns the record of `identity`, registering it on first sight.
    pub fn entry(&mut self, identity: DeviceIdentity) -> &mut DeviceRecord {
        let (handle, _) = self.register(identity);
        self.devices
            .entry(handle)
            .or_insert_with(|| DeviceRecord::new(handle, identity))
    }

    fn allocate(&mut self) -> NymiHandle {
        loop {
            let raw = self.next_handle;
            self.next_handle = if raw == i32::MAX { 0 } else { raw + 1 };
            let candidate = NymiHandle::new(raw);
            if raw != NYMI_HANDLE_ANY && !self.devices.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`NclError::InvalidHandle`] if `handle` is not tracked.
    pub fn resolve(&self, handle: NymiHandle) -> Result<&DeviceRecord, NclError> {
        self.devices.get(&handle).ok_or(NclError::InvalidHandle(handle))
    }

    /// # Errors
    ///
    /// Returns [`NclError::InvalidHandle`] if `handle` is not tracked.
    pub fn resolve_mut(&mut self, handle: NymiHandle) -> Result<&mut DeviceRecord, NclError> {
        self.devices.get_mut(&handle).ok_or(NclError::InvalidHandle(handle))
    }

    /// Finds the record of a band the transport reported by identity.
    pub fn by_identity_mut(&mut self, identity: DeviceIdentity) -> Option<&mut DeviceRecord> {
        let handle = self.by_identity.get(&identity)?;
        self.devices.get_mut(handle)
    }

    /// Handles of bands whose link is up, in handle order.
    pub fn connected(&self) -> Vec<NymiHandle> {
        self.devices
            .values()
            .filter(|record| record.link == LinkStatus::Connected)
            .map(|record| record.handle)
            .collect()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices.values_mut()
    }

    /// Forgets every band.
    ///
    /// # Errors
    ///
    /// Returns [`NclError::WrongState`] if any band holds or is acquiring a link.
    pub fn clear(&mut self) -> Result<(), NclError> {
        if let Some(linked) = self.devices.values().find(|record| record.link.is_linked()) {
            return Err(NclError::wrong_state(
                "clear_scanned",
                format!("{} is still linked ({:?})", linked.handle, linked.link),
            ));
        }
        let forgotten = self.devices.len();
        self.devices.clear();
        self.by_identity.clear();
        self.next_handle = 0;
        debug!(forgotten, "registry cleared");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
