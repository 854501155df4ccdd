//! The event model delivered to application callbacks.
//!
//! [`NclEvent`] is a sum type: each variant holds only its own payload, so a
//! callback can never read the fields of a different event kind.  The flat
//! [`EventKind`] discriminant is derived from the variant and is what behavior
//! filters match on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::device::NymiHandle;
use crate::domain::keys::{
    EcgSamples, FirmwareVersion, LedPatterns, Prg, ProvisionId, Sig, Sk, SkId, Vk, VkId,
};
use crate::domain::provision::Provision;
use crate::error::ErrorCode;

/// Discriminant of an [`NclEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Init,
    Error,
    Discovery,
    Find,
    Detection,
    Agreement,
    Provision,
    Validation,
    Disconnection,
    EcgStart,
    Ecg,
    EcgStop,
    Vk,
    Sig,
    GlobalVk,
    GlobalSig,
    CreatedSk,
    GotSk,
    Prg,
    Rssi,
    FirmwareVersion,
    Notified,
}

/// Which event kinds a behavior wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    #[default]
    Any,
    Only(EventKind),
}

impl EventFilter {
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Only(wanted) => wanted == kind,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::Only(kind)
    }
}

/// Best-effort reason attached to a disconnection.
///
/// Not every transport can tell these apart; `Other` is the residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectionReason {
    /// The application asked for the disconnection.
    Local = 0x00,
    Timeout = 0x01,
    Failure = 0x02,
    /// The band closed the link.
    Remote = 0x03,
    ConnectionTimeout = 0x04,
    LinkLayerTimeout = 0x05,
    Other = 0xFF,
}

impl From<u8> for DisconnectionReason {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DisconnectionReason::Local,
            0x01 => DisconnectionReason::Timeout,
            0x02 => DisconnectionReason::Failure,
            0x03 => DisconnectionReason::Remote,
            0x04 => DisconnectionReason::ConnectionTimeout,
            0x05 => DisconnectionReason::LinkLayerTimeout,
            _ => DisconnectionReason::Other,
        }
    }
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectionReason::Local => "local",
            DisconnectionReason::Timeout => "timeout",
            DisconnectionReason::Failure => "failure",
            DisconnectionReason::Remote => "remote",
            DisconnectionReason::ConnectionTimeout => "connection timeout",
            DisconnectionReason::LinkLayerTimeout => "link-layer timeout",
            DisconnectionReason::Other => "other",
        };
        f.write_str(text)
    }
}

/// One event delivered to matching behaviors.
///
/// Events are values: the library builds one, hands a reference to every
/// matching callback in registration order, and then drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NclEvent {
    /// The transport finished initializing.  Always the first event of a session.
    Init { success: bool },
    /// An asynchronously discovered failure.  Carries no handle.
    Error { code: ErrorCode },
    /// A band in provisioning mode advertised during discovery.
    Discovery { handle: NymiHandle, rssi: i32 },
    /// A band advertised one of the provisions passed to `start_finding`.
    Find {
        handle: NymiHandle,
        rssi: i32,
        provision_id: ProvisionId,
        strong: bool,
    },
    /// A band advertised but matched none of the provisions.
    Detection { handle: NymiHandle, rssi: i32 },
    /// The band is showing `leds`; the user must confirm they match.
    Agreement { handle: NymiHandle, leds: LedPatterns },
    /// Provisioning succeeded.  The application now owns `provision`.
    Provision { handle: NymiHandle, provision: Provision },
    Validation { handle: NymiHandle },
    Disconnection {
        handle: NymiHandle,
        reason: DisconnectionReason,
    },
    EcgStart { handle: NymiHandle },
    Ecg { handle: NymiHandle, samples: EcgSamples },
    EcgStop { handle: NymiHandle },
    /// A signature key pair was created on the band.
    Vk { handle: NymiHandle, id: VkId, vk: Vk },
    Sig { handle: NymiHandle, sig: Sig },
    GlobalVk { handle: NymiHandle, id: VkId, vk: Vk },
    GlobalSig {
        handle: NymiHandle,
        vk_id: VkId,
        sig: Sig,
    },
    CreatedSk { handle: NymiHandle, id: SkId, sk: Sk },
    GotSk { handle: NymiHandle, sk: Sk },
    Prg { handle: NymiHandle, value: Prg },
    Rssi { handle: NymiHandle, rssi: i32 },
    FirmwareVersion {
        handle: NymiHandle,
        version: FirmwareVersion,
    },
    Notified { handle: NymiHandle },
}

impl NclEvent {
    /// Returns the discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            NclEvent::Init { .. } => EventKind::Init,
            NclEvent::Error { .. } => EventKind::Error,
            NclEvent::Discovery { .. } => EventKind::Discovery,
            NclEvent::Find { .. } => EventKind::Find,
            NclEvent::Detection { .. } => EventKind::Detection,
            NclEvent::Agreement { .. } => EventKind::Agreement,
            NclEvent::Provision { .. } => EventKind::Provision,
            NclEvent::Validation { .. } => EventKind::Validation,
            NclEvent::Disconnection { .. } => EventKind::Disconnection,
            NclEvent::EcgStart { .. } => EventKind::EcgStart,
            NclEvent::Ecg { .. } => EventKind::Ecg,
            NclEvent::EcgStop { .. } => EventKind::EcgStop,
            NclEvent::Vk { .. } => EventKind::Vk,
            NclEvent::Sig { .. } => EventKind::Sig,
            NclEvent::GlobalVk { .. } => EventKind::GlobalVk,
            NclEvent::GlobalSig { .. } => EventKind::GlobalSig,
            NclEvent::CreatedSk { .. } => EventKind::CreatedSk,
            NclEvent::GotSk { .. } => EventKind::GotSk,
            NclEvent::Prg { .. } => EventKind::Prg,
            NclEvent::Rssi { .. } => EventKind::Rssi,
            NclEvent::FirmwareVersion { .. } => EventKind::FirmwareVersion,
            NclEvent::Notified { .. } => EventKind::Notified,
        }
    }

    /// Returns the band this event concerns, or `None` for session-wide
    /// events (`Init`, `Error`).
    pub fn handle(&self) -> Option<NymiHandle> {
        match self {
            NclEvent::Init { .. } | NclEvent::Error { .. } => None,
            NclEvent::Discovery { handle, .. }
            | NclEvent::Find { handle, .. }
            | NclEvent::Detection { handle, .. }
            | NclEvent::Agreement { handle, .. }
            | NclEvent::Provision { handle, .. }
            | NclEvent::Validation { handle }
            | NclEvent::Disconnection { handle, .. }
            | NclEvent::EcgStart { handle }
            | NclEvent::Ecg { handle, .. }
            | NclEvent::EcgStop { handle }
            | NclEvent::Vk { handle, .. }
            | NclEvent::Sig { handle, .. }
            | NclEvent::GlobalVk { handle, .. }
            | NclEvent::GlobalSig { handle, .. }
            | NclEvent::CreatedSk { handle, .. }
            | NclEvent::GotSk { handle, .. }
            | NclEvent::Prg { handle, .. }
            | NclEvent::Rssi { handle, .. }
            | NclEvent::FirmwareVersion { handle, .. }
            | NclEvent::Notified { handle } => Some(*handle),
        }
    }
}
