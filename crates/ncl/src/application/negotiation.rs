//! Negotiation state machine: the per-band lifecycle and the session-wide scan.
//!
//! # Band lifecycle (for beginners)
//!
//! A band walks one of two tracks:
//!
//! ```text
//! provisioning:  Unknown ─► Discovered ─► Agreeing ─► Agreed ─► Provisioning ─► Provisioned
//! validation:    Unknown ─► Found ─────────────────► Validating ─► Validated
//!                       └─► Detected
//!
//! any state ─► Disconnected  (when the link drops or fails to come up)
//! ```
//!
//! - `Discovered`: the band advertised in provisioning mode during discovery.
//! - `Agreeing`: `agree` was requested; the link is opening and the band will
//!   show an LED pattern.
//! - `Agreed`: the user can compare the pattern; `provision` is now allowed.
//! - `Provisioned`: a shared secret exists; the application stores it.
//! - `Found`: the band advertised one of the provisions passed to finding.
//! - `Detected`: the band advertised but matched no provision.  Detection is
//!   a low-confidence signal and never overrides `Found` or a linked state.
//! - `Validating` / `Validated`: the band proved it holds the provision;
//!   privileged commands are now allowed.
//!
//! The [`Negotiator`] owns the registry, the arbiter, and the scan mode.  The
//! session calls it under one lock.  Its methods never touch the transport:
//! they return [`TransportAction`]s that the session performs after the lock
//! is released.

use std::collections::HashSet;
use std::fmt;

use ncl_core::domain::keys::EcgSamples;
use ncl_core::{
    decode_frame, Command, CommandResponse, CommandTicket, DeviceIdentity, DisconnectionReason,
    ErrorCode, NclError, NclEvent, NymiHandle, Opcode, Provision,
};
use tracing::{debug, info, trace, warn};

use crate::application::arbiter::{CommandArbiter, CommandSlot, InFlight, Phase};
use crate::application::registry::{DeviceRecord, DeviceRegistry, DeviceSnapshot, LinkStatus};
use crate::application::transport::{ConnectionParams, ProvisionMatch, ScanKind, TransportEvent};

/// Lifecycle state of one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Unknown,
    Discovered,
    Agreeing,
    Agreed,
    Provisioning,
    Provisioned,
    Found,
    Detected,
    Validating,
    Validated,
    Disconnected,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of the transport backend opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Opening,
    Ready,
    Failed,
}

#[derive(Debug)]
enum ScanState {
    Idle,
    Discovering {
        seen: HashSet<DeviceIdentity>,
    },
    Finding {
        provisions: Vec<Provision>,
        detect: bool,
        found: HashSet<DeviceIdentity>,
        detected: HashSet<DeviceIdentity>,
    },
}

/// Transport work decided under the session lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    Connect {
        handle: NymiHandle,
        ticket: CommandTicket,
        identity: DeviceIdentity,
        params: ConnectionParams,
    },
    Send {
        handle: NymiHandle,
        ticket: CommandTicket,
        identity: DeviceIdentity,
        opcode: Opcode,
        payload: Vec<u8>,
    },
    Disconnect {
        handle: NymiHandle,
        identity: DeviceIdentity,
    },
}

/// Result of applying one transport event: events to deliver, work to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    pub events: Vec<NclEvent>,
    pub actions: Vec<TransportAction>,
}

/// A disconnection the session has committed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDisconnect {
    pub identity: DeviceIdentity,
    pub prior_link: LinkStatus,
    /// Command that lost its slot because of the disconnection.
    pub dropped: Option<InFlight>,
}

/// The negotiation engine of one session.
#[derive(Debug)]
pub struct Negotiator {
    registry: DeviceRegistry,
    arbiter: CommandArbiter,
    scan: ScanState,
    params: ConnectionParams,
    transport: TransportStatus,
}

impl Negotiator {
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            arbiter: CommandArbiter::new(),
            scan: ScanState::Idle,
            params,
            transport: TransportStatus::Opening,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn transport_status(&self) -> TransportStatus {
        self.transport
    }

    pub fn params(&self) -> ConnectionParams {
        self.params
    }

    /// Uses `params` for the next connection.  Callers validate them first.
    pub fn set_params(&mut self, params: ConnectionParams) {
        self.params = params;
        debug!(?params, "connection parameters updated");
    }

    /// # Errors
    ///
    /// Returns [`NclError::InvalidHandle`] if `handle` is not tracked.
    pub fn snapshot(&self, handle: NymiHandle) -> Result<DeviceSnapshot, NclError> {
        self.registry.resolve(handle).map(DeviceRecord::snapshot)
    }

    pub fn connected(&self) -> Vec<NymiHandle> {
        self.registry.connected()
    }

    /// Forgets every band.  A running scan reports bands it has already seen
    /// again, under new handles.
    ///
    /// # Errors
    ///
    /// Returns [`NclError::WrongState`] if any band is linked.
    pub fn clear(&mut self) -> Result<(), NclError> {
        self.registry.clear()?;
        match &mut self.scan {
            ScanState::Idle => {}
            ScanState::Discovering { seen } => seen.clear(),
            ScanState::Finding { found, detected, .. } => {
                found.clear();
                detected.clear();
            }
        }
        Ok(())
    }

    // ── Scanning ──────────────────────────────────────────────────────────────

    pub fn scan_kind(&self) -> Option<ScanKind> {
        match self.scan {
            ScanState::Idle => None,
            ScanState::Discovering { .. } => Some(ScanKind::Discovery),
            ScanState::Finding { .. } => Some(ScanKind::Finding),
        }
    }

    /// Enters a scan mode.
    ///
    /// # Errors
    ///
    /// - [`NclError::Busy`] if a scan is already running.
    /// - [`NclError::BadValue`] for a find with no provisions and no detection.
    pub fn begin_scan(&mut self, kind: ScanKind, provisions: &[Provision], detect: bool) -> Result<(), NclError> {
        if let Some(running) = self.scan_kind() {
            return Err(NclError::Busy(format!("a {running:?} scan is already running")));
        }
        self.scan = match kind {
            ScanKind::Discovery => ScanState::Discovering { seen: HashSet::new() },
            ScanKind::Finding => {
                if provisions.is_empty() && !detect {
                    return Err(NclError::BadValue(
                        "finding needs at least one provision or detection enabled".to_string(),
                    ));
                }
                ScanState::Finding {
                    provisions: provisions.to_vec(),
                    detect,
                    found: HashSet::new(),
                    detected: HashSet::new(),
                }
            }
        };
        Ok(())
    }

    /// Leaves any scan mode.  Returns `true` if a scan was running.
    pub fn end_scan(&mut self) -> bool {
        let was = self.scan_kind();
        self.scan = ScanState::Idle;
        was.is_some()
    }

    // ── Requests from the application ─────────────────────────────────────────

    /// Admits `command` on `handle` and returns the transport work that starts it.
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`], [`NclError::WrongState`], or [`NclError::Busy`]
    /// as decided by the registry and the arbiter.
    pub fn request(&mut self, handle: NymiHandle, command: Command) -> Result<TransportAction, NclError> {
        let params = self.params;
        let opcode = command.opcode();
        let name = command.name();
        let payload = command.encode_payload();

        let record = self.registry.resolve_mut(handle)?;
        let (ticket, phase) = self.arbiter.claim(record, command)?;

        match phase {
            Phase::AwaitingConnection => {
                record.link = LinkStatus::Connecting;
                match opcode {
                    Opcode::Agree => record.state = NegotiationState::Agreeing,
                    Opcode::Validate => record.state = NegotiationState::Validating,
                    _ => {}
                }
                debug!(%handle, %ticket, state = %record.state, command = name, "connecting");
                Ok(TransportAction::Connect {
                    handle,
                    ticket,
                    identity: record.identity,
                    params,
                })
            }
            Phase::AwaitingCompletion => {
                if opcode == Opcode::Provision {
                    record.state = NegotiationState::Provisioning;
                }
                debug!(%handle, %ticket, command = name, "sending");
                Ok(TransportAction::Send {
                    handle,
                    ticket,
                    identity: record.identity,
                    opcode,
                    payload,
                })
            }
        }
    }

    /// Admits a validation of a found band with the provision it advertised.
    ///
    /// # Errors
    ///
    /// As [`Negotiator::request`]; [`NclError::WrongState`] if the band was not found.
    pub fn request_validate(&mut self, handle: NymiHandle) -> Result<TransportAction, NclError> {
        let record = self.registry.resolve(handle)?;
        let provision = record.matched_provision.clone().ok_or_else(|| {
            NclError::wrong_state("validate", format!("{handle} was not found with a provision"))
        })?;
        self.request(handle, Command::Validate { provision })
    }

    /// Undoes an admission the transport refused synchronously.
    pub fn abandon(&mut self, handle: NymiHandle, ticket: CommandTicket) {
        let Ok(record) = self.registry.resolve_mut(handle) else {
            return;
        };
        if let Some(in_flight) = CommandArbiter::release(record, ticket) {
            record.state = in_flight.prior_state;
            if in_flight.opened_link {
                record.link = LinkStatus::Idle;
            }
            debug!(%handle, %ticket, state = %record.state, "request abandoned");
        }
    }

    /// Undoes a command whose send failed after its link came up.
    pub fn send_failed(&mut self, handle: NymiHandle, ticket: CommandTicket) -> Option<TransportAction> {
        let record = self.registry.resolve_mut(handle).ok()?;
        let in_flight = CommandArbiter::release(record, ticket)?;
        unwind(record, &in_flight)
    }

    /// Commits to disconnecting `handle`: frees its slot and marks the link closing.
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`], or [`NclError::WrongState`] if the band has
    /// no link or is already disconnecting.
    pub fn request_disconnect(&mut self, handle: NymiHandle) -> Result<PendingDisconnect, NclError> {
        let record = self.registry.resolve_mut(handle)?;
        match record.link {
            LinkStatus::Idle => Err(NclError::wrong_state("disconnect", format!("{handle} is not connected"))),
            LinkStatus::Disconnecting => Err(NclError::wrong_state(
                "disconnect",
                format!("{handle} is already disconnecting"),
            )),
            prior_link @ (LinkStatus::Connecting | LinkStatus::Connected) => {
                let dropped = CommandArbiter::force_release(record);
                record.link = LinkStatus::Disconnecting;
                info!(%handle, "disconnecting");
                Ok(PendingDisconnect {
                    identity: record.identity,
                    prior_link,
                    dropped,
                })
            }
        }
    }

    /// Rolls back [`Negotiator::request_disconnect`] after the transport refused it.
    pub fn disconnect_refused(&mut self, handle: NymiHandle, pending: &PendingDisconnect) {
        let Ok(record) = self.registry.resolve_mut(handle) else {
            return;
        };
        if record.link != LinkStatus::Disconnecting {
            return;
        }
        record.link = pending.prior_link;
        if let Some(dropped) = &pending.dropped {
            record.state = dropped.prior_state;
        }
        warn!(%handle, link = ?record.link, "disconnection refused by transport");
    }

    /// Identity to query for signal strength.
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`], or [`NclError::WrongState`] if not connected.
    pub fn rssi_target(&self, handle: NymiHandle) -> Result<DeviceIdentity, NclError> {
        let record = self.registry.resolve(handle)?;
        if record.link != LinkStatus::Connected {
            return Err(NclError::wrong_state("get_rssi", format!("{handle} is not connected")));
        }
        Ok(record.identity)
    }

    /// Identity whose advertisement may be read.
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`], or [`NclError::WrongState`] if the band was
    /// never found or detected.
    pub fn advertisement_target(&self, handle: NymiHandle) -> Result<DeviceIdentity, NclError> {
        let record = self.registry.resolve(handle)?;
        if !record.advertised {
            return Err(NclError::wrong_state(
                "advertisement",
                format!("{handle} was not found or detected"),
            ));
        }
        Ok(record.identity)
    }

    /// Drops every claim and link for session teardown.
    ///
    /// Returns whether a scan was running and the identities that were linked.
    pub fn teardown(&mut self) -> (bool, Vec<DeviceIdentity>) {
        let was_scanning = self.end_scan();
        let mut linked = Vec::new();
        for record in self.registry.records_mut() {
            CommandArbiter::force_release(record);
            if record.link.is_linked() {
                linked.push(record.identity);
                record.link = LinkStatus::Idle;
                record.state = NegotiationState::Disconnected;
                record.streaming_ecg = false;
            }
        }
        (was_scanning, linked)
    }

    // ── Transport events ──────────────────────────────────────────────────────

    /// Applies one transport event.
    pub fn apply(&mut self, event: TransportEvent) -> Transition {
        match event {
            TransportEvent::Opened { result } => self.on_opened(result),
            TransportEvent::Advertisement {
                identity,
                rssi,
                matched,
            } => self.on_advertisement(identity, rssi, matched),
            TransportEvent::Connected { identity } => self.on_connected(identity),
            TransportEvent::ConnectFailed { identity, reason } | TransportEvent::Disconnected { identity, reason } => {
                self.on_link_lost(identity, reason)
            }
            TransportEvent::CommandCompleted {
                identity,
                ticket,
                frame,
            } => self.on_completion(identity, ticket, &frame),
            TransportEvent::EcgSamples { identity, samples } => self.on_ecg(identity, samples),
            TransportEvent::Rssi { identity, rssi } => self.on_rssi(identity, rssi),
            TransportEvent::Fault { code } => {
                warn!(%code, "transport fault");
                if code == ErrorCode::NclFailed {
                    self.transport = TransportStatus::Failed;
                }
                Transition {
                    events: vec![NclEvent::Error { code }],
                    actions: Vec::new(),
                }
            }
        }
    }

    fn on_opened(&mut self, result: Result<(), ErrorCode>) -> Transition {
        let mut transition = Transition::default();
        match result {
            Ok(()) => {
                self.transport = TransportStatus::Ready;
                info!("transport ready");
                transition.events.push(NclEvent::Init { success: true });
            }
            Err(code) => {
                self.transport = TransportStatus::Failed;
                warn!(%code, "transport failed to open");
                transition.events.push(NclEvent::Init { success: false });
                transition.events.push(NclEvent::Error { code });
            }
        }
        transition
    }

    fn on_advertisement(&mut self, identity: DeviceIdentity, rssi: i32, matched: Option<ProvisionMatch>) -> Transition {
        let mut transition = Transition::default();
        match &mut self.scan {
            ScanState::Idle => trace!(%identity, "advertisement outside a scan ignored"),
            ScanState::Discovering { seen } => {
                if !seen.insert(identity) {
                    return transition;
                }
                let record = self.registry.entry(identity);
                record.rssi = Some(rssi);
                if record.link.is_linked() {
                    debug!(handle = %record.handle, "linked band advertised during discovery");
                    return transition;
                }
                record.state = NegotiationState::Discovered;
                debug!(handle = %record.handle, rssi, "band discovered");
                transition.events.push(NclEvent::Discovery {
                    handle: record.handle,
                    rssi,
                });
            }
            ScanState::Finding {
                provisions,
                detect,
                found,
                detected,
            } => {
                let provision = matched.and_then(|m| {
                    provisions
                        .iter()
                        .find(|p| p.id == m.provision_id)
                        .map(|p| (p.clone(), m.strong))
                });
                match provision {
                    Some((provision, strong_report)) => {
                        if !found.insert(identity) {
                            return transition;
                        }
                        let record = self.registry.entry(identity);
                        let strong = strong_report && provision.strong;
                        let provision_id = provision.id;
                        record.rssi = Some(rssi);
                        record.advertised = true;
                        record.strong_find = strong;
                        record.matched_provision = Some(provision);
                        if !record.link.is_linked() {
                            record.state = NegotiationState::Found;
                        }
                        debug!(handle = %record.handle, rssi, strong, "band found");
                        transition.events.push(NclEvent::Find {
                            handle: record.handle,
                            rssi,
                            provision_id,
                            strong,
                        });
                    }
                    None if *detect => {
                        if found.contains(&identity) || !detected.insert(identity) {
                            return transition;
                        }
                        let record = self.registry.entry(identity);
                        record.rssi = Some(rssi);
                        record.advertised = true;
                        if !record.link.is_linked() && record.state != NegotiationState::Found {
                            record.state = NegotiationState::Detected;
                        }
                        debug!(handle = %record.handle, rssi, "band detected");
                        transition.events.push(NclEvent::Detection {
                            handle: record.handle,
                            rssi,
                        });
                    }
                    None => trace!(%identity, "unmatched advertisement ignored"),
                }
            }
        }
        transition
    }

    fn on_connected(&mut self, identity: DeviceIdentity) -> Transition {
        let mut transition = Transition::default();
        let Some(record) = self.registry.by_identity_mut(identity) else {
            warn!(%identity, "connection from an untracked band ignored");
            return transition;
        };
        if record.link != LinkStatus::Connecting {
            warn!(handle = %record.handle, link = ?record.link, "unsolicited connection ignored");
            return transition;
        }
        record.link = LinkStatus::Connected;
        info!(handle = %record.handle, "link up");

        let (handle, identity) = (record.handle, record.identity);
        if let CommandSlot::Busy(in_flight) = &mut record.slot {
            if in_flight.phase == Phase::AwaitingConnection {
                in_flight.phase = Phase::AwaitingCompletion;
                transition.actions.push(TransportAction::Send {
                    handle,
                    ticket: in_flight.ticket,
                    identity,
                    opcode: in_flight.command.opcode(),
                    payload: in_flight.command.encode_payload(),
                });
            }
        }
        transition
    }

    fn on_link_lost(&mut self, identity: DeviceIdentity, reason: DisconnectionReason) -> Transition {
        let mut transition = Transition::default();
        let Some(record) = self.registry.by_identity_mut(identity) else {
            return transition;
        };
        if !record.link.is_linked() {
            debug!(handle = %record.handle, "duplicate disconnection ignored");
            return transition;
        }
        if let Some(dropped) = CommandArbiter::force_release(record) {
            debug!(handle = %record.handle, command = dropped.command.name(), "in-flight command ended by disconnection");
        }
        record.link = LinkStatus::Idle;
        record.state = NegotiationState::Disconnected;
        record.streaming_ecg = false;
        info!(handle = %record.handle, %reason, "link down");
        transition.events.push(NclEvent::Disconnection {
            handle: record.handle,
            reason,
        });
        transition
    }

    fn on_completion(&mut self, identity: DeviceIdentity, ticket: CommandTicket, frame: &[u8]) -> Transition {
        let mut transition = Transition::default();
        let Some(record) = self.registry.by_identity_mut(identity) else {
            warn!(%identity, %ticket, "completion for an untracked band dropped");
            return transition;
        };
        let current = record.slot.in_flight().map(|f| (f.ticket, f.phase));
        if current != Some((ticket, Phase::AwaitingCompletion)) {
            warn!(handle = %record.handle, %ticket, "stale completion dropped");
            return transition;
        }
        let Some(in_flight) = CommandArbiter::release(record, ticket) else {
            return transition;
        };

        match decode_completion(&in_flight.command, frame) {
            Ok(response) => transition.events.push(succeed(record, &in_flight, response)),
            Err(code) => {
                warn!(handle = %record.handle, command = in_flight.command.name(), %code, "command failed");
                transition.events.push(NclEvent::Error { code });
                transition.actions.extend(unwind(record, &in_flight));
            }
        }
        transition
    }

    fn on_ecg(&mut self, identity: DeviceIdentity, samples: EcgSamples) -> Transition {
        let mut transition = Transition::default();
        if let Some(record) = self.registry.by_identity_mut(identity) {
            if record.streaming_ecg {
                transition.events.push(NclEvent::Ecg {
                    handle: record.handle,
                    samples,
                });
            } else {
                trace!(handle = %record.handle, "ECG samples outside a stream dropped");
            }
        }
        transition
    }

    fn on_rssi(&mut self, identity: DeviceIdentity, rssi: i32) -> Transition {
        let mut transition = Transition::default();
        if let Some(record) = self.registry.by_identity_mut(identity) {
            record.rssi = Some(rssi);
            if record.link == LinkStatus::Connected {
                transition.events.push(NclEvent::Rssi {
                    handle: record.handle,
                    rssi,
                });
            }
        }
        transition
    }
}

/// Decodes a completion frame for `command`, classifying every defect.
fn decode_completion(command: &Command, bytes: &[u8]) -> Result<CommandResponse, ErrorCode> {
    let (frame, consumed) = decode_frame(bytes).map_err(|err| {
        warn!(error = %err, "undecodable completion frame");
        ErrorCode::Mismatch
    })?;
    if consumed != bytes.len() {
        warn!(consumed, len = bytes.len(), "completion frame followed by stray bytes");
        return Err(ErrorCode::Mismatch);
    }
    if frame.opcode != command.opcode() {
        warn!(expected = ?command.opcode(), got = ?frame.opcode, "completion answers another command");
        return Err(ErrorCode::Mismatch);
    }
    let payload = frame.outcome?;
    CommandResponse::decode(frame.opcode, &payload).map_err(|err| {
        warn!(error = %err, opcode = ?frame.opcode, "malformed response payload");
        ErrorCode::Mismatch
    })
}

/// Applies a successful response to `record` and builds its event.
fn succeed(record: &mut DeviceRecord, in_flight: &InFlight, response: CommandResponse) -> NclEvent {
    let handle = record.handle;
    match response {
        CommandResponse::Agreed { leds } => {
            record.state = NegotiationState::Agreed;
            NclEvent::Agreement { handle, leds }
        }
        CommandResponse::Validated => {
            record.state = NegotiationState::Validated;
            NclEvent::Validation { handle }
        }
        CommandResponse::Provisioned { key, id } => {
            record.state = NegotiationState::Provisioned;
            let strong = matches!(in_flight.command, Command::Provision { strong: true, .. });
            NclEvent::Provision {
                handle,
                provision: Provision { key, id, strong },
            }
        }
        CommandResponse::Notified => NclEvent::Notified { handle },
        CommandResponse::EcgStarted => {
            record.streaming_ecg = true;
            NclEvent::EcgStart { handle }
        }
        CommandResponse::EcgStopped => {
            record.streaming_ecg = false;
            NclEvent::EcgStop { handle }
        }
        CommandResponse::Vk { id, vk } => {
            if !record.verification_keys.contains(&id) {
                record.verification_keys.push(id);
            }
            NclEvent::Vk { handle, id, vk }
        }
        CommandResponse::Sig { sig } => NclEvent::Sig { handle, sig },
        CommandResponse::GlobalVk { id, vk } => NclEvent::GlobalVk { handle, id, vk },
        CommandResponse::GlobalSig { vk_id, sig } => NclEvent::GlobalSig { handle, vk_id, sig },
        CommandResponse::CreatedSk { id, sk } => NclEvent::CreatedSk { handle, id, sk },
        CommandResponse::GotSk { sk } => NclEvent::GotSk { handle, sk },
        CommandResponse::Prg { value } => NclEvent::Prg { handle, value },
        CommandResponse::FirmwareVersion { version } => NclEvent::FirmwareVersion { handle, version },
    }
}

/// Rolls back a failed command.  A command that opened its own link closes it.
fn unwind(record: &mut DeviceRecord, in_flight: &InFlight) -> Option<TransportAction> {
    if in_flight.opened_link && record.link == LinkStatus::Connected {
        record.link = LinkStatus::Disconnecting;
        Some(TransportAction::Disconnect {
            handle: record.handle,
            identity: record.identity,
        })
    } else {
        record.state = in_flight.prior_state;
        None
    }
}
