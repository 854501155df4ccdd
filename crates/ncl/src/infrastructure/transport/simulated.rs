//! Simulated radio.
//!
//! Records every call the session makes and lets the caller script what the
//! bands do: advertise, accept or refuse links, answer commands.  By default
//! it behaves like an idle, cooperative radio: `open` succeeds, `connect`
//! links up at once, `disconnect` reports a local disconnection, and
//! `request_rssi` answers with the last advertised signal strength.
//! [`SimulatedTransport::manual`] turns those automatic answers off.

use std::collections::HashMap;
use std::sync::Mutex;

use ncl_core::domain::keys::{Adv, EcgSamples};
use ncl_core::{
    encode_frame, CommandResponse, CommandTicket, DeviceIdentity, DisconnectionReason, ErrorCode,
    Opcode, Provision, ResponseFrame,
};
use tracing::trace;

use crate::application::lock;
use crate::application::transport::{
    ConnectionParams, NymiTransport, ProvisionMatch, ScanKind, TransportError, TransportEvent,
    TransportOptions, TransportSink,
};

const DEFAULT_RSSI: i32 = -60;

/// One call the session made on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open(TransportOptions),
    Close,
    StartScan {
        kind: ScanKind,
        provisions: Vec<Provision>,
    },
    StopScan,
    Connect {
        identity: DeviceIdentity,
        params: ConnectionParams,
    },
    Disconnect {
        identity: DeviceIdentity,
    },
    SendCommand {
        identity: DeviceIdentity,
        ticket: CommandTicket,
        opcode: Opcode,
        payload: Vec<u8>,
    },
    RequestRssi {
        identity: DeviceIdentity,
    },
}

#[derive(Default)]
struct SimState {
    sink: Option<TransportSink>,
    calls: Vec<TransportCall>,
    advertisements: HashMap<DeviceIdentity, Adv>,
    rssi: HashMap<DeviceIdentity, i32>,
    fail_next: Option<TransportError>,
}

/// In-process [`NymiTransport`] driven by the caller.
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    automatic: bool,
}

impl SimulatedTransport {
    /// A cooperative radio that answers opens, links, and RSSI requests itself.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            automatic: true,
        }
    }

    /// A radio that only reports what the caller scripts.
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            automatic: false,
        }
    }

    // ── Scripting ─────────────────────────────────────────────────────────────

    /// Reports `event` to the session.  Dropped if the transport is not open.
    pub fn emit(&self, event: TransportEvent) {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => sink.submit(event),
            None => trace!(?event, "simulated transport closed; event dropped"),
        }
    }

    /// One advertisement packet from `identity`.
    pub fn advertise(&self, identity: DeviceIdentity, rssi: i32, matched: Option<ProvisionMatch>) {
        lock(&self.state).rssi.insert(identity, rssi);
        self.emit(TransportEvent::Advertisement {
            identity,
            rssi,
            matched,
        });
    }

    pub fn accept_connection(&self, identity: DeviceIdentity) {
        self.emit(TransportEvent::Connected { identity });
    }

    pub fn refuse_connection(&self, identity: DeviceIdentity, reason: DisconnectionReason) {
        self.emit(TransportEvent::ConnectFailed { identity, reason });
    }

    /// Completes command `ticket` successfully with `response`.
    pub fn respond(&self, identity: DeviceIdentity, ticket: CommandTicket, response: &CommandResponse) {
        let frame = encode_frame(&ResponseFrame::success(response.opcode(), response.encode_payload()));
        self.emit(TransportEvent::CommandCompleted {
            identity,
            ticket,
            frame,
        });
    }

    /// Completes command `ticket` with a band-side failure.
    pub fn reject(&self, identity: DeviceIdentity, ticket: CommandTicket, opcode: Opcode, code: ErrorCode) {
        let frame = encode_frame(&ResponseFrame::failure(opcode, code));
        self.emit(TransportEvent::CommandCompleted {
            identity,
            ticket,
            frame,
        });
    }

    /// The band drops its link.
    pub fn drop_link(&self, identity: DeviceIdentity, reason: DisconnectionReason) {
        self.emit(TransportEvent::Disconnected { identity, reason });
    }

    pub fn stream_ecg(&self, identity: DeviceIdentity, samples: EcgSamples) {
        self.emit(TransportEvent::EcgSamples { identity, samples });
    }

    /// Stores the advertisement payload returned for `identity`.
    pub fn set_advertisement(&self, identity: DeviceIdentity, adv: Adv) {
        lock(&self.state).advertisements.insert(identity, adv);
    }

    /// Makes the next fallible call return `err`.
    pub fn fail_next_call(&self, err: TransportError) {
        lock(&self.state).fail_next = Some(err);
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).sink.is_some()
    }

    /// The most recent command sent, as `(identity, ticket, opcode)`.
    pub fn last_command(&self) -> Option<(DeviceIdentity, CommandTicket, Opcode)> {
        lock(&self.state).calls.iter().rev().find_map(|call| match call {
            TransportCall::SendCommand {
                identity,
                ticket,
                opcode,
                ..
            } => Some((*identity, *ticket, *opcode)),
            _ => None,
        })
    }

    /// Number of commands sent so far.
    pub fn commands_sent(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::SendCommand { .. }))
            .count()
    }

    /// Records `call` and returns the sink for an automatic answer, or the
    /// scripted failure.
    fn record(&self, call: TransportCall) -> Result<Option<TransportSink>, TransportError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let Some(sink) = state.sink.clone() else {
            return Err(TransportError::NotOpen);
        };
        state.calls.push(call);
        Ok(self.automatic.then_some(sink))
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NymiTransport for SimulatedTransport {
    fn flavor(&self) -> &'static str {
        "simulated"
    }

    fn open(&self, options: &TransportOptions, sink: TransportSink) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.state);
            if let Some(err) = state.fail_next.take() {
                return Err(err);
            }
            state.calls.push(TransportCall::Open(options.clone()));
            state.sink = Some(sink.clone());
        }
        if self.automatic {
            sink.submit(TransportEvent::Opened { result: Ok(()) });
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.sink = None;
        state.calls.push(TransportCall::Close);
    }

    fn start_scan(&self, kind: ScanKind, provisions: &[Provision]) -> Result<(), TransportError> {
        self.record(TransportCall::StartScan {
            kind,
            provisions: provisions.to_vec(),
        })
        .map(drop)
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(TransportCall::StopScan).map(drop)
    }

    fn connect(&self, identity: DeviceIdentity, params: ConnectionParams) -> Result<(), TransportError> {
        if let Some(sink) = self.record(TransportCall::Connect { identity, params })? {
            sink.submit(TransportEvent::Connected { identity });
        }
        Ok(())
    }

    fn disconnect(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        if let Some(sink) = self.record(TransportCall::Disconnect { identity })? {
            sink.submit(TransportEvent::Disconnected {
                identity,
                reason: DisconnectionReason::Local,
            });
        }
        Ok(())
    }

    fn send_command(
        &self,
        identity: DeviceIdentity,
        ticket: CommandTicket,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SendCommand {
            identity,
            ticket,
            opcode,
            payload: payload.to_vec(),
        })
        .map(drop)
    }

    fn request_rssi(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        if let Some(sink) = self.record(TransportCall::RequestRssi { identity })? {
            let rssi = lock(&self.state).rssi.get(&identity).copied().unwrap_or(DEFAULT_RSSI);
            sink.submit(TransportEvent::Rssi { identity, rssi });
        }
        Ok(())
    }

    fn advertisement(&self, identity: DeviceIdentity) -> Option<Adv> {
        lock(&self.state).advertisements.get(&identity).copied()
    }
}
