//! Transport port: the boundary between the session engine and a radio.
//!
//! A transport owns everything below the command slot: scanning, connecting,
//! moving command bytes, and reporting signal strength.  Every method returns
//! immediately.  Outcomes flow back later as [`TransportEvent`]s pushed into
//! the [`TransportSink`] the engine hands over in [`NymiTransport::open`].
//!
//! # Testability
//!
//! The [`NymiTransport`] trait lets tests script a band without hardware:
//! integration tests use
//! [`crate::infrastructure::transport::simulated::SimulatedTransport`], and
//! unit tests use the `mockall`-generated `MockNymiTransport`.

use std::fmt;
use std::sync::Arc;

use ncl_core::domain::keys::{Adv, EcgSamples, ProvisionId};
use ncl_core::{CommandTicket, DeviceIdentity, DisconnectionReason, ErrorCode, NclError, Opcode, Provision};
use thiserror::Error;

/// Settings handed to the transport when the session opens it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    /// Application name registered with the backend.
    pub nea_name: String,
    /// Whether the backend runs in developer mode.
    pub dev_mode: bool,
    /// Host of the radio daemon.
    pub host: String,
    /// Port of the radio daemon.
    pub port: u16,
}

/// Kind of session-wide scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    /// Look for bands in provisioning mode.
    Discovery,
    /// Look for bands advertising one of a set of provisions.
    Finding,
}

/// Bluetooth LE connection parameter hints.
///
/// Units follow the link layer: intervals in 1.25 ms steps, the supervision
/// timeout in 10 ms steps, latency in connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub supervision_timeout: u16,
    pub latency: u16,
}

impl ConnectionParams {
    const INTERVAL_RANGE: std::ops::RangeInclusive<u16> = 6..=3200;
    const TIMEOUT_RANGE: std::ops::RangeInclusive<u16> = 10..=3200;
    const MAX_LATENCY: u16 = 500;

    /// Checks the hints against the ranges the link layer accepts.
    ///
    /// # Errors
    ///
    /// Returns [`NclError::BadValue`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), NclError> {
        if !Self::INTERVAL_RANGE.contains(&self.interval_min)
            || !Self::INTERVAL_RANGE.contains(&self.interval_max)
        {
            return Err(NclError::BadValue(format!(
                "connection interval must be within 6..=3200 units, got {}..{}",
                self.interval_min, self.interval_max
            )));
        }
        if self.interval_max < self.interval_min {
            return Err(NclError::BadValue(format!(
                "maximum interval {} is below minimum interval {}",
                self.interval_max, self.interval_min
            )));
        }
        if !Self::TIMEOUT_RANGE.contains(&self.supervision_timeout) {
            return Err(NclError::BadValue(format!(
                "supervision timeout must be within 10..=3200 units, got {}",
                self.supervision_timeout
            )));
        }
        if self.latency > Self::MAX_LATENCY {
            return Err(NclError::BadValue(format!(
                "latency must be at most {}, got {}",
                Self::MAX_LATENCY,
                self.latency
            )));
        }
        // timeout * 10 ms must exceed interval_max * 1.25 ms
        if u32::from(self.supervision_timeout) * 8 <= u32::from(self.interval_max) {
            return Err(NclError::BadValue(format!(
                "supervision timeout {} ms does not exceed the maximum interval",
                u32::from(self.supervision_timeout) * 10
            )));
        }
        Ok(())
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            interval_min: 8,
            interval_max: 500,
            supervision_timeout: 300,
            latency: 10,
        }
    }
}

/// Provision a band's advertisement matched during finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionMatch {
    pub provision_id: ProvisionId,
    /// The match was authenticated by the radio rather than inferred.
    pub strong: bool,
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The backend finished opening.
    Opened { result: Result<(), ErrorCode> },
    /// One advertisement packet.  Sent once per packet; the engine dedupes.
    Advertisement {
        identity: DeviceIdentity,
        rssi: i32,
        matched: Option<ProvisionMatch>,
    },
    Connected { identity: DeviceIdentity },
    ConnectFailed {
        identity: DeviceIdentity,
        reason: DisconnectionReason,
    },
    Disconnected {
        identity: DeviceIdentity,
        reason: DisconnectionReason,
    },
    /// A command completed.  `frame` is an encoded `ResponseFrame`.
    CommandCompleted {
        identity: DeviceIdentity,
        ticket: CommandTicket,
        frame: Vec<u8>,
    },
    EcgSamples {
        identity: DeviceIdentity,
        samples: EcgSamples,
    },
    Rssi { identity: DeviceIdentity, rssi: i32 },
    /// A backend failure not tied to one band.
    Fault { code: ErrorCode },
}

/// Channel through which a transport reports [`TransportEvent`]s.
///
/// Cheap to clone.  Submitting never blocks; events submitted after the
/// session finished are dropped.
#[derive(Clone)]
pub struct TransportSink {
    submit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportSink {
    pub fn new<F>(submit: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            submit: Arc::new(submit),
        }
    }

    pub fn submit(&self, event: TransportEvent) {
        (self.submit)(event);
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink").finish_non_exhaustive()
    }
}

/// Error type for synchronous transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport backend unavailable: {0}")]
    Unavailable(String),
    #[error("link failure: {0}")]
    Link(String),
    #[error("transport is not open")]
    NotOpen,
}

impl From<TransportError> for NclError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(detail) => NclError::TransportUnavailable(detail),
            TransportError::NotOpen => NclError::TransportUnavailable("transport is not open".to_string()),
            TransportError::Link(detail) => NclError::TransportLinkFailed(detail),
        }
    }
}

/// Port implemented by every radio transport.
///
/// All methods must return without waiting on the radio.
#[cfg_attr(test, mockall::automock)]
pub trait NymiTransport: Send + Sync {
    /// Short name of the backend, reported by `Ncl::info`.
    fn flavor(&self) -> &'static str;

    /// Starts the backend.  The outcome arrives as [`TransportEvent::Opened`].
    fn open(&self, options: &TransportOptions, sink: TransportSink) -> Result<(), TransportError>;

    /// Stops the backend and drops the sink.
    fn close(&self);

    fn start_scan(&self, kind: ScanKind, provisions: &[Provision]) -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    /// Requests a link.  Answered by `Connected` or `ConnectFailed`.
    fn connect(&self, identity: DeviceIdentity, params: ConnectionParams) -> Result<(), TransportError>;

    /// Requests the link be closed.  Answered by `Disconnected`.
    fn disconnect(&self, identity: DeviceIdentity) -> Result<(), TransportError>;

    /// Sends one command.  Answered by `CommandCompleted` carrying `ticket`.
    fn send_command(
        &self,
        identity: DeviceIdentity,
        ticket: CommandTicket,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Asks for a signal strength reading.  May never be answered.
    fn request_rssi(&self, identity: DeviceIdentity) -> Result<(), TransportError>;

    /// Last advertisement payload seen from `identity`, if any.
    fn advertisement(&self, identity: DeviceIdentity) -> Option<Adv>;
}
