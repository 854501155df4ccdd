//! The session facade: [`Ncl`].
//!
//! # How a call flows (for beginners)
//!
//! ```text
//!  application ──agree(h)──► Ncl ──lock──► Negotiator (admit, claim slot)
//!                             │
//!                             └──after unlock──► NymiTransport::connect
//!
//!  transport thread ──TransportEvent──► TransportSink ──► EventDelivery queue
//!
//!  dispatch thread / update() ──► Negotiator::apply ──► NclEvent ──► behaviors
//! ```
//!
//! Calls only decide and start work; their outcomes arrive later as events.
//! The negotiator lock is never held while the transport runs or while
//! callbacks run, so a callback may call straight back into the session
//! (stop the scan, agree with the band it just discovered, and so on).
//!
//! # Error reporting
//!
//! Every failed call returns its [`NclError`], offers the error's code to the
//! error-code latch (read with [`Ncl::take_error_code`]), and writes one line
//! to the error sink passed to [`Ncl::init`].  Error events do the same when
//! they are dispatched.

use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ncl_core::domain::keys::{Adv, Message, PartnerPublicKey, Sig, SkId, VkId};
use ncl_core::{
    Command, DisconnectionReason, ErrorCode, EventFilter, HandleFilter, NclError, NclEvent, NymiHandle,
    Provision, SignatureScheme,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::application::behaviors::{Behavior, BehaviorRegistry, Callback, UserData};
use crate::application::delivery::{DeliveryMode, DrainOutcome, EventDelivery, PullDelivery, PushDelivery};
use crate::application::lock;
use crate::application::negotiation::{Negotiator, TransportAction, TransportStatus};
use crate::application::registry::DeviceSnapshot;
use crate::application::transport::{
    ConnectionParams, NymiTransport, ScanKind, TransportError, TransportEvent, TransportOptions, TransportSink,
};
use crate::infrastructure::error_sink::ErrorSink;
use crate::infrastructure::storage::config::{load_config, ConfigError, NclConfig};

/// Longest application name a band accepts.
pub const MAX_NAME_LEN: usize = ncl_core::protocol::command::MAX_NEA_NAME_LEN;

/// How a session delivers events and which bands it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NclMode {
    pub delivery: DeliveryMode,
    /// Talk to development bands.
    pub dev: bool,
}

impl NclMode {
    pub const ASYNCHRONOUS: Self = Self {
        delivery: DeliveryMode::Asynchronous,
        dev: false,
    };

    pub const SYNCHRONOUS: Self = Self {
        delivery: DeliveryMode::Synchronous,
        dev: false,
    };

    /// The same mode, talking to development bands.
    pub const fn dev(self) -> Self {
        Self { dev: true, ..self }
    }
}

/// Read-only snapshot returned by [`Ncl::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NclInfo {
    pub version: &'static str,
    /// Name of the transport backend.
    pub flavor: &'static str,
    pub session: Uuid,
    pub initialized: bool,
    pub mode: Option<NclMode>,
    pub transport: Option<TransportStatus>,
    pub scan: Option<ScanKind>,
    pub devices: usize,
    pub connected: usize,
    pub behaviors: usize,
    /// What the application is expected to do next.
    pub expectation: &'static str,
}

/// State that exists between `init` and `finish`.
struct Runtime {
    mode: NclMode,
    name: String,
    delivery: Arc<dyn EventDelivery>,
    negotiator: Mutex<Negotiator>,
    behaviors: Mutex<BehaviorRegistry>,
    sink: Mutex<ErrorSink>,
}

struct Shared {
    id: Uuid,
    transport: Arc<dyn NymiTransport>,
    config: Mutex<NclConfig>,
    /// Raw [`ErrorCode`]; `ErrorCode::None` when clear.
    latch: AtomicU8,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl Shared {
    fn offer(&self, code: ErrorCode) {
        // First error wins until it is read.
        let _ = self.latch.compare_exchange(
            ErrorCode::None as u8,
            code as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stops everything `runtime` started.  The runtime must already be
    /// detached from the session.
    fn shut_down(&self, runtime: &Runtime) {
        let (was_scanning, linked) = lock(&runtime.negotiator).teardown();
        if was_scanning {
            if let Err(err) = self.transport.stop_scan() {
                warn!(error = %err, "stop_scan failed during finish");
            }
        }
        for identity in linked {
            if let Err(err) = self.transport.disconnect(identity) {
                warn!(%identity, error = %err, "disconnect failed during finish");
            }
        }
        runtime.delivery.shutdown();
        self.transport.close();
        lock(&runtime.behaviors).clear();
        info!(session = %self.id, "session finished");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            debug!(session = %self.id, "session dropped while initialized");
            self.shut_down(&runtime);
        }
    }
}

/// One library session bound to one transport.
///
/// Cheap to clone; clones share the session.  Dropping the last clone
/// finishes the session if the application did not.
#[derive(Clone)]
pub struct Ncl {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Ncl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ncl")
            .field("session", &self.shared.id)
            .field("flavor", &self.shared.transport.flavor())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Ncl {
    pub fn new(transport: Arc<dyn NymiTransport>) -> Self {
        Self::with_config(transport, NclConfig::default())
    }

    pub fn with_config(transport: Arc<dyn NymiTransport>, config: NclConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                transport,
                config: Mutex::new(config),
                latch: AtomicU8::new(ErrorCode::None as u8),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Creates a session configured from the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn from_config_file(transport: Arc<dyn NymiTransport>, path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::with_config(transport, load_config(path)?))
    }

    /// Identifier of this session, used in log output.
    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> NclConfig {
        lock(&self.shared.config).clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Selects the radio daemon the transport connects to.
    ///
    /// # Errors
    ///
    /// [`NclError::WrongState`] once initialized; [`NclError::BadValue`] if
    /// `host` is not an IP address.
    pub fn set_endpoint(&self, host: &str, port: u16) -> Result<(), NclError> {
        let result = if self.is_initialized() {
            Err(NclError::wrong_state("set_endpoint", "the session is already initialized"))
        } else if host.parse::<IpAddr>().is_err() {
            Err(NclError::BadValue(format!("{host:?} is not an IP address")))
        } else {
            let mut config = lock(&self.shared.config);
            config.ecodaemon.host = host.to_string();
            config.ecodaemon.port = port;
            debug!(host, port, "endpoint set");
            Ok(())
        };
        self.settle("set_endpoint", result)
    }

    /// Starts the session.
    ///
    /// `callback` is registered as a behavior for every event and every
    /// handle.  The transport opens in the background; its outcome is the
    /// first event delivered ([`NclEvent::Init`]).
    ///
    /// # Errors
    ///
    /// - [`NclError::AlreadyInitialized`] if the session is running.
    /// - [`NclError::BadValue`] if `name` is empty or longer than 18 characters.
    /// - [`NclError::TransportUnavailable`] if the transport refuses to open.
    pub fn init(
        &self,
        callback: Callback,
        user_data: UserData,
        name: &str,
        mode: NclMode,
        error_sink: Option<Box<dyn Write + Send>>,
    ) -> Result<(), NclError> {
        let result = self.start(callback, user_data, name, mode, error_sink);
        self.settle("init", result)
    }

    /// [`Ncl::init`] with the name and mode from the session configuration.
    ///
    /// # Errors
    ///
    /// As [`Ncl::init`].
    pub fn init_from_config(
        &self,
        callback: Callback,
        user_data: UserData,
        error_sink: Option<Box<dyn Write + Send>>,
    ) -> Result<(), NclError> {
        let session = lock(&self.shared.config).session.clone();
        let mode = NclMode {
            delivery: session.mode,
            dev: session.dev,
        };
        self.init(callback, user_data, &session.name, mode, error_sink)
    }

    fn start(
        &self,
        callback: Callback,
        user_data: UserData,
        name: &str,
        mode: NclMode,
        error_sink: Option<Box<dyn Write + Send>>,
    ) -> Result<(), NclError> {
        let length = name.chars().count();
        if length == 0 || length > MAX_NAME_LEN {
            return Err(NclError::BadValue(format!(
                "name must be 1 to {MAX_NAME_LEN} characters, got {length}"
            )));
        }
        let config = self.config();
        let params = config.connection.params();
        params.validate()?;

        let mut slot = lock(&self.shared.runtime);
        if slot.is_some() {
            return Err(NclError::AlreadyInitialized);
        }

        let delivery: Arc<dyn EventDelivery> = match mode.delivery {
            DeliveryMode::Asynchronous => {
                let session = Arc::downgrade(&self.shared);
                Arc::new(PushDelivery::spawn(Box::new(move |event| deliver(&session, event)))?)
            }
            DeliveryMode::Synchronous => Arc::new(PullDelivery::new()),
        };
        let mut behaviors = BehaviorRegistry::new();
        behaviors.add(Behavior::new(callback, user_data, EventFilter::Any, HandleFilter::Any))?;

        let runtime = Arc::new(Runtime {
            mode,
            name: name.to_string(),
            delivery: Arc::clone(&delivery),
            negotiator: Mutex::new(Negotiator::new(params)),
            behaviors: Mutex::new(behaviors),
            sink: Mutex::new(ErrorSink::new(error_sink, mode.delivery)),
        });
        *slot = Some(Arc::clone(&runtime));
        drop(slot);

        let options = TransportOptions {
            nea_name: name.to_string(),
            dev_mode: mode.dev,
            host: config.ecodaemon.host,
            port: config.ecodaemon.port,
        };
        let sink = {
            let delivery = Arc::clone(&delivery);
            TransportSink::new(move |event| delivery.submit(event))
        };
        if let Err(err) = self.shared.transport.open(&options, sink) {
            let err = NclError::from(err);
            lock(&runtime.sink).line(&format!("init failed: {err}"));
            self.detach(&runtime);
            runtime.delivery.shutdown();
            return Err(err);
        }

        info!(
            session = %self.shared.id,
            name,
            mode = ?mode.delivery,
            dev = mode.dev,
            flavor = self.shared.transport.flavor(),
            "session initialized"
        );
        Ok(())
    }

    /// Ends the session: stops scanning, drops every link, stops delivery,
    /// and forgets every behavior.  No callback runs after this returns.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`], or [`NclError::WrongState`] when called
    /// from inside a callback.
    pub fn finish(&self) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| {
            if runtime.delivery.is_dispatch_thread() {
                return Err(NclError::wrong_state("finish", "called from inside a callback"));
            }
            if self.detach(&runtime) {
                self.shared.shut_down(&runtime);
            }
            Ok(())
        });
        self.settle("finish", result)
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.shared.runtime).is_some()
    }

    /// Snapshot of the session for diagnostics.  Also writes a line to the
    /// error sink.
    pub fn info(&self) -> NclInfo {
        let runtime = self.runtime().ok();
        let mut info = NclInfo {
            version: env!("CARGO_PKG_VERSION"),
            flavor: self.shared.transport.flavor(),
            session: self.shared.id,
            initialized: runtime.is_some(),
            mode: None,
            transport: None,
            scan: None,
            devices: 0,
            connected: 0,
            behaviors: 0,
            expectation: "call init to start a session",
        };
        if let Some(runtime) = runtime {
            {
                let negotiator = lock(&runtime.negotiator);
                info.transport = Some(negotiator.transport_status());
                info.scan = negotiator.scan_kind();
                info.devices = negotiator.registry().len();
                info.connected = negotiator.connected().len();
            }
            info.mode = Some(runtime.mode);
            info.behaviors = lock(&runtime.behaviors).len();
            info.expectation = expectation(&info);
            lock(&runtime.sink).line(&format!(
                "info requested: {} v{} session {} ({})",
                info.flavor, info.version, info.session, info.expectation
            ));
        }
        info
    }

    /// Processes queued events on the calling thread, waiting up to
    /// `timeout` for the first one.  Synchronous mode only.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::WrongState`] in asynchronous
    /// mode or from inside a callback; [`NclError::Busy`] if another thread is
    /// already draining.
    pub fn update(&self, timeout: Duration) -> Result<DrainOutcome, NclError> {
        let result = self
            .runtime()
            .and_then(|runtime| runtime.delivery.drain(timeout, &mut |event: TransportEvent| self.process(event)));
        self.settle("update", result)
    }

    // ── Behaviors and error reporting ─────────────────────────────────────────

    /// Registers a behavior.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::BadValue`] if the identical
    /// behavior is already registered.
    pub fn add_behavior(
        &self,
        callback: Callback,
        user_data: UserData,
        event: EventFilter,
        handle: HandleFilter,
    ) -> Result<(), NclError> {
        let result = self
            .runtime()
            .and_then(|runtime| lock(&runtime.behaviors).add(Behavior::new(callback, user_data, event, handle)));
        self.settle("add_behavior", result)
    }

    /// Removes exactly the behavior registered with these four values.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::BadValue`] if no such
    /// behavior is registered.
    pub fn remove_behavior(
        &self,
        callback: Callback,
        user_data: UserData,
        event: EventFilter,
        handle: HandleFilter,
    ) -> Result<(), NclError> {
        let result = self
            .runtime()
            .and_then(|runtime| lock(&runtime.behaviors).remove(&Behavior::new(callback, user_data, event, handle)));
        self.settle("remove_behavior", result)
    }

    /// Reads and clears the first error recorded since the last read.
    pub fn take_error_code(&self) -> ErrorCode {
        let raw = self.shared.latch.swap(ErrorCode::None as u8, Ordering::AcqRel);
        ErrorCode::try_from(raw).unwrap_or_default()
    }

    /// Holds back the session's error sink output until [`Ncl::unlock_error_sink`].
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::WrongState`] in synchronous
    /// mode; [`NclError::Busy`] if already locked.
    pub fn lock_error_sink(&self) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| lock(&runtime.sink).lock());
        self.settle("lock_error_sink", result)
    }

    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::WrongState`] in synchronous
    /// mode or if the sink is not locked.
    pub fn unlock_error_sink(&self) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| lock(&runtime.sink).unlock());
        self.settle("unlock_error_sink", result)
    }

    // ── Scanning and the registry ─────────────────────────────────────────────

    /// Scans for bands in provisioning mode.  Each band is reported once per
    /// scan as [`NclEvent::Discovery`].
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::Busy`] if already scanning;
    /// transport errors.
    pub fn start_discovery(&self) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| self.begin_scan(&runtime, ScanKind::Discovery, &[], false));
        self.settle("start_discovery", result)
    }

    /// Scans for bands advertising one of `provisions`.  With `detect`, bands
    /// that match nothing are reported as [`NclEvent::Detection`].
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::Busy`] if already scanning;
    /// [`NclError::BadValue`] if there is nothing to look for; transport errors.
    pub fn start_finding(&self, provisions: &[Provision], detect: bool) -> Result<(), NclError> {
        let result = self
            .runtime()
            .and_then(|runtime| self.begin_scan(&runtime, ScanKind::Finding, provisions, detect));
        self.settle("start_finding", result)
    }

    fn begin_scan(&self, runtime: &Runtime, kind: ScanKind, provisions: &[Provision], detect: bool) -> Result<(), NclError> {
        lock(&runtime.negotiator).begin_scan(kind, provisions, detect)?;
        if let Err(err) = self.shared.transport.start_scan(kind, provisions) {
            lock(&runtime.negotiator).end_scan();
            return Err(err.into());
        }
        info!(session = %self.shared.id, ?kind, provisions = provisions.len(), detect, "scan started");
        Ok(())
    }

    /// Stops any scan.  Always succeeds once initialized.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`].
    pub fn stop_scan(&self) -> Result<(), NclError> {
        let result = self.runtime().map(|runtime| {
            let was_scanning = lock(&runtime.negotiator).end_scan();
            if was_scanning {
                if let Err(err) = self.shared.transport.stop_scan() {
                    warn!(error = %err, "transport failed to stop scanning");
                }
                info!(session = %self.shared.id, "scan stopped");
            }
        });
        self.settle("stop_scan", result)
    }

    /// Forgets every tracked band.  Handles seen before are invalid afterwards.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::WrongState`] if a band is linked.
    pub fn clear_scanned(&self) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| lock(&runtime.negotiator).clear());
        self.settle("clear_scanned", result)
    }

    /// Sets the connection parameters used for the next link.
    ///
    /// Intervals are in 1.25 ms units, the supervision timeout in 10 ms units,
    /// latency in connection events.
    ///
    /// # Errors
    ///
    /// [`NclError::BadValue`] if the hints are out of range.
    pub fn hint_connection_params(
        &self,
        interval_min: u16,
        interval_max: u16,
        supervision_timeout: u16,
        latency: u16,
    ) -> Result<(), NclError> {
        let params = ConnectionParams {
            interval_min,
            interval_max,
            supervision_timeout,
            latency,
        };
        let result = params.validate().map(|()| {
            {
                let mut config = lock(&self.shared.config);
                config.connection.interval_min = interval_min;
                config.connection.interval_max = interval_max;
                config.connection.supervision_timeout = supervision_timeout;
                config.connection.latency = latency;
            }
            if let Ok(runtime) = self.runtime() {
                lock(&runtime.negotiator).set_params(params);
            }
        });
        self.settle("hint_connection_params", result)
    }

    /// Handles of the bands whose link is up.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`].
    pub fn connected(&self) -> Result<Vec<NymiHandle>, NclError> {
        let result = self.runtime().map(|runtime| lock(&runtime.negotiator).connected());
        self.settle("connected", result)
    }

    /// Current view of one band.
    ///
    /// # Errors
    ///
    /// [`NclError::NotInitialized`]; [`NclError::InvalidHandle`].
    pub fn device(&self, handle: NymiHandle) -> Result<DeviceSnapshot, NclError> {
        let result = self.runtime().and_then(|runtime| lock(&runtime.negotiator).snapshot(handle));
        self.settle("device", result)
    }

    // ── Negotiation ───────────────────────────────────────────────────────────

    /// Connects to a discovered band and asks it to show an agreement pattern.
    /// Answered by [`NclEvent::Agreement`].
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`], [`NclError::WrongState`] unless the band
    /// is discovered and unlinked, [`NclError::Busy`], or transport errors.
    pub fn agree(&self, handle: NymiHandle) -> Result<(), NclError> {
        self.issue(handle, Command::Agree)
    }

    /// Completes provisioning of an agreed band.  Answered by
    /// [`NclEvent::Provision`] carrying the record the application must keep.
    ///
    /// # Errors
    ///
    /// As [`Ncl::agree`]; the band must be connected and agreed.
    pub fn provision(&self, handle: NymiHandle, strong: bool) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| {
            let command = Command::Provision {
                strong,
                nea_name: runtime.name.clone(),
            };
            self.admit(&runtime, handle, command)
        });
        self.settle("provision", result)
    }

    /// Connects to a found band and proves it holds its provision.
    /// Answered by [`NclEvent::Validation`].
    ///
    /// # Errors
    ///
    /// As [`Ncl::agree`]; the band must be found and unlinked.
    pub fn validate(&self, handle: NymiHandle) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| {
            let action = lock(&runtime.negotiator).request_validate(handle)?;
            self.launch(&runtime, action)
        });
        self.settle("validate", result)
    }

    /// Closes the link to a band.  Any command in flight is dropped; the
    /// outcome is [`NclEvent::Disconnection`].
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`]; [`NclError::WrongState`] if the band has
    /// no link; transport errors.
    pub fn disconnect(&self, handle: NymiHandle) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| {
            let pending = lock(&runtime.negotiator).request_disconnect(handle)?;
            if let Some(dropped) = &pending.dropped {
                debug!(%handle, command = dropped.command.name(), ticket = %dropped.ticket, "in-flight command dropped");
            }
            if let Err(err) = self.shared.transport.disconnect(pending.identity) {
                lock(&runtime.negotiator).disconnect_refused(handle, &pending);
                return Err(err.into());
            }
            Ok(())
        });
        self.settle("disconnect", result)
    }

    // ── Privileged commands ───────────────────────────────────────────────────

    /// Buzzes the band with a good or bad notification.
    pub fn notify(&self, handle: NymiHandle, good: bool) -> Result<(), NclError> {
        self.issue(handle, Command::Notify { good })
    }

    pub fn start_ecg_stream(&self, handle: NymiHandle) -> Result<(), NclError> {
        self.issue(handle, Command::StartEcgStream)
    }

    pub fn stop_ecg_stream(&self, handle: NymiHandle) -> Result<(), NclError> {
        self.issue(handle, Command::StopEcgStream)
    }

    /// Creates a signing key pair on the band.  Answered by [`NclEvent::Vk`].
    pub fn create_sig_key_pair(&self, handle: NymiHandle, scheme: SignatureScheme) -> Result<(), NclError> {
        self.issue(handle, Command::CreateSigKeyPair { scheme })
    }

    /// Signs `message` with a key pair created on this band.
    pub fn sign(&self, handle: NymiHandle, vk_id: VkId, message: Message) -> Result<(), NclError> {
        self.issue(handle, Command::Sign { vk_id, message })
    }

    /// Creates a key pair usable by anyone holding the partner credential.
    pub fn create_global_sig_key_pair(
        &self,
        handle: NymiHandle,
        partner_public_key: PartnerPublicKey,
        vendor_signature: Sig,
    ) -> Result<(), NclError> {
        self.issue(
            handle,
            Command::CreateGlobalSigKeyPair {
                partner_public_key,
                vendor_signature,
            },
        )
    }

    /// Last advertisement of a found or detected band, for
    /// [`ncl_core::sign_advertisement`].
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`]; [`NclError::WrongState`] if the band was
    /// not found or detected, or the transport kept no advertisement.
    pub fn advertisement(&self, handle: NymiHandle) -> Result<Adv, NclError> {
        let result = self.runtime().and_then(|runtime| {
            let identity = lock(&runtime.negotiator).advertisement_target(handle)?;
            self.shared
                .transport
                .advertisement(identity)
                .ok_or_else(|| NclError::wrong_state("advertisement", format!("no advertisement recorded for {handle}")))
        });
        self.settle("advertisement", result)
    }

    /// Signs with the band's global key pair.  A found band that is not
    /// connected is connected first.
    pub fn global_sign(
        &self,
        handle: NymiHandle,
        adv_sig: Sig,
        partner_public_key: PartnerPublicKey,
        message: Message,
    ) -> Result<(), NclError> {
        self.issue(
            handle,
            Command::GlobalSign {
                adv_sig,
                partner_public_key,
                message,
            },
        )
    }

    /// Creates a symmetric key on the band.  Answered by [`NclEvent::CreatedSk`].
    pub fn create_sk(&self, handle: NymiHandle) -> Result<(), NclError> {
        self.issue(handle, Command::CreateSk)
    }

    pub fn get_sk(&self, handle: NymiHandle, id: SkId) -> Result<(), NclError> {
        self.issue(handle, Command::GetSk { id })
    }

    /// Asks for band-generated random bytes.  Answered by [`NclEvent::Prg`].
    pub fn prg(&self, handle: NymiHandle) -> Result<(), NclError> {
        self.issue(handle, Command::Prg)
    }

    pub fn firmware_version(&self, handle: NymiHandle) -> Result<(), NclError> {
        self.issue(handle, Command::FirmwareVersion)
    }

    /// Asks a connected band for a signal strength reading.  Not arbitrated:
    /// may be repeated freely and may never be answered.
    ///
    /// # Errors
    ///
    /// [`NclError::InvalidHandle`]; [`NclError::WrongState`] if not connected.
    pub fn get_rssi(&self, handle: NymiHandle) -> Result<(), NclError> {
        let result = self.runtime().and_then(|runtime| {
            let identity = lock(&runtime.negotiator).rssi_target(handle)?;
            self.shared.transport.request_rssi(identity).map_err(NclError::from)
        });
        self.settle("get_rssi", result)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn runtime(&self) -> Result<Arc<Runtime>, NclError> {
        lock(&self.shared.runtime).clone().ok_or(NclError::NotInitialized)
    }

    /// Detaches `runtime` if it is still the active one.
    fn detach(&self, runtime: &Arc<Runtime>) -> bool {
        let mut slot = lock(&self.shared.runtime);
        if slot.as_ref().is_some_and(|active| Arc::ptr_eq(active, runtime)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Records a failed call in the latch, the error sink, and the log.
    fn settle<T>(&self, operation: &'static str, result: Result<T, NclError>) -> Result<T, NclError> {
        if let Err(err) = &result {
            self.shared.offer(err.code());
            if let Ok(runtime) = self.runtime() {
                lock(&runtime.sink).line(&format!("{operation} failed: {err}"));
            }
            debug!(session = %self.shared.id, operation, error = %err, "call failed");
        }
        result
    }

    fn issue(&self, handle: NymiHandle, command: Command) -> Result<(), NclError> {
        let operation = command.name();
        let result = self.runtime().and_then(|runtime| self.admit(&runtime, handle, command));
        self.settle(operation, result)
    }

    fn admit(&self, runtime: &Runtime, handle: NymiHandle, command: Command) -> Result<(), NclError> {
        let action = lock(&runtime.negotiator).request(handle, command)?;
        self.launch(runtime, action)
    }

    /// Starts an admitted request, undoing the admission if the transport
    /// refuses it.
    fn launch(&self, runtime: &Runtime, action: TransportAction) -> Result<(), NclError> {
        let claim = match &action {
            TransportAction::Connect { handle, ticket, .. } | TransportAction::Send { handle, ticket, .. } => {
                Some((*handle, *ticket))
            }
            TransportAction::Disconnect { .. } => None,
        };
        if let Err(err) = self.perform(&action) {
            if let Some((handle, ticket)) = claim {
                lock(&runtime.negotiator).abandon(handle, ticket);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn perform(&self, action: &TransportAction) -> Result<(), TransportError> {
        let transport = &self.shared.transport;
        match action {
            TransportAction::Connect { identity, params, .. } => transport.connect(*identity, *params),
            TransportAction::Send {
                identity,
                ticket,
                opcode,
                payload,
                ..
            } => transport.send_command(*identity, *ticket, *opcode, payload),
            TransportAction::Disconnect { identity, .. } => transport.disconnect(*identity),
        }
    }

    /// Applies one transport event and dispatches what it produced.
    fn process(&self, event: TransportEvent) {
        let Ok(runtime) = self.runtime() else {
            trace!("event after finish dropped");
            return;
        };
        let transition = lock(&runtime.negotiator).apply(event);
        let mut events = transition.events;
        for action in transition.actions {
            self.follow_up(&runtime, action, &mut events);
        }
        for event in &events {
            self.dispatch(&runtime, event);
        }
    }

    /// Performs work decided while applying an event.  Failures become error
    /// events and unwind the band.
    fn follow_up(&self, runtime: &Runtime, action: TransportAction, events: &mut Vec<NclEvent>) {
        let Err(err) = self.perform(&action) else {
            return;
        };
        let err = NclError::from(err);
        warn!(error = %err, ?action, "transport refused follow-up work");
        events.push(NclEvent::Error { code: err.code() });
        match action {
            TransportAction::Send { handle, ticket, .. } => {
                let next = lock(&runtime.negotiator).send_failed(handle, ticket);
                if let Some(next) = next {
                    self.follow_up(runtime, next, events);
                }
            }
            TransportAction::Disconnect { identity, .. } => {
                // The link cannot be closed cleanly; treat it as lost.
                let lost = lock(&runtime.negotiator).apply(TransportEvent::Disconnected {
                    identity,
                    reason: DisconnectionReason::Failure,
                });
                events.extend(lost.events);
            }
            TransportAction::Connect { handle, ticket, .. } => {
                lock(&runtime.negotiator).abandon(handle, ticket);
            }
        }
    }

    /// Hands `event` to every matching behavior, in registration order.
    fn dispatch(&self, runtime: &Runtime, event: &NclEvent) {
        if let NclEvent::Error { code } = event {
            self.shared.offer(*code);
            lock(&runtime.sink).line(&format!("error event: {code}"));
        }
        let behaviors = lock(&runtime.behaviors).matching(event);
        trace!(kind = ?event.kind(), handle = ?event.handle(), behaviors = behaviors.len(), "dispatching");
        for behavior in behaviors {
            (behavior.callback)(self, event, &behavior.user_data);
        }
    }
}

/// Dispatch-thread entry point.  Holds the session only while one event is
/// processed so that dropping the last [`Ncl`] still finishes the session.
fn deliver(session: &Weak<Shared>, event: TransportEvent) {
    if let Some(shared) = session.upgrade() {
        Ncl { shared }.process(event);
    }
}

fn expectation(info: &NclInfo) -> &'static str {
    match (info.transport, info.scan) {
        (Some(TransportStatus::Opening), _) => "waiting for the transport to open",
        (Some(TransportStatus::Failed), _) => "transport failed; call finish and init again",
        (_, Some(ScanKind::Discovery)) => "discovering bands in provisioning mode",
        (_, Some(ScanKind::Finding)) => "finding provisioned bands",
        _ if info.connected > 0 => "bands connected; issue commands or disconnect",
        _ => "ready; start discovery or finding",
    }
}
