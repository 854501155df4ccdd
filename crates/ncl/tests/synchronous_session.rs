//! Integration tests for a session in synchronous mode.
//!
//! These tests drive [`Ncl`] through its public API against the
//! [`SimulatedTransport`], pumping events with `update` the way a
//! single-threaded application would.  They cover:
//!
//! - The provisioning track: discovery, agreement, provisioning.
//! - The validation track: finding with stored provisions, validation, and
//!   privileged commands.
//! - Arbitration: one command in flight per band, disconnection dropping the
//!   pending completion.
//! - Behaviors: registration order, duplicates, exact removal.
//! - Error reporting: immediate failures, error events, the latch, the sink.
//!
//! The simulated radio answers links and disconnections on its own; command
//! completions are scripted with `respond` / `reject`.

use std::io::Write;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use ncl::infrastructure::transport::{SimulatedTransport, TransportCall};
use ncl::{
    callback, ConnectionParams, DisconnectionReason, DrainOutcome, ErrorCode, EventFilter, EventKind,
    HandleFilter, LinkStatus, Ncl, NclError, NclEvent, NclMode, NegotiationState, NymiHandle, Provision,
    ProvisionMatch, SignatureScheme, UserData,
};
use ncl_core::{CommandResponse, DeviceIdentity, Opcode};

const BAND_A: DeviceIdentity = DeviceIdentity::new([0xA0, 0, 0, 0, 0, 1]);
const BAND_B: DeviceIdentity = DeviceIdentity::new([0xB0, 0, 0, 0, 0, 2]);
const BAND_C: DeviceIdentity = DeviceIdentity::new([0xC0, 0, 0, 0, 0, 3]);

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    ncl: Ncl,
    sim: Arc<SimulatedTransport>,
    events: Arc<Mutex<Vec<NclEvent>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_sink(None)
    }

    fn with_sink(error_sink: Option<Box<dyn Write + Send>>) -> Self {
        let sim = Arc::new(SimulatedTransport::new());
        let ncl = Ncl::new(Arc::clone(&sim) as Arc<dyn ncl::NymiTransport>);
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let events = Arc::clone(&events);
            callback(move |_, event, _| events.lock().unwrap().push(event.clone()))
        };
        ncl.init(recorder, UserData::none(), "door-lock", NclMode::SYNCHRONOUS, error_sink)
            .expect("init");
        let harness = Self { ncl, sim, events };
        assert_eq!(harness.pump(), vec![NclEvent::Init { success: true }]);
        harness
    }

    /// Processes everything queued and returns the events delivered.
    fn pump(&self) -> Vec<NclEvent> {
        self.ncl.update(Duration::ZERO).expect("update");
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Completes the most recent command with `response`.
    fn complete(&self, identity: DeviceIdentity, response: CommandResponse) {
        let (_, ticket, _) = self.sim.last_command().expect("a command was sent");
        self.sim.respond(identity, ticket, &response);
    }

    fn discover(&self, identity: DeviceIdentity) -> NymiHandle {
        self.ncl.start_discovery().expect("start discovery");
        self.sim.advertise(identity, -45, None);
        let handle = match self.pump().as_slice() {
            [NclEvent::Discovery { handle, .. }] => *handle,
            other => panic!("expected one discovery, got {other:?}"),
        };
        self.ncl.stop_scan().expect("stop scan");
        handle
    }

    fn find(&self, identity: DeviceIdentity, provision: &Provision) -> NymiHandle {
        self.ncl
            .start_finding(std::slice::from_ref(provision), false)
            .expect("start finding");
        self.sim.advertise(
            identity,
            -40,
            Some(ProvisionMatch {
                provision_id: provision.id,
                strong: false,
            }),
        );
        let handle = match self.pump().as_slice() {
            [NclEvent::Find { handle, .. }] => *handle,
            other => panic!("expected one find, got {other:?}"),
        };
        self.ncl.stop_scan().expect("stop scan");
        handle
    }

    fn validated(&self, identity: DeviceIdentity) -> NymiHandle {
        let handle = self.find(identity, &provision(1, false));
        self.ncl.validate(handle).expect("validate");
        assert!(self.pump().is_empty(), "link up produces no event");
        self.complete(identity, CommandResponse::Validated);
        assert_eq!(self.pump(), vec![NclEvent::Validation { handle }]);
        handle
    }
}

fn provision(id: u8, strong: bool) -> Provision {
    Provision {
        key: [id.wrapping_mul(3); 16],
        id: [id; 16],
        strong,
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

// ── Discovery and provisioning ────────────────────────────────────────────────

#[test]
fn test_repeated_advertisements_produce_one_discovery() {
    // Arrange
    let harness = Harness::new();
    harness.ncl.start_discovery().unwrap();

    // Act
    for _ in 0..5 {
        harness.sim.advertise(BAND_A, -50, None);
    }
    let events = harness.pump();

    // Assert
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], NclEvent::Discovery { rssi: -50, .. }));
}

#[test]
fn test_second_scan_while_scanning_is_busy() {
    let harness = Harness::new();
    harness.ncl.start_discovery().unwrap();
    let result = harness.ncl.start_finding(&[provision(1, false)], false);
    assert!(matches!(result, Err(NclError::Busy(_))));
    harness.ncl.stop_scan().unwrap();
    harness.ncl.stop_scan().unwrap();
}

#[test]
fn test_agree_then_provision_yields_provision_record() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.discover(BAND_A);

    // Act – agreement
    harness.ncl.agree(handle).unwrap();
    assert!(harness.pump().is_empty());
    assert_eq!(harness.sim.last_command().map(|c| c.2), Some(Opcode::Agree));
    let leds = [[true, false, true, false, true]];
    harness.complete(BAND_A, CommandResponse::Agreed { leds });
    let agreement = harness.pump();

    // Act – provisioning
    harness.ncl.provision(handle, true).unwrap();
    harness.complete(
        BAND_A,
        CommandResponse::Provisioned {
            key: [7; 16],
            id: [8; 16],
        },
    );
    let provisioned = harness.pump();

    // Assert
    assert_eq!(agreement, vec![NclEvent::Agreement { handle, leds }]);
    assert_eq!(
        provisioned,
        vec![NclEvent::Provision {
            handle,
            provision: Provision {
                key: [7; 16],
                id: [8; 16],
                strong: true,
            },
        }]
    );
    assert_eq!(harness.ncl.device(handle).unwrap().state, NegotiationState::Provisioned);
}

#[test]
fn test_provision_before_agreement_is_wrong_state_without_event() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.discover(BAND_A);

    // Act
    let result = harness.ncl.provision(handle, false);

    // Assert
    assert!(matches!(result, Err(NclError::WrongState { operation: "provision", .. })));
    assert!(harness.pump().is_empty());
    assert_eq!(harness.ncl.take_error_code(), ErrorCode::WrongState);
}

#[test]
fn test_rejected_agreement_reports_error_then_disconnects() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.discover(BAND_A);
    harness.ncl.agree(handle).unwrap();
    harness.pump();
    let (_, ticket, _) = harness.sim.last_command().unwrap();

    // Act
    harness.sim.reject(BAND_A, ticket, Opcode::Agree, ErrorCode::NymiFailed);
    let failure = harness.pump();
    let teardown = harness.pump();

    // Assert
    assert_eq!(failure, vec![NclEvent::Error { code: ErrorCode::NymiFailed }]);
    assert_eq!(
        teardown,
        vec![NclEvent::Disconnection {
            handle,
            reason: DisconnectionReason::Local
        }]
    );
    assert_eq!(harness.ncl.take_error_code(), ErrorCode::NymiFailed);
}

#[test]
fn test_refused_connection_reports_disconnection_with_reason() {
    // Arrange
    let sim = Arc::new(SimulatedTransport::manual());
    let ncl = Ncl::new(Arc::clone(&sim) as Arc<dyn ncl::NymiTransport>);
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let events = Arc::clone(&events);
        callback(move |_, event, _| events.lock().unwrap().push(event.clone()))
    };
    ncl.init(recorder, UserData::none(), "door-lock", NclMode::SYNCHRONOUS, None)
        .unwrap();
    ncl.start_discovery().unwrap();
    sim.advertise(BAND_A, -70, None);
    ncl.update(Duration::ZERO).unwrap();
    let handle = NymiHandle::new(0);
    ncl.agree(handle).unwrap();

    // Act
    sim.refuse_connection(BAND_A, DisconnectionReason::ConnectionTimeout);
    ncl.update(Duration::ZERO).unwrap();

    // Assert
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&NclEvent::Disconnection {
            handle,
            reason: DisconnectionReason::ConnectionTimeout
        })
    );
    assert_eq!(ncl.device(handle).unwrap().state, NegotiationState::Disconnected);
    ncl.finish().unwrap();
}

// ── Finding and validation ────────────────────────────────────────────────────

#[test]
fn test_finding_reports_only_stored_provisions() {
    // Arrange
    let harness = Harness::new();
    let (weak, strong) = (provision(1, false), provision(2, true));
    harness
        .ncl
        .start_finding(&[weak.clone(), strong.clone()], false)
        .unwrap();

    // Act
    harness.sim.advertise(
        BAND_A,
        -40,
        Some(ProvisionMatch {
            provision_id: weak.id,
            strong: true,
        }),
    );
    harness.sim.advertise(
        BAND_B,
        -41,
        Some(ProvisionMatch {
            provision_id: [0x99; 16],
            strong: true,
        }),
    );
    harness.sim.advertise(BAND_C, -42, None);
    harness.sim.advertise(
        BAND_C,
        -42,
        Some(ProvisionMatch {
            provision_id: strong.id,
            strong: true,
        }),
    );
    let events = harness.pump();

    // Assert – strong only when both the radio and the provision allow it
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        NclEvent::Find { provision_id, strong: false, .. } if *provision_id == weak.id
    ));
    assert!(matches!(
        &events[1],
        NclEvent::Find { provision_id, strong: true, .. } if *provision_id == strong.id
    ));
}

#[test]
fn test_detection_reports_unmatched_bands_when_enabled() {
    // Arrange
    let harness = Harness::new();
    harness.ncl.start_finding(&[provision(1, false)], true).unwrap();

    // Act
    harness.sim.advertise(BAND_B, -60, None);
    harness.sim.advertise(BAND_B, -61, None);
    let events = harness.pump();

    // Assert
    assert_eq!(events.len(), 1);
    let handle = events[0].handle().unwrap();
    assert_eq!(events[0], NclEvent::Detection { handle, rssi: -60 });
    assert_eq!(harness.ncl.device(handle).unwrap().state, NegotiationState::Detected);
}

#[test]
fn test_validated_band_signs_with_its_own_key_pair() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);

    // Act – create a key pair
    harness
        .ncl
        .create_sig_key_pair(handle, SignatureScheme::NistP256)
        .unwrap();
    harness.complete(
        BAND_A,
        CommandResponse::Vk {
            id: [5; 16],
            vk: [6; 64],
        },
    );
    let created = harness.pump();
    let unknown_key = harness.ncl.sign(handle, [9; 16], [1; 16]);
    harness.ncl.sign(handle, [5; 16], [1; 16]).unwrap();
    harness.complete(BAND_A, CommandResponse::Sig { sig: [4; 64] });
    let signed = harness.pump();

    // Assert
    assert_eq!(
        created,
        vec![NclEvent::Vk {
            handle,
            id: [5; 16],
            vk: [6; 64]
        }]
    );
    assert!(matches!(unknown_key, Err(NclError::WrongState { .. })));
    assert_eq!(signed, vec![NclEvent::Sig { handle, sig: [4; 64] }]);
}

#[test]
fn test_global_sign_connects_a_found_band_first() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.find(BAND_A, &provision(1, false));

    // Act
    harness.ncl.global_sign(handle, [1; 64], [2; 64], [3; 16]).unwrap();
    harness.pump();
    harness.complete(
        BAND_A,
        CommandResponse::GlobalSig {
            vk_id: [8; 16],
            sig: [9; 64],
        },
    );
    let events = harness.pump();

    // Assert
    let calls = harness.sim.calls();
    assert!(calls.iter().any(|call| matches!(call, TransportCall::Connect { identity, .. } if *identity == BAND_A)));
    assert_eq!(harness.sim.last_command().map(|c| c.2), Some(Opcode::GlobalSign));
    assert_eq!(
        events,
        vec![NclEvent::GlobalSig {
            handle,
            vk_id: [8; 16],
            sig: [9; 64]
        }]
    );
}

#[test]
fn test_advertisement_requires_a_found_band() {
    // Arrange
    let harness = Harness::new();
    let discovered = harness.discover(BAND_B);
    let found = harness.find(BAND_A, &provision(1, false));
    harness.sim.set_advertisement(BAND_A, [4; 16]);

    // Act / Assert
    assert_eq!(harness.ncl.advertisement(found), Ok([4; 16]));
    assert!(matches!(
        harness.ncl.advertisement(discovered),
        Err(NclError::WrongState { .. })
    ));
}

// ── Arbitration ───────────────────────────────────────────────────────────────

#[test]
fn test_second_command_while_busy_fails_immediately() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);
    let sent_before = harness.sim.commands_sent();

    // Act
    harness.ncl.prg(handle).unwrap();
    let second = harness.ncl.create_sk(handle);

    // Assert
    assert!(matches!(second, Err(NclError::Busy(_))));
    assert_eq!(harness.sim.commands_sent(), sent_before + 1);
    assert!(harness.pump().is_empty());
    assert!(harness.ncl.device(handle).unwrap().busy);
}

#[test]
fn test_racing_commands_on_one_band_admit_exactly_one() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);

    for round in 0..100 {
        // Act
        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let ncl = harness.ncl.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ncl.prg(handle)
                })
            })
            .collect();
        let results: Vec<_> = racers.into_iter().map(|racer| racer.join().unwrap()).collect();

        // Assert
        let admitted = results.iter().filter(|result| result.is_ok()).count();
        let refused = results
            .iter()
            .filter(|result| matches!(result, Err(NclError::Busy(_))))
            .count();
        assert_eq!((admitted, refused), (1, 1), "round {round}: {results:?}");

        harness.complete(BAND_A, CommandResponse::Prg { value: [round as u8; 16] });
        assert_eq!(
            harness.pump(),
            vec![NclEvent::Prg {
                handle,
                value: [round as u8; 16]
            }]
        );
    }
    assert_eq!(harness.ncl.take_error_code(), ErrorCode::Busy);
}

#[test]
fn test_slot_is_free_when_completion_is_delivered() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);
    let ncl = harness.ncl.clone();
    let busy_seen = Arc::new(Mutex::new(None));
    {
        let busy_seen = Arc::clone(&busy_seen);
        harness
            .ncl
            .add_behavior(
                callback(move |session, _, _| {
                    *busy_seen.lock().unwrap() = Some(session.device(handle).unwrap().busy);
                }),
                UserData::none(),
                EventFilter::Only(EventKind::Prg),
                HandleFilter::Only(handle),
            )
            .unwrap();
    }

    // Act
    ncl.prg(handle).unwrap();
    harness.complete(BAND_A, CommandResponse::Prg { value: [0x5A; 16] });
    harness.pump();

    // Assert
    assert_eq!(*busy_seen.lock().unwrap(), Some(false));
}

#[test]
fn test_disconnect_drops_pending_completion() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);
    harness.ncl.prg(handle).unwrap();
    let (_, ticket, _) = harness.sim.last_command().unwrap();

    // Act
    harness.ncl.disconnect(handle).unwrap();
    harness.sim.respond(BAND_A, ticket, &CommandResponse::Prg { value: [1; 16] });
    let events = harness.pump();

    // Assert
    assert_eq!(
        events,
        vec![NclEvent::Disconnection {
            handle,
            reason: DisconnectionReason::Local
        }]
    );
    let snapshot = harness.ncl.device(handle).unwrap();
    assert!(!snapshot.busy);
    assert_eq!(snapshot.link, LinkStatus::Idle);
}

#[test]
fn test_rssi_requests_bypass_the_command_slot() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);
    harness.ncl.firmware_version(handle).unwrap();

    // Act
    harness.ncl.get_rssi(handle).unwrap();
    harness.ncl.get_rssi(handle).unwrap();
    let events = harness.pump();

    // Assert
    assert_eq!(
        events,
        vec![
            NclEvent::Rssi { handle, rssi: -40 },
            NclEvent::Rssi { handle, rssi: -40 }
        ]
    );
}

#[test]
fn test_remote_failure_is_error_event_and_frees_slot() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);
    harness.ncl.notify(handle, true).unwrap();
    let (_, ticket, _) = harness.sim.last_command().unwrap();

    // Act
    harness.sim.reject(BAND_A, ticket, Opcode::Notify, ErrorCode::LowBattery);
    let events = harness.pump();

    // Assert
    assert_eq!(events, vec![NclEvent::Error { code: ErrorCode::LowBattery }]);
    assert_eq!(harness.ncl.take_error_code(), ErrorCode::LowBattery);
    assert!(harness.ncl.prg(handle).is_ok(), "slot was freed by the failure");
    assert_eq!(harness.ncl.device(handle).unwrap().state, NegotiationState::Validated);
}

#[test]
fn test_ecg_samples_flow_only_while_streaming() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);
    harness.ncl.start_ecg_stream(handle).unwrap();
    harness.complete(BAND_A, CommandResponse::EcgStarted);
    assert_eq!(harness.pump(), vec![NclEvent::EcgStart { handle }]);

    // Act
    harness.sim.stream_ecg(BAND_A, [1, 2, 3, 4, 5]);
    let streaming = harness.pump();
    harness.ncl.stop_ecg_stream(handle).unwrap();
    harness.complete(BAND_A, CommandResponse::EcgStopped);
    let stopped = harness.pump();
    harness.sim.stream_ecg(BAND_A, [6, 7, 8, 9, 10]);
    let after = harness.pump();

    // Assert
    assert_eq!(
        streaming,
        vec![NclEvent::Ecg {
            handle,
            samples: [1, 2, 3, 4, 5]
        }]
    );
    assert_eq!(stopped, vec![NclEvent::EcgStop { handle }]);
    assert!(after.is_empty());
}

#[test]
fn test_unknown_handle_fails_every_operation_without_event() {
    let harness = Harness::new();
    let stranger = NymiHandle::new(42);
    assert_eq!(harness.ncl.agree(stranger), Err(NclError::InvalidHandle(stranger)));
    assert_eq!(harness.ncl.validate(stranger), Err(NclError::InvalidHandle(stranger)));
    assert_eq!(harness.ncl.prg(stranger), Err(NclError::InvalidHandle(stranger)));
    assert_eq!(harness.ncl.get_rssi(stranger), Err(NclError::InvalidHandle(stranger)));
    assert_eq!(harness.ncl.disconnect(stranger), Err(NclError::InvalidHandle(stranger)));
    assert!(harness.ncl.device(stranger).is_err());
    assert!(harness.pump().is_empty());
    assert_eq!(harness.ncl.take_error_code(), ErrorCode::InvalidHandle);
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[test]
fn test_clear_scanned_waits_for_links_to_close() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.validated(BAND_A);

    // Act
    let while_linked = harness.ncl.clear_scanned();
    harness.ncl.disconnect(handle).unwrap();
    harness.pump();
    let after = harness.ncl.clear_scanned();

    // Assert
    assert!(matches!(while_linked, Err(NclError::WrongState { .. })));
    assert!(after.is_ok());
    assert_eq!(harness.ncl.device(handle), Err(NclError::InvalidHandle(handle)));
    assert!(harness.ncl.connected().unwrap().is_empty());
}

#[test]
fn test_clear_scanned_during_discovery_reports_bands_again() {
    // Arrange
    let harness = Harness::new();
    harness.ncl.start_discovery().unwrap();
    harness.sim.advertise(BAND_A, -50, None);
    assert_eq!(harness.pump().len(), 1);

    // Act
    harness.ncl.clear_scanned().unwrap();
    harness.sim.advertise(BAND_A, -52, None);
    harness.sim.advertise(BAND_A, -52, None);
    let events = harness.pump();

    // Assert
    assert_eq!(events.len(), 1);
    let handle = match events[0] {
        NclEvent::Discovery { handle, rssi: -52 } => handle,
        ref other => panic!("expected a discovery, got {other:?}"),
    };
    assert_eq!(harness.ncl.device(handle).unwrap().state, NegotiationState::Discovered);
}

#[test]
fn test_connection_hints_apply_to_next_link() {
    // Arrange
    let harness = Harness::new();
    let handle = harness.discover(BAND_A);

    // Act
    let rejected = harness.ncl.hint_connection_params(20, 10, 300, 0);
    harness.ncl.hint_connection_params(24, 40, 400, 4).unwrap();
    harness.ncl.agree(handle).unwrap();

    // Assert
    assert!(matches!(rejected, Err(NclError::BadValue(_))));
    let expected = ConnectionParams {
        interval_min: 24,
        interval_max: 40,
        supervision_timeout: 400,
        latency: 4,
    };
    assert!(harness
        .sim
        .calls()
        .contains(&TransportCall::Connect {
            identity: BAND_A,
            params: expected
        }));
}

// ── Behaviors and delivery ────────────────────────────────────────────────────

#[test]
fn test_behaviors_fire_in_registration_order() {
    // Arrange
    let harness = Harness::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let label = |name: &'static str| {
        let order = Arc::clone(&order);
        callback(move |_, _, _| order.lock().unwrap().push(name))
    };
    let (first, second) = (label("first"), label("second"));
    let discovery = EventFilter::Only(EventKind::Discovery);
    harness
        .ncl
        .add_behavior(first.clone(), UserData::none(), discovery, HandleFilter::Any)
        .unwrap();
    harness
        .ncl
        .add_behavior(second, UserData::none(), discovery, HandleFilter::Any)
        .unwrap();

    // Act
    harness.discover(BAND_A);

    // Assert
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    let duplicate = harness
        .ncl
        .add_behavior(first.clone(), UserData::none(), discovery, HandleFilter::Any);
    assert!(matches!(duplicate, Err(NclError::BadValue(_))));
}

#[test]
fn test_remove_behavior_succeeds_exactly_once() {
    // Arrange
    let harness = Harness::new();
    let cb = callback(|_, _, _| {});
    let data = UserData::new("lock");
    harness
        .ncl
        .add_behavior(cb.clone(), data.clone(), EventFilter::Any, HandleFilter::Any)
        .unwrap();

    // Act
    let narrower = harness.ncl.remove_behavior(
        cb.clone(),
        data.clone(),
        EventFilter::Only(EventKind::Find),
        HandleFilter::Any,
    );
    let exact = harness
        .ncl
        .remove_behavior(cb.clone(), data.clone(), EventFilter::Any, HandleFilter::Any);
    let again = harness
        .ncl
        .remove_behavior(cb, data, EventFilter::Any, HandleFilter::Any);

    // Assert
    assert!(matches!(narrower, Err(NclError::BadValue(_))));
    assert!(exact.is_ok());
    assert!(matches!(again, Err(NclError::BadValue(_))));
}

#[test]
fn test_update_with_nothing_pending_returns_idle() {
    let harness = Harness::new();
    let outcome = harness.ncl.update(Duration::from_millis(20)).unwrap();
    assert_eq!(outcome, DrainOutcome::Idle);
    assert!(harness.events.lock().unwrap().is_empty());
}

#[test]
fn test_callback_can_drive_session_but_not_finish_or_update() {
    // Arrange
    let harness = Harness::new();
    let nested = Arc::new(Mutex::new(Vec::new()));
    {
        let nested = Arc::clone(&nested);
        harness
            .ncl
            .add_behavior(
                callback(move |session, event, _| {
                    let mut nested = nested.lock().unwrap();
                    nested.push(session.update(Duration::ZERO).map(|_| ()));
                    nested.push(session.finish());
                    nested.push(session.stop_scan());
                    nested.push(session.agree(event.handle().unwrap()));
                }),
                UserData::none(),
                EventFilter::Only(EventKind::Discovery),
                HandleFilter::Any,
            )
            .unwrap();
    }
    harness.ncl.start_discovery().unwrap();

    // Act
    harness.sim.advertise(BAND_A, -50, None);
    harness.pump();

    // Assert
    let nested = nested.lock().unwrap();
    assert!(matches!(nested[0], Err(NclError::WrongState { .. })));
    assert!(matches!(nested[1], Err(NclError::WrongState { .. })));
    assert!(nested[2].is_ok());
    assert!(nested[3].is_ok());
    assert!(harness.ncl.is_initialized());
}

// ── Lifecycle and error reporting ─────────────────────────────────────────────

#[test]
fn test_init_twice_fails_and_reinit_after_finish_works() {
    // Arrange
    let harness = Harness::new();

    // Act
    let again = harness
        .ncl
        .init(callback(|_, _, _| {}), UserData::none(), "door-lock", NclMode::SYNCHRONOUS, None);
    harness.ncl.finish().unwrap();
    let after_finish = harness.ncl.start_discovery();
    let reinit = harness
        .ncl
        .init(callback(|_, _, _| {}), UserData::none(), "door-lock", NclMode::SYNCHRONOUS, None);

    // Assert
    assert_eq!(again, Err(NclError::AlreadyInitialized));
    assert_eq!(after_finish, Err(NclError::NotInitialized));
    assert!(reinit.is_ok());
    assert_eq!(harness.ncl.finish(), Ok(()));
}

#[test]
fn test_finish_disconnects_linked_bands_and_closes_transport() {
    // Arrange
    let harness = Harness::new();
    harness.validated(BAND_A);
    harness.ncl.start_discovery().unwrap();

    // Act
    harness.ncl.finish().unwrap();

    // Assert
    let calls = harness.sim.calls();
    let tail = &calls[calls.len() - 3..];
    assert_eq!(
        tail,
        &[
            TransportCall::StopScan,
            TransportCall::Disconnect { identity: BAND_A },
            TransportCall::Close
        ]
    );
    assert!(!harness.sim.is_open());
}

#[test]
fn test_failures_are_written_to_the_error_sink() {
    // Arrange
    let buffer = SharedBuffer::default();
    let harness = Harness::with_sink(Some(Box::new(buffer.clone())));

    // Act
    let _ = harness.ncl.agree(NymiHandle::new(7));
    let lock = harness.ncl.lock_error_sink();
    let info = harness.ncl.info();

    // Assert
    let text = buffer.text();
    assert!(text.contains("agree failed"), "sink was: {text}");
    assert!(text.contains("lock_error_sink failed"), "sink was: {text}");
    assert!(text.contains("info requested"), "sink was: {text}");
    assert!(matches!(lock, Err(NclError::WrongState { .. })));
    assert!(info.initialized);
    assert_eq!(info.flavor, "simulated");
    assert_eq!(info.mode, Some(NclMode::SYNCHRONOUS));
}

#[test]
fn test_set_endpoint_only_before_init() {
    // Arrange
    let sim = Arc::new(SimulatedTransport::new());
    let ncl = Ncl::new(Arc::clone(&sim) as Arc<dyn ncl::NymiTransport>);
    ncl.set_endpoint("192.168.1.20", 9200).unwrap();

    // Act
    ncl.init(callback(|_, _, _| {}), UserData::none(), "door-lock", NclMode::SYNCHRONOUS, None)
        .unwrap();
    let late = ncl.set_endpoint("10.0.0.1", 9089);

    // Assert
    assert!(matches!(late, Err(NclError::WrongState { .. })));
    match sim.calls().first() {
        Some(TransportCall::Open(options)) => {
            assert_eq!(options.host, "192.168.1.20");
            assert_eq!(options.port, 9200);
            assert_eq!(options.nea_name, "door-lock");
        }
        other => panic!("expected open first, got {other:?}"),
    }
    ncl.finish().unwrap();
}
