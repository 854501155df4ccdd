//! Command channel arbiter: the single command slot every band carries.
//!
//! A privileged request is admitted only if, in this order:
//!
//! 1. the band exists (checked by the registry),
//! 2. the band's link is in the shape the command needs,
//! 3. the band is in the negotiation state the command needs,
//! 4. the slot is free.
//!
//! Admission stamps the slot with a fresh [`CommandTicket`].  The slot is
//! released exactly once: when the completion carrying that ticket is turned
//! into an event, when the band disconnects, or when the transport refuses
//! the request outright.
//!
//! RSSI requests never touch the slot.

use ncl_core::{Command, CommandTicket, NclError, TicketCounter};
use tracing::debug;

use crate::application::negotiation::NegotiationState;
use crate::application::registry::{DeviceRecord, LinkStatus};

/// Claim state of a band's command slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommandSlot {
    #[default]
    Free,
    Busy(InFlight),
}

impl CommandSlot {
    pub fn is_busy(&self) -> bool {
        matches!(self, CommandSlot::Busy(_))
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        match self {
            CommandSlot::Busy(in_flight) => Some(in_flight),
            CommandSlot::Free => None,
        }
    }
}

/// Where an admitted command is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The link is being opened; the command is sent once it is up.
    AwaitingConnection,
    /// The command was handed to the transport.
    AwaitingCompletion,
}

/// The command holding a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub ticket: CommandTicket,
    pub command: Command,
    pub phase: Phase,
    /// Negotiation state at admission, restored when the command fails.
    pub prior_state: NegotiationState,
    /// The command opened the link itself.
    pub opened_link: bool,
}

/// Admits commands and hands out tickets.
#[derive(Debug, Default)]
pub struct CommandArbiter {
    tickets: TicketCounter,
}

impl CommandArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the preconditions of `command` and claims the slot of `record`.
    ///
    /// # Errors
    ///
    /// - [`NclError::WrongState`] if the link or negotiation state does not allow `command`.
    /// - [`NclError::Busy`] if another command holds the slot.
    pub fn claim(&self, record: &mut DeviceRecord, command: Command) -> Result<(CommandTicket, Phase), NclError> {
        let phase = admission(record, &command)?;
        if let CommandSlot::Busy(in_flight) = &record.slot {
            return Err(NclError::Busy(format!(
                "{} is running {} ({})",
                record.handle,
                in_flight.command.name(),
                in_flight.ticket
            )));
        }

        let ticket = self.tickets.next();
        debug!(handle = %record.handle, %ticket, command = command.name(), ?phase, "slot claimed");
        record.slot = CommandSlot::Busy(InFlight {
            ticket,
            command,
            phase,
            prior_state: record.state,
            opened_link: phase == Phase::AwaitingConnection,
        });
        Ok((ticket, phase))
    }

    /// Frees the slot if `ticket` is its current claim.
    pub fn release(record: &mut DeviceRecord, ticket: CommandTicket) -> Option<InFlight> {
        match &record.slot {
            CommandSlot::Busy(in_flight) if in_flight.ticket == ticket => Self::force_release(record),
            _ => None,
        }
    }

    /// Frees the slot whatever holds it.
    pub fn force_release(record: &mut DeviceRecord) -> Option<InFlight> {
        match std::mem::take(&mut record.slot) {
            CommandSlot::Busy(in_flight) => {
                debug!(handle = %record.handle, ticket = %in_flight.ticket, command = in_flight.command.name(), "slot released");
                Some(in_flight)
            }
            CommandSlot::Free => None,
        }
    }
}

/// Decides whether `command` may run on `record`, and how it starts.
fn admission(record: &DeviceRecord, command: &Command) -> Result<Phase, NclError> {
    let operation = command.name();
    match command {
        Command::Agree => require_unlinked(record, operation, NegotiationState::Discovered),
        Command::Validate { .. } => require_unlinked(record, operation, NegotiationState::Found),
        Command::Provision { .. } => require_linked(record, operation, NegotiationState::Agreed),
        Command::GlobalSign { .. } => match record.link {
            LinkStatus::Connected => require_linked(record, operation, NegotiationState::Validated),
            LinkStatus::Idle if record.advertised => Ok(Phase::AwaitingConnection),
            _ => Err(NclError::wrong_state(
                operation,
                format!("{} was neither found nor validated ({}, {:?})", record.handle, record.state, record.link),
            )),
        },
        Command::Sign { vk_id, .. } => {
            let phase = require_linked(record, operation, NegotiationState::Validated)?;
            if !record.verification_keys.contains(vk_id) {
                return Err(NclError::wrong_state(
                    operation,
                    format!("no signature key pair with that id was created on {}", record.handle),
                ));
            }
            Ok(phase)
        }
        _ => require_linked(record, operation, NegotiationState::Validated),
    }
}

fn require_unlinked(record: &DeviceRecord, operation: &'static str, needed: NegotiationState) -> Result<Phase, NclError> {
    if record.link.is_linked() {
        return Err(NclError::wrong_state(
            operation,
            format!("{} is already linked ({:?})", record.handle, record.link),
        ));
    }
    require_state(record, operation, needed)?;
    Ok(Phase::AwaitingConnection)
}

fn require_linked(record: &DeviceRecord, operation: &'static str, needed: NegotiationState) -> Result<Phase, NclError> {
    if record.link != LinkStatus::Connected {
        return Err(NclError::wrong_state(
            operation,
            format!("{} is not connected ({:?})", record.handle, record.link),
        ));
    }
    require_state(record, operation, needed)?;
    Ok(Phase::AwaitingCompletion)
}

fn require_state(record: &DeviceRecord, operation: &'static str, needed: NegotiationState) -> Result<(), NclError> {
    if record.state == needed {
        Ok(())
    } else {
        Err(NclError::wrong_state(
            operation,
            format!("{} is {}, needs {}", record.handle, record.state, needed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::registry::DeviceRegistry;
    use ncl_core::{DeviceIdentity, NymiHandle, SignatureScheme};

    fn record(state: NegotiationState, link: LinkStatus) -> DeviceRecord {
        let mut registry = DeviceRegistry::new();
        let record = registry.entry(DeviceIdentity::new([1, 2, 3, 4, 5, 6]));
        record.state = state;
        record.link = link;
        record.clone()
    }

    #[test]
    fn test_claim_marks_slot_busy_with_ticket() {
        // Arrange
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Connected);

        // Act
        let (ticket, phase) = arbiter.claim(&mut band, Command::Prg).expect("admitted");

        // Assert
        assert_eq!(phase, Phase::AwaitingCompletion);
        assert_eq!(band.slot.in_flight().map(|f| f.ticket), Some(ticket));
    }

    #[test]
    fn test_second_claim_while_busy_fails_busy() {
        // Arrange
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Connected);
        let (first, _) = arbiter.claim(&mut band, Command::Prg).expect("admitted");

        // Act
        let second = arbiter.claim(&mut band, Command::Notify { good: true });

        // Assert
        assert!(matches!(second, Err(NclError::Busy(_))));
        assert_eq!(band.slot.in_flight().map(|f| f.ticket), Some(first), "first claim untouched");
    }

    #[test]
    fn test_privileged_command_requires_connection() {
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Idle);
        let result = arbiter.claim(&mut band, Command::FirmwareVersion);
        assert!(matches!(result, Err(NclError::WrongState { .. })));
        assert!(!band.slot.is_busy());
    }

    #[test]
    fn test_provision_requires_agreed() {
        // Arrange
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Connected);

        // Act
        let result = arbiter.claim(
            &mut band,
            Command::Provision {
                strong: false,
                nea_name: "app".to_string(),
            },
        );

        // Assert
        assert!(matches!(result, Err(NclError::WrongState { operation: "provision", .. })));
    }

    #[test]
    fn test_wrong_state_is_reported_before_busy() {
        // Arrange – slot busy and band not agreed
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Connected);
        arbiter.claim(&mut band, Command::Prg).expect("admitted");

        // Act
        let result = arbiter.claim(
            &mut band,
            Command::Provision {
                strong: true,
                nea_name: "app".to_string(),
            },
        );

        // Assert
        assert!(matches!(result, Err(NclError::WrongState { .. })));
    }

    #[test]
    fn test_agree_requires_unlinked_discovered_band() {
        let arbiter = CommandArbiter::new();

        let mut linked = record(NegotiationState::Discovered, LinkStatus::Connected);
        assert!(matches!(arbiter.claim(&mut linked, Command::Agree), Err(NclError::WrongState { .. })));

        let mut found = record(NegotiationState::Found, LinkStatus::Idle);
        assert!(matches!(arbiter.claim(&mut found, Command::Agree), Err(NclError::WrongState { .. })));

        let mut discovered = record(NegotiationState::Discovered, LinkStatus::Idle);
        let (_, phase) = arbiter.claim(&mut discovered, Command::Agree).expect("admitted");
        assert_eq!(phase, Phase::AwaitingConnection);
        assert!(discovered.slot.in_flight().is_some_and(|f| f.opened_link));
    }

    #[test]
    fn test_sign_requires_key_pair_created_on_band() {
        // Arrange
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Connected);
        let sign = Command::Sign {
            vk_id: [9; 16],
            message: [0; 16],
        };

        // Act
        let before = arbiter.claim(&mut band, sign.clone());
        band.verification_keys.push([9; 16]);
        let after = arbiter.claim(&mut band, sign);

        // Assert
        assert!(matches!(before, Err(NclError::WrongState { operation: "sign", .. })));
        assert!(after.is_ok());
    }

    #[test]
    fn test_global_sign_connects_for_found_band() {
        // Arrange
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Found, LinkStatus::Idle);
        band.advertised = true;
        let command = Command::GlobalSign {
            adv_sig: [1; 64],
            partner_public_key: [2; 64],
            message: [3; 16],
        };

        // Act
        let (_, phase) = arbiter.claim(&mut band, command).expect("admitted");

        // Assert
        assert_eq!(phase, Phase::AwaitingConnection);
    }

    #[test]
    fn test_release_ignores_stale_ticket() {
        // Arrange
        let arbiter = CommandArbiter::new();
        let mut band = record(NegotiationState::Validated, LinkStatus::Connected);
        let (ticket, _) = arbiter
            .claim(
                &mut band,
                Command::CreateSigKeyPair {
                    scheme: SignatureScheme::NistP256,
                },
            )
            .expect("admitted");

        // Act
        let stale = CommandArbiter::release(&mut band, CommandTicket::new(ticket.raw() + 100));
        let current = CommandArbiter::release(&mut band, ticket);
        let twice = CommandArbiter::release(&mut band, ticket);

        // Assert
        assert!(stale.is_none());
        assert!(current.is_some());
        assert!(twice.is_none(), "a slot is released exactly once");
        assert_eq!(band.handle, NymiHandle::new(0));
    }
}
