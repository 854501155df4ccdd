//! Protocol module containing the command set, the response frame codec, and
//! the ticket counter.

pub mod codec;
pub mod command;
pub mod ticket;

pub use codec::{decode_frame, encode_frame, ProtocolError, ResponseFrame};
pub use command::{Command, CommandResponse, Opcode};
pub use ticket::{CommandTicket, TicketCounter};
