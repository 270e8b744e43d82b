//! The commands a peer can send to control the acquisition.
//!
//! A command datagram carries an ASCII token, either bare (terminated by the end of the datagram
//! or by a NUL byte) or prefixed with a length byte. A prefix is recognized by its value being
//! below 0x20, which no token character can be. The declared length is only trusted after checking
//! it against the number of bytes that were actually received.

use crate::error::{Error, Result};
use log::debug;

/// The longest token that is copied for matching. Longer payloads can't be a known command.
pub const MAX_COMMAND_LEN: usize = 16;

/// Any byte below this value at the start of a payload is a length prefix.
const PREFIX_LIMIT: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the acquisition.
    Start,
    /// Stop the acquisition and close the telemetry session.
    Finish,
}

impl Command {
    /// Interprets a received datagram's payload.
    ///
    /// Returns [Error::UnrecognizedCommand] for anything that isn't exactly one of the known
    /// tokens, including a length prefix that claims more bytes than were received.
    pub fn parse(payload: &[u8]) -> Result<Command> {
        let token = match payload.first() {
            Some(&declared) if declared < PREFIX_LIMIT => {
                let body = &payload[1..];
                let declared = declared as usize;
                if declared > body.len() {
                    debug!(
                        "Command declares {declared} bytes but only {} were received",
                        body.len()
                    );
                    return Err(Error::UnrecognizedCommand);
                }
                &body[..declared]
            }
            _ => payload,
        };
        // Like a C string, the token ends at the first NUL byte, if any.
        let token = match token.iter().position(|&b| b == 0) {
            Some(end) => &token[..end],
            None => token,
        };

        let mut local = heapless::Vec::<u8, MAX_COMMAND_LEN>::new();
        local
            .extend_from_slice(token)
            .map_err(|_| Error::UnrecognizedCommand)?;
        match local.as_slice() {
            b"start" => Ok(Command::Start),
            b"finish" => Ok(Command::Finish),
            _ => Err(Error::UnrecognizedCommand),
        }
    }
}
