//! Wire protocol to the bridge: frame building and parsing, the ACK
//! handshake, and single command-response exchanges.
//!
//! One exchange is: header frame (`SOH` plus the two lengths), ACK,
//! data frame (`STX`, payload, `ETX`), ACK, response frame (`STX`,
//! response, `ETX`). The engine fails on the first violation and does
//! not retry; retry policy lives one layer up.

use std::fmt;
use std::time::Duration;

use crate::transport::Transport;
use crate::{poll_deadline, Error, Result};

/// Start of the header frame.
pub const SOH: u8 = 0x01;
/// Start of a data or response frame.
pub const STX: u8 = 0x02;
/// End of a data or response frame.
pub const ETX: u8 = 0x03;
/// Positive acknowledgement of a header or data frame.
pub const ACK: u8 = 0x06;
/// Bridge-side rejection of a header or data frame.
pub const NAK: u8 = 0x15;

/// Largest payload the reference bridge firmware will buffer.
pub const MAX_PAYLOAD: usize = 2048;

/// Per-probe read window while polling for the ACK byte.
const ACK_PROBE: Duration = Duration::from_millis(100);

/// Wall-clock limits for one exchange.
#[derive(Copy, Clone, Debug)]
pub struct Timeouts {
    /// Deadline for each frame write and for the response read.
    pub transfer: Duration,
    /// Shorter deadline for the single-byte ACK/NAK wait.
    pub ack: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            transfer: Duration::from_secs(20),
            ack: Duration::from_secs(10),
        }
    }
}

/// One command to run over the bridge: the bytes shifted out to the
/// flash and the number of response bytes shifted back in.
///
/// Immutable once built; constructed fresh per exchange.
#[derive(Clone, Debug)]
pub struct Command {
    payload: Vec<u8>,
    response_len: usize,
}

impl Command {
    /// Build a command, rejecting anything the bridge could not carry.
    pub fn new(payload: Vec<u8>, response_len: usize) -> Result<Command> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge { length: payload.len() });
        }
        if response_len > usize::from(u16::MAX) {
            return Err(Error::ResponseTooLarge { length: response_len });
        }
        Ok(Command { payload, response_len })
    }

    pub fn out_len(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn in_len(&self) -> u16 {
        self.response_len as u16
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn response_len(&self) -> usize {
        self.response_len
    }

    /// Opcode and address bytes, for diagnostics.
    pub fn opcode_bytes(&self) -> Vec<u8> {
        self.payload[..self.payload.len().min(4)].to_vec()
    }
}

/// The step of an exchange that failed, kept for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Header,
    HeaderAck,
    Data,
    DataAck,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Stage::Header => "header write",
            Stage::HeaderAck => "header acknowledge",
            Stage::Data => "data write",
            Stage::DataAck => "data acknowledge",
            Stage::Response => "response read",
        })
    }
}

/// Command engine: runs one framed exchange at a time over a transport.
pub struct Bridge<T> {
    transport: T,
    timeouts: Timeouts,
}

impl<T: Transport> Bridge<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        Bridge { transport, timeouts }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run one command-response exchange.
    ///
    /// Stale bytes left on the line by an abandoned exchange are
    /// discarded first. Fails at the first protocol violation, recording
    /// the stage and the command's opcode bytes.
    pub fn execute(&mut self, command: &Command) -> Result<Vec<u8>> {
        log::trace!(
            "exchange: out {:02X?} ({} bytes), in {} bytes",
            command.opcode_bytes(),
            command.out_len(),
            command.in_len()
        );
        self.transport.drain()?;
        let fail = |stage| Error::Exchange { stage, command: command.opcode_bytes() };
        if !self.send_header(command.out_len(), command.in_len())? {
            return Err(fail(Stage::Header));
        }
        if !self.await_ack()? {
            return Err(fail(Stage::HeaderAck));
        }
        if !self.send_data(command.payload())? {
            return Err(fail(Stage::Data));
        }
        if !self.await_ack()? {
            return Err(fail(Stage::DataAck));
        }
        match self.read_response(command.response_len())? {
            Some(response) => Ok(response),
            None => Err(fail(Stage::Response)),
        }
    }

    /// `SOH` plus the two exchange lengths, little-endian.
    fn send_header(&mut self, out_len: u16, in_len: u16) -> Result<bool> {
        let mut frame = [0u8; 5];
        frame[0] = SOH;
        frame[1..3].copy_from_slice(&out_len.to_le_bytes());
        frame[3..5].copy_from_slice(&in_len.to_le_bytes());
        Ok(self.transport.write(&frame, self.timeouts.transfer)? == frame.len())
    }

    /// `STX`, payload, `ETX`. False on any short write.
    fn send_data(&mut self, payload: &[u8]) -> Result<bool> {
        if self.transport.write(&[STX], self.timeouts.transfer)? != 1 {
            return Ok(false);
        }
        if self.transport.write(payload, self.timeouts.transfer)? != payload.len() {
            return Ok(false);
        }
        Ok(self.transport.write(&[ETX], self.timeouts.transfer)? == 1)
    }

    /// Read back `STX`, exactly `len` response bytes, then `ETX`.
    /// None on a short read or a delimiter mismatch.
    fn read_response(&mut self, len: usize) -> Result<Option<Vec<u8>>> {
        let mut delim = [0u8; 1];
        if self.transport.read(&mut delim, self.timeouts.transfer)? != 1 || delim[0] != STX {
            return Ok(None);
        }
        let mut response = vec![0u8; len];
        if self.transport.read(&mut response, self.timeouts.transfer)? != len {
            return Ok(None);
        }
        if self.transport.read(&mut delim, self.timeouts.transfer)? != 1 || delim[0] != ETX {
            return Ok(None);
        }
        Ok(Some(response))
    }

    /// Poll for a single byte until the ACK deadline; true only for `ACK`.
    fn await_ack(&mut self) -> Result<bool> {
        let byte = poll_deadline(self.timeouts.ack, Duration::ZERO, || {
            let mut b = [0u8; 1];
            Ok((self.transport.read(&mut b, ACK_PROBE)? == 1).then_some(b[0]))
        })?;
        match byte {
            Some(ACK) => Ok(true),
            Some(NAK) => {
                log::warn!("bridge sent NAK");
                Ok(false)
            }
            Some(other) => {
                log::warn!("expected ACK, got 0x{:02X}", other);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
