//! Byte transport to the bridge.
//!
//! Reads and writes are best-effort accumulating operations: they keep
//! issuing the underlying I/O call until the requested count has been
//! transferred or the wall-clock deadline passes. A short transfer is
//! not an error here; callers compare the returned count against what
//! they needed.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::Result;

/// How long each underlying serial call may block before the
/// accumulation loop re-checks the deadline.
const PROBE: Duration = Duration::from_millis(50);

/// Reliable-ish byte read/write with wall-clock deadlines.
///
/// No framing at this layer, and no automatic retrying of data: a
/// partial transfer is reported as the actual count transferred.
pub trait Transport {
    /// Write bytes from `data`, accumulating until done or `deadline`
    /// elapses. Returns the number of bytes actually written.
    fn write(&mut self, data: &[u8], deadline: Duration) -> Result<usize>;

    /// Read bytes into `buf`, accumulating until full or `deadline`
    /// elapses. Returns the number of bytes actually read.
    fn read(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize>;

    /// Discard any buffered bytes in both directions. A stale byte from
    /// an abandoned exchange would otherwise be misread as an ACK or a
    /// frame delimiter.
    fn drain(&mut self) -> Result<()>;
}

/// Serial-port transport, 8 data bits, no parity, one stop bit.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `device` at the given baud rate.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(PROBE)
            .open()?;
        log::info!("Opened serial port {} at {} baud", device, baud);
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8], deadline: Duration) -> Result<usize> {
        let start = Instant::now();
        let mut sent = 0;
        while sent < data.len() && start.elapsed() < deadline {
            match self.port.write(&data[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => (),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sent)
    }

    fn read(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize> {
        let start = Instant::now();
        let mut got = 0;
        while got < buf.len() && start.elapsed() < deadline {
            match self.port.read(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => (),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(got)
    }

    fn drain(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}
