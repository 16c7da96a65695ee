// Licensed under the Apache-2.0 and MIT licenses.

//! bridgeflash
//!
//! Host-side programmer for SPI NOR flash memories sitting behind a
//! serial-to-SPI bridge. The bridge terminates a small framed byte
//! protocol and replays each payload as a raw SPI transaction; this
//! crate provides the framing and ACK handshake, the flash command set
//! with completion polling, and the read-modify-write logic needed to
//! program a byte range that does not fall on erase boundaries.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

pub mod id;
pub mod plan;
pub mod proto;
pub mod sreg;
pub mod transport;

pub use id::FlashId;
pub use plan::{ProgramPlan, ADDRESS_MASK, BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE};
pub use proto::{Bridge, Command, Stage, Timeouts, MAX_PAYLOAD};
pub use sreg::Status;
pub use transport::{SerialTransport, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Address range 0x{address:06X}+{length} exceeds the 24-bit address space.")]
    InvalidAddress { address: u32, length: usize },
    #[error("Programming {length} bytes at 0x{address:06X} would cross a page boundary.")]
    PageBoundary { address: u32, length: usize },
    #[error("Command payload of {length} bytes exceeds the bridge buffer.")]
    PayloadTooLarge { length: usize },
    #[error("Response of {length} bytes cannot be represented in a header frame.")]
    ResponseTooLarge { length: usize },
    #[error("Exchange failed at {stage} for command {command:02X?}.")]
    Exchange { stage: Stage, command: Vec<u8> },
    #[error("Write-enable latch did not set.")]
    WriteEnable,
    #[error("Write-enable latch did not clear.")]
    WriteDisable,
    #[error("Device still busy after command 0x{opcode:02X}.")]
    Busy { opcode: u8 },
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whole-exchange retry bound for each flash operation.
const CMD_RETRY: u32 = 100;

/// Bytes per exchange on the bulk read path.
const READ_CHUNK: usize = 0xFFFF;

/// WIP poll windows. Chip erase runs for seconds, so it polls on a
/// sleep interval instead of spinning.
const PP_TIMEOUT: Duration = Duration::from_secs(2);
const SE_TIMEOUT: Duration = Duration::from_secs(2);
const BE_TIMEOUT: Duration = Duration::from_secs(5);
const CE_TIMEOUT: Duration = Duration::from_secs(10);
const CE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Call `poll` until it yields a value or `deadline` elapses, sleeping
/// `interval` between polls. Ok(None) means the deadline passed.
pub(crate) fn poll_deadline<T, F>(
    deadline: Duration,
    interval: Duration,
    mut poll: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = poll()? {
            return Ok(Some(value));
        }
        if start.elapsed() >= deadline {
            return Ok(None);
        }
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
}

/// Re-run `call` until it succeeds, up to `attempts` times, returning
/// the last error if every attempt fails.
pub(crate) fn with_retries<T, F>(attempts: u32, mut call: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                log::debug!("attempt {} of {} failed: {}", attempt, attempts, err);
                attempt += 1;
            }
        }
    }
}

/// Proof that the write-enable latch was set by a preceding
/// [`Flash::write_enable`] call.
///
/// Erase and program operations consume the token. The latch
/// self-clears when such an operation completes, so each one needs its
/// own write-enable first; consuming the token makes that ordering a
/// compile-time requirement.
#[derive(Debug)]
pub struct WriteEnabled(());

/// SPI flash behind a bridge.
///
/// Each operation builds one fixed-shape command, retries the whole
/// framed exchange up to a fixed bound, and where the hardware needs it
/// polls the status register for completion.
pub struct Flash<'a, T: Transport> {
    bridge: &'a mut Bridge<T>,
}

impl<'a, T: Transport> Flash<'a, T> {
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    pub fn new(bridge: &'a mut Bridge<T>) -> Self {
        Flash { bridge }
    }

    /// Read the 3-byte JEDEC ID.
    pub fn read_id(&mut self) -> Result<FlashId> {
        log::debug!("Reading flash ID");
        let data = self.exchange(Opcode::ReadJedecId, &[], 3)?;
        Ok(FlashId::from_bytes([data[0], data[1], data[2]]))
    }

    /// Read the status register.
    pub fn read_status(&mut self) -> Result<Status> {
        self.exchange(Opcode::ReadStatus, &[], 1).map(|data| Status(data[0]))
    }

    /// Set the write-enable latch, confirming via the status register.
    ///
    /// The returned token is consumed by the erase and program
    /// operations; obtain a fresh one before each.
    pub fn write_enable(&mut self) -> Result<WriteEnabled> {
        for attempt in 1..=CMD_RETRY {
            if let Err(err) = self.exchange_once(Opcode::WriteEnable, &[], 0) {
                log::debug!("write-enable attempt {} failed: {}", attempt, err);
                continue;
            }
            if self.read_status()?.get_wel() {
                return Ok(WriteEnabled(()));
            }
        }
        Err(Error::WriteEnable)
    }

    /// Clear the write-enable latch, confirming via the status register.
    pub fn write_disable(&mut self) -> Result<()> {
        for attempt in 1..=CMD_RETRY {
            if let Err(err) = self.exchange_once(Opcode::WriteDisable, &[], 0) {
                log::debug!("write-disable attempt {} failed: {}", attempt, err);
                continue;
            }
            if !self.read_status()?.get_wel() {
                return Ok(());
            }
        }
        Err(Error::WriteDisable)
    }

    /// Read `length` bytes starting at `address`, in one exchange.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        check_range(address, length)?;
        self.exchange(Opcode::ReadData, &addr_param(address), length)
    }

    /// Read `length` bytes starting at `address`, split into exchanges
    /// of up to 64 KiB − 1, calling `cb` with the running byte count.
    pub fn read_cb<F: Fn(usize)>(&mut self, address: u32, length: usize, cb: F) -> Result<Vec<u8>> {
        check_range(address, length)?;
        let start = address as usize;
        let end = start + length;
        let mut data = Vec::with_capacity(length);
        cb(0);
        for addr in (start..end).step_by(READ_CHUNK) {
            let size = usize::min(READ_CHUNK, end - addr);
            data.append(&mut self.exchange(Opcode::ReadData, &addr_param(addr as u32), size)?);
            cb(data.len());
        }
        Ok(data)
    }

    /// Read `length` bytes starting at `address`, drawing a progress bar
    /// to the terminal.
    pub fn read_progress(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Reading");
        let result = self.read_cb(address, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Program up to one page. `data` must not cross a page boundary
    /// from `address`; the erase state of the page is the caller's
    /// problem. Polls WIP until completion.
    pub fn page_program(&mut self, _we: WriteEnabled, address: u32, data: &[u8]) -> Result<()> {
        check_range(address, data.len())?;
        let room = PAGE_SIZE - (address % PAGE_SIZE);
        if data.len() as u32 > room {
            return Err(Error::PageBoundary { address, length: data.len() });
        }
        let mut param = Vec::with_capacity(3 + data.len());
        param.extend_from_slice(&addr_param(address));
        param.extend_from_slice(data);
        self.exchange(Opcode::PageProgram, &param, 0)?;
        self.wait_not_busy(Opcode::PageProgram, PP_TIMEOUT, Duration::ZERO)
    }

    /// Erase the 4 KiB sector containing `address`.
    pub fn sector_erase(&mut self, _we: WriteEnabled, address: u32) -> Result<()> {
        check_range(address, 1)?;
        self.exchange(Opcode::SectorErase, &addr_param(address), 0)?;
        self.wait_not_busy(Opcode::SectorErase, SE_TIMEOUT, Duration::ZERO)
    }

    /// Erase the 64 KiB block containing `address`.
    pub fn block_erase(&mut self, _we: WriteEnabled, address: u32) -> Result<()> {
        check_range(address, 1)?;
        self.exchange(Opcode::BlockErase, &addr_param(address), 0)?;
        self.wait_not_busy(Opcode::BlockErase, BE_TIMEOUT, Duration::ZERO)
    }

    /// Erase the entire chip. This takes several seconds on real parts,
    /// so WIP is polled on a sleep interval.
    pub fn chip_erase(&mut self, _we: WriteEnabled) -> Result<()> {
        self.exchange(Opcode::ChipErase, &[], 0)?;
        self.wait_not_busy(Opcode::ChipErase, CE_TIMEOUT, CE_POLL_INTERVAL)
    }

    /// Erase the entire chip, write-enable included.
    pub fn erase(&mut self) -> Result<()> {
        let we = self.write_enable()?;
        self.chip_erase(we)
    }

    /// Erase the entire chip, drawing a spinner to the terminal.
    pub fn erase_progress(&mut self) -> Result<()> {
        let pb = ProgressBar::new_spinner();
        pb.set_message("Erasing");
        pb.enable_steady_tick(100);
        let result = self.erase();
        pb.finish();
        result
    }

    /// Program `data` at byte offset `offset`, preserving everything
    /// else in the sectors the request touches.
    ///
    /// The span is erased sector by sector in ascending order, then
    /// programmed page by page; a single failure aborts the remainder
    /// (completed erases are not undone).
    pub fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let (plan, image) = self.stage_program(offset, data)?;
        self.erase_span(&plan, |_| {})?;
        self.program_span(&plan, &image, |_| {})
    }

    /// Program `data` at `offset`, drawing erase and write progress bars
    /// to the terminal.
    pub fn program_progress(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let (plan, image) = self.stage_program(offset, data)?;
        let pb = ProgressBar::new(plan.span_len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Erasing");
        self.erase_span(&plan, |n| pb.set_position(n as u64))?;
        pb.finish();
        let pb = ProgressBar::new(image.len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        self.program_span(&plan, &image, |n| pb.set_position(n as u64))?;
        pb.finish();
        Ok(())
    }

    /// Widen the request to sector alignment and read back the sectors
    /// whose edges must survive the erase.
    fn stage_program(&mut self, offset: u32, data: &[u8]) -> Result<(ProgramPlan, Vec<u8>)> {
        check_range(offset, data.len())?;
        let plan = ProgramPlan::new(offset, data.len() as u32);
        log::info!(
            "Programming {} bytes at 0x{:06X}; erase span {} bytes at 0x{:06X}",
            data.len(),
            offset,
            plan.span_len(),
            plan.start()
        );
        let head = match plan.head_sector() {
            Some(addr) => Some(self.read(addr, SECTOR_SIZE as usize)?),
            None => None,
        };
        let tail = match plan.tail_sector() {
            Some(addr) => Some(self.read(addr, SECTOR_SIZE as usize)?),
            None => None,
        };
        let image = plan.assemble(head.as_deref(), tail.as_deref(), data);
        Ok((plan, image))
    }

    /// Write-enable and erase every sector of the span, ascending.
    /// `cb` is called with the number of bytes erased so far.
    fn erase_span<F: Fn(usize)>(&mut self, plan: &ProgramPlan, cb: F) -> Result<()> {
        let mut erased = 0;
        cb(erased);
        for addr in plan.sectors() {
            let we = self.write_enable()?;
            self.sector_erase(we, addr)?;
            erased += SECTOR_SIZE as usize;
            cb(erased);
        }
        Ok(())
    }

    /// Write-enable and program every page of the span, ascending.
    /// `cb` is called with the number of bytes written so far.
    fn program_span<F: Fn(usize)>(&mut self, plan: &ProgramPlan, image: &[u8], cb: F) -> Result<()> {
        let mut written = 0;
        cb(written);
        for addr in plan.pages() {
            let at = (addr - plan.start()) as usize;
            let page = &image[at..at + PAGE_SIZE as usize];
            let we = self.write_enable()?;
            self.page_program(we, addr, page)?;
            written += page.len();
            cb(written);
        }
        Ok(())
    }

    /// One framed exchange for `op`, no retry.
    fn exchange_once(&mut self, op: Opcode, param: &[u8], response_len: usize) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(1 + param.len());
        payload.push(op.into());
        payload.extend_from_slice(param);
        let command = Command::new(payload, response_len)?;
        self.bridge.execute(&command)
    }

    /// One exchange for `op`, retried up to the full bound.
    fn exchange(&mut self, op: Opcode, param: &[u8], response_len: usize) -> Result<Vec<u8>> {
        with_retries(CMD_RETRY, || self.exchange_once(op, param, response_len))
    }

    /// Poll the status register until WIP clears or `deadline` elapses.
    fn wait_not_busy(&mut self, op: Opcode, deadline: Duration, interval: Duration) -> Result<()> {
        let done = poll_deadline(deadline, interval, || {
            Ok((!self.read_status()?.get_busy()).then_some(()))
        })?;
        done.ok_or(Error::Busy { opcode: op.into() })
    }
}

/// Check a byte range against the 24-bit address space before any wire
/// traffic is produced for it.
fn check_range(address: u32, length: usize) -> Result<()> {
    let end = address as u64 + length as u64;
    if address > ADDRESS_MASK || end > ADDRESS_MASK as u64 + 1 {
        return Err(Error::InvalidAddress { address, length });
    }
    Ok(())
}

/// The 24-bit address, big-endian, for payload bytes 1-3.
fn addr_param(address: u32) -> [u8; 3] {
    let bytes = (address & ADDRESS_MASK).to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

/// SPI flash command opcodes understood by the parts this tool targets.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
enum Opcode {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadData = 0x03,
    PageProgram = 0x02,
    ReadStatus = 0x05,
    ReadJedecId = 0x9F,
    SectorErase = 0x20,
    BlockErase = 0x52,
    ChipErase = 0x60,
}
