//! End-to-end tests against an in-process bridge that mimics the real
//! firmware: header parsing, ACK/NAK, and a NOR flash model with a
//! write-enable latch and AND-style programming.

use std::collections::VecDeque;
use std::time::Duration;

use bridgeflash::proto::{ACK, ETX, NAK, SOH, STX};
use bridgeflash::{
    Bridge, Command, Error, Flash, Result, Stage, Timeouts, Transport, MAX_PAYLOAD, SECTOR_SIZE,
};

const MEM_SIZE: usize = 1 << 24;

enum Expect {
    Header,
    Data { out_len: usize, in_len: usize },
}

/// Byte-level emulation of the bridge firmware plus the flash chip
/// behind it. Bytes written by the host are parsed as frames; responses
/// queue up for the host to read back.
struct MockBridge {
    mem: Vec<u8>,
    wel: bool,
    /// Largest data frame the firmware will buffer.
    dat_size: usize,
    /// When set, incoming bytes are recorded but never answered.
    mute: bool,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    expect: Expect,
    /// Every byte the host ever wrote, for assertions.
    seen: Vec<u8>,
    /// Largest out_len the host ever announced.
    max_out_len: usize,
}

impl MockBridge {
    fn new() -> Self {
        MockBridge {
            mem: vec![0xFF; MEM_SIZE],
            wel: false,
            dat_size: MAX_PAYLOAD,
            mute: false,
            rx: Vec::new(),
            tx: VecDeque::new(),
            expect: Expect::Header,
            seen: Vec::new(),
            max_out_len: 0,
        }
    }

    fn pump(&mut self) {
        loop {
            match self.expect {
                Expect::Header => {
                    if self.rx.len() < 5 {
                        return;
                    }
                    let hdr: Vec<u8> = self.rx.drain(..5).collect();
                    let out_len = u16::from_le_bytes([hdr[1], hdr[2]]) as usize;
                    let in_len = u16::from_le_bytes([hdr[3], hdr[4]]) as usize;
                    if hdr[0] != SOH || out_len > self.dat_size {
                        self.tx.push_back(NAK);
                        continue;
                    }
                    self.max_out_len = self.max_out_len.max(out_len);
                    self.tx.push_back(ACK);
                    self.expect = Expect::Data { out_len, in_len };
                }
                Expect::Data { out_len, in_len } => {
                    if self.rx.len() < out_len + 2 {
                        return;
                    }
                    let frame: Vec<u8> = self.rx.drain(..out_len + 2).collect();
                    self.expect = Expect::Header;
                    if frame[0] != STX || frame[out_len + 1] != ETX {
                        self.tx.push_back(NAK);
                        continue;
                    }
                    self.tx.push_back(ACK);
                    let response = self.exec(&frame[1..out_len + 1], in_len);
                    self.tx.push_back(STX);
                    self.tx.extend(response);
                    self.tx.push_back(ETX);
                }
            }
        }
    }

    fn exec(&mut self, payload: &[u8], in_len: usize) -> Vec<u8> {
        let mut out = match payload[0] {
            0x9F => vec![0xEF, 0x40, 0x16],
            0x05 => vec![(self.wel as u8) << 1],
            0x06 => {
                self.wel = true;
                Vec::new()
            }
            0x04 => {
                self.wel = false;
                Vec::new()
            }
            0x03 => {
                let addr = addr24(payload);
                self.mem[addr..addr + in_len].to_vec()
            }
            0x02 => {
                if self.wel {
                    let addr = addr24(payload);
                    for (slot, byte) in self.mem[addr..].iter_mut().zip(&payload[4..]) {
                        *slot &= byte;
                    }
                }
                self.wel = false;
                Vec::new()
            }
            0x20 => {
                if self.wel {
                    let base = addr24(payload) & !0xFFF;
                    self.mem[base..base + 0x1000].fill(0xFF);
                }
                self.wel = false;
                Vec::new()
            }
            0x52 => {
                if self.wel {
                    let base = addr24(payload) & !0xFFFF;
                    self.mem[base..base + 0x1_0000].fill(0xFF);
                }
                self.wel = false;
                Vec::new()
            }
            0x60 => {
                if self.wel {
                    self.mem.fill(0xFF);
                }
                self.wel = false;
                Vec::new()
            }
            _ => Vec::new(),
        };
        out.resize(in_len, 0xFF);
        out
    }
}

fn addr24(payload: &[u8]) -> usize {
    ((payload[1] as usize) << 16) | ((payload[2] as usize) << 8) | payload[3] as usize
}

impl Transport for MockBridge {
    fn write(&mut self, data: &[u8], _deadline: Duration) -> Result<usize> {
        self.seen.extend_from_slice(data);
        if !self.mute {
            self.rx.extend_from_slice(data);
            self.pump();
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _deadline: Duration) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.tx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn drain(&mut self) -> Result<()> {
        self.tx.clear();
        Ok(())
    }
}

/// Short deadlines so failure-path tests do not sit out the real
/// ten-second ACK window.
fn quick() -> Timeouts {
    Timeouts {
        transfer: Duration::from_millis(50),
        ack: Duration::from_millis(50),
    }
}

#[test]
fn read_id_reports_mock_identity() {
    let mut bridge = Bridge::new(MockBridge::new());
    let id = Flash::new(&mut bridge).read_id().unwrap();
    assert_eq!(id.manufacturer_id, 0xEF);
    assert_eq!(id.memory_type, 0x40);
    assert_eq!(id.capacity, 0x16);
}

#[test]
fn status_tracks_write_enable_latch() {
    let mut bridge = Bridge::new(MockBridge::new());
    let mut flash = Flash::new(&mut bridge);
    assert!(!flash.read_status().unwrap().get_wel());
    let we = flash.write_enable().unwrap();
    assert!(flash.read_status().unwrap().get_wel());
    drop(we);
    flash.write_disable().unwrap();
    assert!(!flash.read_status().unwrap().get_wel());
}

#[test]
fn engine_round_trips_a_command() {
    let mut mock = MockBridge::new();
    mock.mem[0x10..0x14].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    let mut bridge = Bridge::new(mock);
    let cmd = Command::new(vec![0x03, 0x00, 0x00, 0x10], 4).unwrap();
    assert_eq!(bridge.execute(&cmd).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn unacknowledged_header_stops_before_data() {
    let mut mock = MockBridge::new();
    mock.mute = true;
    let mut bridge = Bridge::with_timeouts(mock, quick());
    let cmd = Command::new(vec![0x9F], 3).unwrap();
    let err = bridge.execute(&cmd).unwrap_err();
    assert!(matches!(err, Error::Exchange { stage: Stage::HeaderAck, .. }));
    // Only the five header bytes ever made it onto the wire.
    let seen = &bridge.transport().seen;
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], SOH);
}

#[test]
fn bridge_naks_oversized_header() {
    let mut mock = MockBridge::new();
    mock.dat_size = 16;
    let mut bridge = Bridge::with_timeouts(mock, quick());
    let cmd = Command::new(vec![0u8; 20], 0).unwrap();
    let err = bridge.execute(&cmd).unwrap_err();
    assert!(matches!(err, Error::Exchange { stage: Stage::HeaderAck, .. }));
}

#[test]
fn read_is_idempotent() {
    let mut mock = MockBridge::new();
    for (i, slot) in mock.mem[0x2000..0x3000].iter_mut().enumerate() {
        *slot = (i % 251) as u8;
    }
    let mut bridge = Bridge::new(mock);
    let mut flash = Flash::new(&mut bridge);
    let first = flash.read(0x2000, 0x1000).unwrap();
    let second = flash.read(0x2000, 0x1000).unwrap();
    assert_eq!(first, second);
    assert_eq!(first[5], 5);
}

#[test]
fn read_cb_chunks_cover_range() {
    let mut mock = MockBridge::new();
    for (i, slot) in mock.mem[..0x1_8000].iter_mut().enumerate() {
        *slot = (i % 253) as u8;
    }
    let expected = mock.mem[..0x1_8000].to_vec();
    let mut bridge = Bridge::new(mock);
    let mut flash = Flash::new(&mut bridge);
    let data = flash.read_cb(0, 0x1_8000, |_| {}).unwrap();
    assert_eq!(data, expected);
}

#[test]
fn program_preserves_unwritten_sector_bytes() {
    // Seed the first sector, overwrite [0x10, 0x20), and check that the
    // rest of the sector survived the erase.
    let mut mock = MockBridge::new();
    for (i, slot) in mock.mem[..0x1000].iter_mut().enumerate() {
        *slot = (i % 256) as u8;
    }
    let before = mock.mem[..0x1000].to_vec();
    let mut bridge = Bridge::new(mock);
    let mut flash = Flash::new(&mut bridge);

    let data: Vec<u8> = (0xA0..0xB0).collect();
    flash.program(0x10, &data).unwrap();

    let after = flash.read(0, 0x1000).unwrap();
    assert_eq!(&after[..0x10], &before[..0x10]);
    assert_eq!(&after[0x10..0x20], &data[..]);
    assert_eq!(&after[0x20..], &before[0x20..]);
}

#[test]
fn program_spanning_two_sectors() {
    let mut mock = MockBridge::new();
    for (i, slot) in mock.mem[..0x3000].iter_mut().enumerate() {
        *slot = (i % 241) as u8;
    }
    let before = mock.mem[..0x3000].to_vec();
    let mut bridge = Bridge::new(mock);
    let mut flash = Flash::new(&mut bridge);

    let data = vec![0x55; 0x20];
    flash.program(0xFF0, &data).unwrap();

    let after = flash.read(0, 0x3000).unwrap();
    assert_eq!(&after[..0xFF0], &before[..0xFF0]);
    assert_eq!(&after[0xFF0..0x1010], &data[..]);
    assert_eq!(&after[0x1010..0x2000], &before[0x1010..0x2000]);
    // The third sector was outside the erase span entirely.
    assert_eq!(&after[0x2000..], &before[0x2000..]);
}

#[test]
fn program_never_exceeds_bridge_payload() {
    let mut bridge = Bridge::new(MockBridge::new());
    let mut flash = Flash::new(&mut bridge);
    let data = vec![0x42; 3 * SECTOR_SIZE as usize];
    flash.program(0x7F0, &data).unwrap();
    assert!(bridge.transport().max_out_len <= MAX_PAYLOAD);
}

#[test]
fn chip_erase_fills_with_ff() {
    let mut mock = MockBridge::new();
    mock.mem[..0x100].fill(0x00);
    let mut bridge = Bridge::new(mock);
    let mut flash = Flash::new(&mut bridge);
    flash.erase().unwrap();
    assert!(bridge.transport().mem.iter().all(|&b| b == 0xFF));
}

#[test]
fn page_program_rejects_boundary_crossing() {
    let mut bridge = Bridge::new(MockBridge::new());
    let mut flash = Flash::new(&mut bridge);
    let we = flash.write_enable().unwrap();
    let err = flash.page_program(we, 0x10, &[0u8; 256]).unwrap_err();
    assert!(matches!(err, Error::PageBoundary { .. }));

    let we = flash.write_enable().unwrap();
    flash.page_program(we, 0x100, &[0u8; 256]).unwrap();
}

#[test]
fn out_of_range_request_rejected_before_wire() {
    let mut mock = MockBridge::new();
    mock.mute = true;
    let mut bridge = Bridge::with_timeouts(mock, quick());
    let mut flash = Flash::new(&mut bridge);
    let err = flash.read(0xFF_FFFF, 2).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress { .. }));
    assert!(bridge.transport().seen.is_empty());
}
