//! Deterministic in-memory bus.
//!
//! Answers with engineered register contents for the supported sensors so the
//! whole pipeline runs without hardware. Faults can be injected per register
//! or per device, after the handle has been shared.

use super::{ActiveDevice, I2cBus};
use crate::error::BusError;
use heapless::Vec as BoundedVec;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

const WRITE_JOURNAL_CAPACITY: usize = 64;

const DEFAULT_REGISTER_VALUE: u8 = 0xAB;
const DEFAULT_BLOCK_BASE: u8 = 0x55;

const BME280_ADDRESSES: [u8; 2] = [0x76, 0x77];
const LPS25HB_ADDRESSES: [u8; 2] = [0x5C, 0x5D];

/// BME280 measurement block: P = 0x50100, T = 0x6ABCD, H = 0x7F80.
const BME280_MEASUREMENT: [u8; 8] = [0x50, 0x10, 0x00, 0x6A, 0xBC, 0xD0, 0x7F, 0x80];
/// LPS25HB pressure 1013.25 hPa (XL, L, H) and temperature 21.5 C (L, H),
/// stored at their auto-increment register addresses.
const LPS25HB_PRESSURE: [u8; 3] = [0x00, 0x54, 0x3F];
const LPS25HB_TEMPERATURE: [u8; 2] = [0xA0, 0xD8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub addr: u8,
    pub reg: u8,
    pub value: u8,
}

#[derive(Debug, Default)]
struct StubState {
    registers: HashMap<(u8, u8), u8>,
    present: HashSet<u8>,
    failing_reads: HashSet<(u8, u8)>,
    failing_writes: HashSet<(u8, u8)>,
    failing_selects: HashSet<u8>,
    truncated_reads: HashMap<(u8, u8), usize>,
    journal: BoundedVec<WriteRecord, WRITE_JOURNAL_CAPACITY>,
    active: ActiveDevice,
    select_count: u32,
}

impl StubState {
    fn seed_defaults(&mut self) {
        for addr in BME280_ADDRESSES {
            self.present.insert(addr);
            self.registers.insert((addr, 0xD0), 0x60);
            self.registers.insert((addr, 0xA1), 0x7F);
            self.load_block(addr, 0x88, &iota(0x10, 24));
            self.load_block(addr, 0xE1, &iota(0xE0, 7));
            self.load_block(addr, 0xF7, &BME280_MEASUREMENT);
        }
        for addr in LPS25HB_ADDRESSES {
            self.present.insert(addr);
            self.registers.insert((addr, 0x0F), 0xBD);
            self.load_block(addr, 0xA8, &LPS25HB_PRESSURE);
            self.load_block(addr, 0xAB, &LPS25HB_TEMPERATURE);
        }
    }

    fn load_block(&mut self, addr: u8, start: u8, data: &[u8]) {
        for (offset, &byte) in data.iter().enumerate() {
            self.registers
                .insert((addr, start.wrapping_add(offset as u8)), byte);
        }
    }

    fn select(&mut self, addr: u8) -> Result<(), BusError> {
        let failing = self.failing_selects.contains(&addr);
        let select_count = &mut self.select_count;
        self.active.ensure(addr, |addr| {
            *select_count += 1;
            if failing {
                Err(BusError::Select {
                    addr,
                    source: std::io::Error::from_raw_os_error(libc::EIO),
                })
            } else {
                Ok(())
            }
        })
    }

    fn check_present(&self, addr: u8) -> Result<(), BusError> {
        if self.present.contains(&addr) {
            Ok(())
        } else {
            Err(BusError::NoDevice(addr))
        }
    }

    fn record_write(&mut self, addr: u8, reg: u8, value: u8) {
        if self.journal.is_full() {
            self.journal.remove(0);
        }
        let _ = self.journal.push(WriteRecord { addr, reg, value });
        self.registers.insert((addr, reg), value);
    }
}

fn iota(start: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| start.wrapping_add(i as u8)).collect()
}

#[derive(Debug)]
pub struct StubI2cBus {
    path: String,
    state: Mutex<StubState>,
}

impl StubI2cBus {
    /// A stub answering for BME280 at 0x76/0x77 and LPS25HB at 0x5C/0x5D.
    pub fn new(path: impl Into<String>) -> Self {
        let mut state = StubState::default();
        state.seed_defaults();
        let path = path.into();
        debug!("stub bus '{}' initialized (no device opened)", path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// A stub with no devices and no register contents.
    pub fn empty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StubState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_register(&self, addr: u8, reg: u8, value: u8) {
        let mut state = self.state();
        state.present.insert(addr);
        state.registers.insert((addr, reg), value);
    }

    pub fn set_block(&self, addr: u8, start: u8, data: &[u8]) {
        let mut state = self.state();
        state.present.insert(addr);
        state.load_block(addr, start, data);
    }

    pub fn set_present(&self, addr: u8, present: bool) {
        let mut state = self.state();
        if present {
            state.present.insert(addr);
        } else {
            state.present.remove(&addr);
        }
    }

    /// Reads starting at `reg` (single or block) fail until cleared.
    pub fn fail_read(&self, addr: u8, reg: u8) {
        self.state().failing_reads.insert((addr, reg));
    }

    pub fn fail_write(&self, addr: u8, reg: u8) {
        self.state().failing_writes.insert((addr, reg));
    }

    pub fn fail_select(&self, addr: u8) {
        self.state().failing_selects.insert(addr);
    }

    /// Block reads starting at `reg` return at most `len` bytes.
    pub fn truncate_reads(&self, addr: u8, reg: u8, len: usize) {
        self.state().truncated_reads.insert((addr, reg), len);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.failing_reads.clear();
        state.failing_writes.clear();
        state.failing_selects.clear();
        state.truncated_reads.clear();
    }

    /// Register writes in the order they happened, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().journal.iter().copied().collect()
    }

    /// Number of device-select operations actually performed.
    pub fn select_count(&self) -> u32 {
        self.state().select_count
    }

    pub fn active_device(&self) -> Option<u8> {
        self.state().active.current()
    }
}

impl I2cBus for StubI2cBus {
    fn write_register(&self, addr: u8, reg: u8, value: u8) -> Result<(), BusError> {
        let mut state = self.state();
        state.select(addr)?;
        state.check_present(addr)?;
        if state.failing_writes.contains(&(addr, reg)) {
            return Err(BusError::Injected { addr, reg });
        }
        trace!("[stub {}] write 0x{:02x} -> 0x{:02x}:0x{:02x}", self.path, value, addr, reg);
        state.record_write(addr, reg, value);
        Ok(())
    }

    fn read_register(&self, addr: u8, reg: u8) -> Result<u8, BusError> {
        let mut state = self.state();
        state.select(addr)?;
        state.check_present(addr)?;
        if state.failing_reads.contains(&(addr, reg)) {
            return Err(BusError::Injected { addr, reg });
        }
        let value = state
            .registers
            .get(&(addr, reg))
            .copied()
            .unwrap_or(DEFAULT_REGISTER_VALUE);
        trace!("[stub {}] read 0x{:02x}:0x{:02x} = 0x{:02x}", self.path, addr, reg, value);
        Ok(value)
    }

    fn read_block(&self, addr: u8, start: u8, len: usize) -> Result<Vec<u8>, BusError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state();
        state.select(addr)?;
        state.check_present(addr)?;
        if state.failing_reads.contains(&(addr, start)) {
            return Err(BusError::Injected { addr, reg: start });
        }
        let available = state
            .truncated_reads
            .get(&(addr, start))
            .copied()
            .unwrap_or(len)
            .min(len);
        let data = (0..available)
            .map(|offset| {
                let reg = start.wrapping_add(offset as u8);
                state
                    .registers
                    .get(&(addr, reg))
                    .copied()
                    .unwrap_or_else(|| DEFAULT_BLOCK_BASE.wrapping_add(offset as u8))
            })
            .collect();
        trace!("[stub {}] read block {} bytes from 0x{:02x}:0x{:02x}", self.path, len, addr, start);
        Ok(data)
    }

    fn write_block(&self, addr: u8, start: u8, data: &[u8]) -> Result<(), BusError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state();
        state.select(addr)?;
        state.check_present(addr)?;
        if state.failing_writes.contains(&(addr, start)) {
            return Err(BusError::Injected { addr, reg: start });
        }
        for (offset, &value) in data.iter().enumerate() {
            state.record_write(addr, start.wrapping_add(offset as u8), value);
        }
        Ok(())
    }

    fn probe(&self, addr: u8) -> bool {
        let mut state = self.state();
        if !state.present.contains(&addr) || state.failing_selects.contains(&addr) {
            return false;
        }
        state.select_count += 1;
        state.active.set(addr);
        true
    }

    fn bus_path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_register_file() {
        let bus = StubI2cBus::new("stub");
        assert_eq!(bus.read_register(0x76, 0xD0).unwrap(), 0x60);
        assert_eq!(bus.read_register(0x5D, 0x0F).unwrap(), 0xBD);
        assert_eq!(bus.read_register(0x76, 0x42).unwrap(), DEFAULT_REGISTER_VALUE);

        let calib = bus.read_block(0x76, 0x88, 24).unwrap();
        assert_eq!(calib[0], 0x10);
        assert_eq!(calib[23], 0x27);

        let unknown = bus.read_block(0x76, 0x00, 3).unwrap();
        assert_eq!(unknown, vec![0x55, 0x56, 0x57]);
    }

    #[test]
    fn test_absent_device_fails() {
        let bus = StubI2cBus::new("stub");
        assert!(matches!(bus.read_register(0x10, 0x00), Err(BusError::NoDevice(0x10))));
        assert!(!bus.probe(0x10));
        assert!(bus.probe(0x76));
    }

    #[test]
    fn test_select_cache_counts() {
        let bus = StubI2cBus::new("stub");
        bus.read_register(0x76, 0xD0).unwrap();
        bus.read_register(0x76, 0xA1).unwrap();
        bus.read_block(0x76, 0x88, 24).unwrap();
        assert_eq!(bus.select_count(), 1);

        bus.read_register(0x5D, 0x0F).unwrap();
        bus.read_register(0x76, 0xD0).unwrap();
        assert_eq!(bus.select_count(), 3);
    }

    #[test]
    fn test_failed_select_invalidates_cache() {
        let bus = StubI2cBus::new("stub");
        bus.read_register(0x76, 0xD0).unwrap();
        assert_eq!(bus.active_device(), Some(0x76));

        bus.fail_select(0x5D);
        assert!(bus.read_register(0x5D, 0x0F).is_err());
        assert_eq!(bus.active_device(), None);

        bus.read_register(0x76, 0xD0).unwrap();
        assert_eq!(bus.select_count(), 3);
    }

    #[test]
    fn test_write_journal_is_bounded() {
        let bus = StubI2cBus::new("stub");
        for i in 0..(WRITE_JOURNAL_CAPACITY + 5) {
            bus.write_register(0x76, 0xF4, i as u8).unwrap();
        }
        let writes = bus.writes();
        assert_eq!(writes.len(), WRITE_JOURNAL_CAPACITY);
        assert_eq!(writes[0].value, 5);
    }

    #[test]
    fn test_injected_faults_clear() {
        let bus = StubI2cBus::new("stub");
        bus.fail_read(0x76, 0xD0);
        bus.fail_write(0x76, 0xF2);
        assert!(bus.read_register(0x76, 0xD0).is_err());
        assert!(bus.write_register(0x76, 0xF2, 1).is_err());

        bus.clear_faults();
        assert!(bus.read_register(0x76, 0xD0).is_ok());
        assert!(bus.write_register(0x76, 0xF2, 1).is_ok());
    }
}
