//! Register-level access to a shared I2C bus.
//!
//! One handle per physical bus, shared by every sensor attached to it. All
//! transactions on a handle are serialized by the implementation.

#[cfg(target_os = "linux")]
pub mod linux;
pub mod stub;

#[cfg(target_os = "linux")]
pub use linux::LinuxI2cBus;
pub use stub::StubI2cBus;

use crate::error::BusError;
use std::fmt;
use std::sync::Arc;

/// Lowest and highest 7-bit addresses probed by a bus scan.
pub const SCAN_FIRST_ADDRESS: u8 = 0x03;
pub const SCAN_LAST_ADDRESS: u8 = 0x77;

pub trait I2cBus: Send + Sync + fmt::Debug {
    fn write_register(&self, addr: u8, reg: u8, value: u8) -> Result<(), BusError>;

    fn read_register(&self, addr: u8, reg: u8) -> Result<u8, BusError>;

    /// Reads up to `len` consecutive registers starting at `start`.
    ///
    /// A vector shorter than `len` means the transfer was cut short. Callers
    /// that need the full block should go through [`read_exact_block`].
    fn read_block(&self, addr: u8, start: u8, len: usize) -> Result<Vec<u8>, BusError>;

    fn write_block(&self, addr: u8, start: u8, data: &[u8]) -> Result<(), BusError>;

    /// True iff a device acknowledges at `addr`.
    fn probe(&self, addr: u8) -> bool;

    fn bus_path(&self) -> &str;
}

/// Shared ownership of one bus; released when the last sensor drops it.
pub type SharedBus = Arc<dyn I2cBus>;

/// Reads exactly `len` bytes or fails with [`BusError::ShortRead`].
pub fn read_exact_block(
    bus: &dyn I2cBus,
    addr: u8,
    start: u8,
    len: usize,
) -> Result<Vec<u8>, BusError> {
    let data = bus.read_block(addr, start, len)?;
    if data.len() != len {
        return Err(BusError::ShortRead {
            addr,
            reg: start,
            expected: len,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Which device the bus is currently pointed at.
///
/// Must only be touched while the owning bus lock is held.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveDevice(Option<u8>);

impl ActiveDevice {
    pub fn current(self) -> Option<u8> {
        self.0
    }

    /// Runs `select` only when `addr` differs from the cached address.
    /// A failed select clears the cache.
    pub fn ensure<F>(&mut self, addr: u8, select: F) -> Result<(), BusError>
    where
        F: FnOnce(u8) -> Result<(), BusError>,
    {
        if self.0 == Some(addr) {
            return Ok(());
        }
        match select(addr) {
            Ok(()) => {
                self.0 = Some(addr);
                Ok(())
            }
            Err(e) => {
                self.0 = None;
                Err(e)
            }
        }
    }

    pub fn set(&mut self, addr: u8) {
        self.0 = Some(addr);
    }

    pub fn invalidate(&mut self) {
        self.0 = None;
    }
}

/// Probes every address in the scan range and returns the ones that answered.
pub fn scan(bus: &dyn I2cBus) -> Vec<u8> {
    (SCAN_FIRST_ADDRESS..=SCAN_LAST_ADDRESS)
        .filter(|&addr| bus.probe(addr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_device_skips_redundant_select() {
        let mut active = ActiveDevice::default();
        let mut selects = 0;

        active.ensure(0x76, |_| { selects += 1; Ok(()) }).unwrap();
        active.ensure(0x76, |_| { selects += 1; Ok(()) }).unwrap();
        assert_eq!(selects, 1);
        assert_eq!(active.current(), Some(0x76));

        active.ensure(0x5D, |_| { selects += 1; Ok(()) }).unwrap();
        assert_eq!(selects, 2);
        assert_eq!(active.current(), Some(0x5D));
    }

    #[test]
    fn test_active_device_invalidated_on_select_failure() {
        let mut active = ActiveDevice::default();
        active.ensure(0x76, |_| Ok(())).unwrap();

        let result = active.ensure(0x77, |addr| Err(BusError::NoDevice(addr)));
        assert!(result.is_err());
        assert_eq!(active.current(), None);

        // Same address as before the failure must be selected again
        let mut selected = false;
        active.ensure(0x76, |_| { selected = true; Ok(()) }).unwrap();
        assert!(selected);
    }

    #[test]
    fn test_read_exact_block_rejects_short_read() {
        let bus = StubI2cBus::new("stub");
        bus.set_block(0x40, 0x10, &[1, 2, 3]);
        bus.truncate_reads(0x40, 0x10, 2);

        match read_exact_block(&bus, 0x40, 0x10, 3) {
            Err(BusError::ShortRead { expected, actual, .. }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_reports_seeded_devices() {
        let bus = StubI2cBus::new("stub");
        let found = scan(&bus);
        assert_eq!(found, vec![0x5C, 0x5D, 0x76, 0x77]);
    }
}
