//! Live bus backed by the Linux i2c-dev interface.

use super::{ActiveDevice, I2cBus};
use crate::error::BusError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// `I2C_SLAVE` from `<linux/i2c-dev.h>`.
const I2C_SLAVE: libc::c_ulong = 0x0703;

#[derive(Debug)]
struct Inner {
    file: File,
    active: ActiveDevice,
}

impl Inner {
    fn set_slave_address(&self, addr: u8) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and stays open for the
        // duration of the call; I2C_SLAVE takes the address by value.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(addr),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn select(&mut self, addr: u8) -> Result<(), BusError> {
        let Self { file, active } = self;
        let fd = file.as_raw_fd();
        active.ensure(addr, |addr| {
            // SAFETY: see `set_slave_address`.
            let rc = unsafe { libc::ioctl(fd, I2C_SLAVE as _, libc::c_ulong::from(addr)) };
            if rc < 0 {
                let source = io::Error::last_os_error();
                error!("failed to set slave address 0x{:02x}: {}", addr, source);
                Err(BusError::Select { addr, source })
            } else {
                Ok(())
            }
        })
    }

    fn write_all_or_fail(&mut self, addr: u8, reg: u8, buf: &[u8]) -> Result<(), BusError> {
        match self.file.write(buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(BusError::Transfer {
                addr,
                reg,
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("wrote {} of {} bytes", n, buf.len()),
                ),
            }),
            Err(source) => Err(BusError::Transfer { addr, reg, source }),
        }
    }
}

/// One opened `/dev/i2c-N` node. Every transaction holds the bus lock for its
/// whole duration, so register-pointer writes and the following reads from
/// different sensors never interleave.
#[derive(Debug)]
pub struct LinuxI2cBus {
    path: String,
    inner: Mutex<Inner>,
}

impl LinuxI2cBus {
    pub fn open(path: impl Into<String>) -> Result<Self, BusError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| BusError::Open {
                path: path.clone(),
                source,
            })?;
        info!("opened I2C bus {}", path);
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                active: ActiveDevice::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl I2cBus for LinuxI2cBus {
    fn write_register(&self, addr: u8, reg: u8, value: u8) -> Result<(), BusError> {
        let mut inner = self.lock();
        inner.select(addr)?;
        inner.write_all_or_fail(addr, reg, &[reg, value]).map_err(|e| {
            error!("write 0x{:02x} to 0x{:02x}:0x{:02x} failed: {}", value, addr, reg, e);
            e
        })
    }

    fn read_register(&self, addr: u8, reg: u8) -> Result<u8, BusError> {
        let mut inner = self.lock();
        inner.select(addr)?;
        inner.write_all_or_fail(addr, reg, &[reg])?;

        let mut value = [0u8; 1];
        match inner.file.read(&mut value) {
            Ok(1) => Ok(value[0]),
            Ok(n) => Err(BusError::ShortRead {
                addr,
                reg,
                expected: 1,
                actual: n,
            }),
            Err(source) => {
                error!("read from 0x{:02x}:0x{:02x} failed: {}", addr, reg, source);
                Err(BusError::Transfer { addr, reg, source })
            }
        }
    }

    fn read_block(&self, addr: u8, start: u8, len: usize) -> Result<Vec<u8>, BusError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.lock();
        inner.select(addr)?;
        inner.write_all_or_fail(addr, start, &[start])?;

        let mut buffer = vec![0u8; len];
        let read = inner.file.read(&mut buffer).map_err(|source| {
            error!("block read of {} bytes from 0x{:02x}:0x{:02x} failed: {}", len, addr, start, source);
            BusError::Transfer {
                addr,
                reg: start,
                source,
            }
        })?;
        if read != len {
            warn!("read only {} of {} bytes from 0x{:02x}:0x{:02x}", read, len, addr, start);
            buffer.truncate(read);
        }
        Ok(buffer)
    }

    fn write_block(&self, addr: u8, start: u8, data: &[u8]) -> Result<(), BusError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        inner.select(addr)?;

        let mut buffer = Vec::with_capacity(data.len() + 1);
        buffer.push(start);
        buffer.extend_from_slice(data);
        inner.write_all_or_fail(addr, start, &buffer)
    }

    fn probe(&self, addr: u8) -> bool {
        let mut inner = self.lock();
        match inner.set_slave_address(addr) {
            Ok(()) => {
                inner.active.set(addr);
                true
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EIO) | Some(libc::ENXIO)) => {
                // Best-effort restore of the previous device; outcome not checked.
                if let Some(previous) = inner.active.current() {
                    if previous != addr {
                        let _ = inner.set_slave_address(previous);
                    }
                }
                false
            }
            Err(e) => {
                error!("probe ioctl for 0x{:02x} failed: {}", addr, e);
                inner.active.invalidate();
                false
            }
        }
    }

    fn bus_path(&self) -> &str {
        &self.path
    }
}

impl Drop for LinuxI2cBus {
    fn drop(&mut self) {
        info!("closed I2C bus {}", self.path);
    }
}
