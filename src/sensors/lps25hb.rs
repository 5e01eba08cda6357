//! ST LPS25HB barometer.
//!
//! Pressure and temperature are read independently, so one failing field
//! still lets the other through with an error marker in its place.

use super::{Measurement, Sensor};
use crate::bus::{read_exact_block, SharedBus};
use crate::config::SensorConfig;
use crate::error::{InitError, ReadError};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_ADDRESS: u8 = 0x5D;

pub const REG_WHO_AM_I: u8 = 0x0F;
pub const REG_CTRL_REG1: u8 = 0x20;
pub const REG_PRESS_OUT_XL: u8 = 0x28;
pub const REG_TEMP_OUT_L: u8 = 0x2B;

/// Set on the register address to enable auto-increment for multi-byte reads.
pub const AUTO_INCREMENT: u8 = 0x80;

pub const WHO_AM_I_VALUE: u8 = 0xBD;

const CTRL_REG1_PD: u8 = 0x80;
const CTRL_REG1_ODR_25HZ: u8 = 0x40;
const CTRL_REG1_BDU: u8 = 0x04;
/// Active mode, 25 Hz output data rate, block data update.
pub const CTRL_REG1_SETTINGS: u8 = CTRL_REG1_PD | CTRL_REG1_ODR_25HZ | CTRL_REG1_BDU;

const PRESSURE_LSB_PER_HPA: f64 = 4096.0;
const TEMPERATURE_OFFSET_C: f64 = 42.5;
const TEMPERATURE_LSB_PER_C: f64 = 480.0;

const READ_FAILED: &str = "Read failed";

/// Sign-extends the 24-bit two's complement pressure word (XL, L, H) into hPa.
pub fn decode_pressure(raw: [u8; 3]) -> f64 {
    let word = (i32::from(raw[2]) << 16) | (i32::from(raw[1]) << 8) | i32::from(raw[0]);
    let signed = (word << 8) >> 8;
    f64::from(signed) / PRESSURE_LSB_PER_HPA
}

pub fn decode_temperature(raw: [u8; 2]) -> f64 {
    TEMPERATURE_OFFSET_C + f64::from(i16::from_le_bytes(raw)) / TEMPERATURE_LSB_PER_C
}

pub struct Lps25hbSensor {
    config: SensorConfig,
    bus: SharedBus,
    address: u8,
}

impl Lps25hbSensor {
    pub fn new(config: SensorConfig, bus: SharedBus) -> Result<Self, InitError> {
        if !config.enabled {
            return Err(InitError::Disabled);
        }
        let address = config.i2c_address;
        if address == 0 {
            return Err(InitError::InvalidAddress(address));
        }

        let found = bus
            .read_register(address, REG_WHO_AM_I)
            .map_err(InitError::Identity)?;
        if found != WHO_AM_I_VALUE {
            return Err(InitError::IdentityMismatch {
                addr: address,
                expected: WHO_AM_I_VALUE,
                found,
            });
        }
        bus.write_register(address, REG_CTRL_REG1, CTRL_REG1_SETTINGS)
            .map_err(InitError::Configure)?;

        info!(
            "LPS25HB initialized at 0x{:02x} on bus '{}'",
            address,
            bus.bus_path()
        );
        Ok(Self {
            config,
            bus,
            address,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn read_pressure(&self) -> Result<f64, ReadError> {
        let data = read_exact_block(
            self.bus.as_ref(),
            self.address,
            REG_PRESS_OUT_XL | AUTO_INCREMENT,
            3,
        )?;
        Ok(decode_pressure([data[0], data[1], data[2]]))
    }

    fn read_temperature(&self) -> Result<f64, ReadError> {
        let data = read_exact_block(
            self.bus.as_ref(),
            self.address,
            REG_TEMP_OUT_L | AUTO_INCREMENT,
            2,
        )?;
        Ok(decode_temperature([data[0], data[1]]))
    }
}

impl Sensor for Lps25hbSensor {
    fn sensor_type(&self) -> &str {
        &self.config.sensor_type
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn publish_interval(&self) -> Duration {
        self.config.publish_interval
    }

    fn topic_suffix(&self) -> &str {
        &self.config.topic_suffix
    }

    fn read(&mut self) -> Result<Measurement, ReadError> {
        let mut measurement = Measurement::default();
        let mut failures = Vec::new();

        match self.read_pressure() {
            Ok(hpa) => measurement.pressure_hpa = Some(hpa),
            Err(e) => {
                warn!("LPS25HB 0x{:02x} pressure read failed: {}", self.address, e);
                measurement.mark_error("pressure", READ_FAILED);
                failures.push(format!("pressure: {}", e));
            }
        }
        match self.read_temperature() {
            Ok(celsius) => measurement.temperature_celsius = Some(celsius),
            Err(e) => {
                warn!("LPS25HB 0x{:02x} temperature read failed: {}", self.address, e);
                measurement.mark_error("temperature", READ_FAILED);
                failures.push(format!("temperature: {}", e));
            }
        }

        if measurement.is_empty() {
            return Err(ReadError::AllFieldsFailed(failures.join("; ")));
        }
        Ok(measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StubI2cBus;
    use std::sync::Arc;

    const ADDR: u8 = 0x5D;

    fn config() -> SensorConfig {
        SensorConfig {
            sensor_type: "LPS25HB".to_string(),
            enabled: true,
            topic_suffix: "lps25hb/data".to_string(),
            publish_interval: Duration::from_secs(5),
            i2c_bus: Some("stub".to_string()),
            i2c_address: ADDR,
            gpio_pin: None,
        }
    }

    fn sensor() -> (Arc<StubI2cBus>, Lps25hbSensor) {
        let stub = Arc::new(StubI2cBus::new("stub"));
        let sensor = Lps25hbSensor::new(config(), stub.clone()).unwrap();
        (stub, sensor)
    }

    #[test]
    fn test_pressure_sign_extension() {
        assert_eq!(decode_pressure([0x00, 0x54, 0x3F]), 1013.25);
        assert_eq!(decode_pressure([0x00, 0x00, 0x00]), 0.0);
        assert_eq!(decode_pressure([0x00, 0xF0, 0xFF]), -1.0);
    }

    #[test]
    fn test_temperature_decoding() {
        assert_eq!(decode_temperature([0x00, 0x00]), 42.5);
        assert_eq!(decode_temperature([0xA0, 0xD8]), 21.5);
    }

    #[test]
    fn test_init_configures_ctrl_reg1() {
        let (stub, sensor) = sensor();
        assert_eq!(sensor.address(), ADDR);
        let writes = stub.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].reg, writes[0].value), (REG_CTRL_REG1, 0xC4));
    }

    #[test]
    fn test_wrong_identity_rejected() {
        let stub = Arc::new(StubI2cBus::new("stub"));
        stub.set_register(ADDR, REG_WHO_AM_I, 0xB1);
        assert!(matches!(
            Lps25hbSensor::new(config(), stub),
            Err(InitError::IdentityMismatch { found: 0xB1, .. })
        ));
    }

    #[test]
    fn test_full_read() {
        let (_stub, mut sensor) = sensor();
        let measurement = sensor.read().unwrap();
        assert_eq!(measurement.pressure_hpa, Some(1013.25));
        assert_eq!(measurement.temperature_celsius, Some(21.5));
        assert!(!measurement.has_errors());
    }

    #[test]
    fn test_pressure_failure_keeps_temperature() {
        let (stub, mut sensor) = sensor();
        stub.fail_read(ADDR, REG_PRESS_OUT_XL | AUTO_INCREMENT);

        let measurement = sensor.read().unwrap();
        assert_eq!(measurement.pressure_hpa, None);
        assert_eq!(measurement.temperature_celsius, Some(21.5));
        assert_eq!(measurement.errors.get("pressure_error").map(String::as_str), Some("Read failed"));
    }

    #[test]
    fn test_temperature_failure_keeps_pressure() {
        let (stub, mut sensor) = sensor();
        stub.truncate_reads(ADDR, REG_TEMP_OUT_L | AUTO_INCREMENT, 1);

        let measurement = sensor.read().unwrap();
        assert_eq!(measurement.pressure_hpa, Some(1013.25));
        assert_eq!(measurement.temperature_celsius, None);
        assert!(measurement.errors.contains_key("temperature_error"));
    }

    #[test]
    fn test_both_fields_failing_is_an_error() {
        let (stub, mut sensor) = sensor();
        stub.fail_read(ADDR, REG_PRESS_OUT_XL | AUTO_INCREMENT);
        stub.fail_read(ADDR, REG_TEMP_OUT_L | AUTO_INCREMENT);
        assert!(matches!(sensor.read(), Err(ReadError::AllFieldsFailed(_))));
    }
}
