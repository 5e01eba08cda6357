//! Bosch BME280 pressure / temperature / humidity decoder.
//!
//! Compensation follows the floating point formulas published in the BME280
//! datasheet (section 8.1), with the coefficient layout of section 4.2.2.

use super::{Measurement, Sensor};
use crate::bus::{read_exact_block, SharedBus};
use crate::config::SensorConfig;
use crate::error::{InitError, ReadError};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_ADDRESS: u8 = 0x76;

pub const REG_CHIP_ID: u8 = 0xD0;
pub const REG_CTRL_HUM: u8 = 0xF2;
pub const REG_CTRL_MEAS: u8 = 0xF4;
pub const REG_CONFIG: u8 = 0xF5;
pub const REG_CALIB_T1_LSB: u8 = 0x88;
pub const REG_CALIB_H1: u8 = 0xA1;
pub const REG_CALIB_H2_LSB: u8 = 0xE1;
pub const REG_PRESS_MSB: u8 = 0xF7;

pub const CHIP_ID: u8 = 0x60;

/// Humidity oversampling x1.
pub const CTRL_HUM_SETTINGS: u8 = 0x01;
/// Standby 1000 ms, filter off, SPI 3-wire off.
pub const CONFIG_SETTINGS: u8 = (0b101 << 5) | (0b000 << 2);
/// Temperature x1, pressure x1, normal mode.
pub const CTRL_MEAS_SETTINGS: u8 = (0b001 << 5) | (0b001 << 2) | 0b11;

pub const TP_CALIB_LEN: usize = 24;
pub const H_CALIB_LEN: usize = 7;
pub const MEASUREMENT_LEN: usize = 8;

const ADC_20BIT_SENTINEL: i32 = 0x80000;
const ADC_16BIT_SENTINEL: i32 = 0x8000;

const CONFIG_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationCoefficients {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,
    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,
    pub dig_h1: u8,
    pub dig_h2: i16,
    pub dig_h3: u8,
    pub dig_h4: i16,
    pub dig_h5: i16,
    pub dig_h6: i8,
}

fn le_u16(block: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([block[at], block[at + 1]])
}

fn le_i16(block: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([block[at], block[at + 1]])
}

impl CalibrationCoefficients {
    /// `tp` is the 24-byte block at 0x88, `h1` the byte at 0xA1 and `h` the
    /// 7-byte block at 0xE1.
    pub fn parse(tp: &[u8; TP_CALIB_LEN], h1: u8, h: &[u8; H_CALIB_LEN]) -> Self {
        Self {
            dig_t1: le_u16(tp, 0),
            dig_t2: le_i16(tp, 2),
            dig_t3: le_i16(tp, 4),
            dig_p1: le_u16(tp, 6),
            dig_p2: le_i16(tp, 8),
            dig_p3: le_i16(tp, 10),
            dig_p4: le_i16(tp, 12),
            dig_p5: le_i16(tp, 14),
            dig_p6: le_i16(tp, 16),
            dig_p7: le_i16(tp, 18),
            dig_p8: le_i16(tp, 20),
            dig_p9: le_i16(tp, 22),
            dig_h1: h1,
            dig_h2: le_i16(h, 0),
            dig_h3: h[2],
            // H4 and H5 share the nibbles of 0xE5
            dig_h4: (i16::from(h[3]) << 4) | i16::from(h[4] & 0x0F),
            dig_h5: (i16::from(h[5]) << 4) | i16::from(h[4] >> 4),
            dig_h6: h[6] as i8,
        }
    }

    /// Returns degrees Celsius and `t_fine`, which pressure and humidity need.
    pub fn compensate_temperature(&self, adc_t: i32) -> (f64, i32) {
        let adc_t = f64::from(adc_t);
        let t1 = f64::from(self.dig_t1);
        let var1 = (adc_t / 16384.0 - t1 / 1024.0) * f64::from(self.dig_t2);
        let delta = adc_t / 131072.0 - t1 / 8192.0;
        let var2 = delta * delta * f64::from(self.dig_t3);
        let t_fine = (var1 + var2) as i32;
        ((var1 + var2) / 5120.0, t_fine)
    }

    /// Pressure in Pa. Exactly 0 when the coefficient-derived denominator is 0.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: i32) -> f64 {
        let mut var1 = f64::from(t_fine) / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * f64::from(self.dig_p6) / 32768.0;
        var2 += var1 * f64::from(self.dig_p5) * 2.0;
        var2 = var2 / 4.0 + f64::from(self.dig_p4) * 65536.0;
        var1 = (f64::from(self.dig_p3) * var1 * var1 / 524288.0 + f64::from(self.dig_p2) * var1)
            / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * f64::from(self.dig_p1);
        if var1 == 0.0 {
            return 0.0;
        }
        let mut p = 1048576.0 - f64::from(adc_p);
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        var1 = f64::from(self.dig_p9) * p * p / 2147483648.0;
        var2 = p * f64::from(self.dig_p8) / 32768.0;
        p + (var1 + var2 + f64::from(self.dig_p7)) / 16.0
    }

    /// Relative humidity in %, clamped to [0, 100].
    pub fn compensate_humidity(&self, adc_h: i32, t_fine: i32) -> f64 {
        let mut var_h = f64::from(t_fine) - 76800.0;
        if var_h == 0.0 {
            return 0.0;
        }
        var_h = (f64::from(adc_h)
            - (f64::from(self.dig_h4) * 64.0 + f64::from(self.dig_h5) / 16384.0 * var_h))
            * (f64::from(self.dig_h2) / 65536.0
                * (1.0
                    + f64::from(self.dig_h6) / 67108864.0
                        * var_h
                        * (1.0 + f64::from(self.dig_h3) / 67108864.0 * var_h)));
        var_h *= 1.0 - f64::from(self.dig_h1) * var_h / 524288.0;
        var_h.clamp(0.0, 100.0)
    }

    /// Temperature first; its `t_fine` feeds the other two.
    pub fn compensate(&self, raw: RawSample) -> Measurement {
        let (temperature, t_fine) = self.compensate_temperature(raw.temperature);
        let pressure_pa = self.compensate_pressure(raw.pressure, t_fine);
        let humidity = self.compensate_humidity(raw.humidity, t_fine);
        Measurement {
            temperature_celsius: Some(temperature),
            humidity_percent: Some(humidity),
            pressure_hpa: Some(pressure_pa / 100.0),
            ..Measurement::default()
        }
    }
}

/// ADC codes unpacked from the 8-byte burst at 0xF7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub pressure: i32,
    pub temperature: i32,
    pub humidity: i32,
}

impl RawSample {
    pub fn from_bytes(raw: &[u8; MEASUREMENT_LEN]) -> Self {
        let adc20 = |msb: u8, lsb: u8, xlsb: u8| {
            (i32::from(msb) << 12) | (i32::from(lsb) << 4) | (i32::from(xlsb) >> 4)
        };
        Self {
            pressure: adc20(raw[0], raw[1], raw[2]),
            temperature: adc20(raw[3], raw[4], raw[5]),
            humidity: (i32::from(raw[6]) << 8) | i32::from(raw[7]),
        }
    }

    /// False if any field still holds the "not yet converted" pattern.
    pub fn is_converted(&self) -> bool {
        self.pressure != ADC_20BIT_SENTINEL
            && self.temperature != ADC_20BIT_SENTINEL
            && self.humidity != ADC_16BIT_SENTINEL
    }
}

pub struct Bme280Sensor {
    config: SensorConfig,
    bus: SharedBus,
    address: u8,
    calibration: CalibrationCoefficients,
}

impl Bme280Sensor {
    /// Checks the chip id, reads calibration once and configures the device.
    pub fn new(config: SensorConfig, bus: SharedBus) -> Result<Self, InitError> {
        if !config.enabled {
            return Err(InitError::Disabled);
        }
        let address = config.i2c_address;
        if address == 0 {
            return Err(InitError::InvalidAddress(address));
        }

        check_chip_id(&bus, address)?;
        let calibration = read_calibration(&bus, address)?;
        configure(&bus, address)?;

        info!(
            "BME280 initialized at 0x{:02x} on bus '{}'",
            address,
            bus.bus_path()
        );
        Ok(Self {
            config,
            bus,
            address,
            calibration,
        })
    }

    pub fn calibration(&self) -> &CalibrationCoefficients {
        &self.calibration
    }

    pub fn address(&self) -> u8 {
        self.address
    }
}

fn check_chip_id(bus: &SharedBus, address: u8) -> Result<(), InitError> {
    let found = bus
        .read_register(address, REG_CHIP_ID)
        .map_err(InitError::Identity)?;
    if found != CHIP_ID {
        return Err(InitError::IdentityMismatch {
            addr: address,
            expected: CHIP_ID,
            found,
        });
    }
    Ok(())
}

fn read_calibration(bus: &SharedBus, address: u8) -> Result<CalibrationCoefficients, InitError> {
    let tp = read_exact_block(bus.as_ref(), address, REG_CALIB_T1_LSB, TP_CALIB_LEN)
        .map_err(InitError::Calibration)?;
    let h1 = bus
        .read_register(address, REG_CALIB_H1)
        .map_err(InitError::Calibration)?;
    let h = read_exact_block(bus.as_ref(), address, REG_CALIB_H2_LSB, H_CALIB_LEN)
        .map_err(InitError::Calibration)?;

    let mut tp_block = [0u8; TP_CALIB_LEN];
    tp_block.copy_from_slice(&tp);
    let mut h_block = [0u8; H_CALIB_LEN];
    h_block.copy_from_slice(&h);
    Ok(CalibrationCoefficients::parse(&tp_block, h1, &h_block))
}

fn configure(bus: &SharedBus, address: u8) -> Result<(), InitError> {
    // ctrl_meas goes last: writing it commits ctrl_hum and config
    for (reg, value) in [
        (REG_CTRL_HUM, CTRL_HUM_SETTINGS),
        (REG_CONFIG, CONFIG_SETTINGS),
        (REG_CTRL_MEAS, CTRL_MEAS_SETTINGS),
    ] {
        bus.write_register(address, reg, value)
            .map_err(InitError::Configure)?;
    }
    std::thread::sleep(CONFIG_SETTLE);
    Ok(())
}

impl Sensor for Bme280Sensor {
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
        let data = read_exact_block(self.bus.as_ref(), self.address, REG_PRESS_MSB, MEASUREMENT_LEN)?;
        let mut raw = [0u8; MEASUREMENT_LEN];
        raw.copy_from_slice(&data);

        let sample = RawSample::from_bytes(&raw);
        if !sample.is_converted() {
            warn!(
                "BME280 at 0x{:02x} returned sentinel data, conversion not complete",
                self.address
            );
            return Err(ReadError::NotReady);
        }
        Ok(self.calibration.compensate(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota<const N: usize>(start: u8) -> [u8; N] {
        let mut block = [0u8; N];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = start.wrapping_add(i as u8);
        }
        block
    }

    fn reference_calibration() -> CalibrationCoefficients {
        CalibrationCoefficients::parse(&iota::<TP_CALIB_LEN>(0x10), 0x7F, &iota::<H_CALIB_LEN>(0xE0))
    }

    #[test]
    fn test_calibration_layout() {
        let calib = reference_calibration();
        assert_eq!(calib.dig_t1, 0x1110);
        assert_eq!(calib.dig_t2, 0x1312);
        assert_eq!(calib.dig_p1, 0x1716);
        assert_eq!(calib.dig_p9, 0x2726);
        assert_eq!(calib.dig_h1, 0x7F);
        assert_eq!(calib.dig_h2, i16::from_le_bytes([0xE0, 0xE1]));
        assert_eq!(calib.dig_h3, 0xE2);
        assert_eq!(calib.dig_h4, (0xE3 << 4) | 0x04);
        assert_eq!(calib.dig_h5, (0xE5 << 4) | 0x0E);
        assert_eq!(calib.dig_h6, 0xE6u8 as i8);
    }

    #[test]
    fn test_reference_bytes_decode_into_range() {
        let calib = reference_calibration();
        let raw = RawSample::from_bytes(&[0x80, 0x6A, 0x00, 0x50, 0x00, 0x00, 0x7F, 0xFF]);
        assert_eq!(raw.pressure, 0x806A0);
        assert_eq!(raw.temperature, 0x50000);
        assert_eq!(raw.humidity, 0x7FFF);
        assert!(raw.is_converted());

        let measurement = calib.compensate(raw);
        let temperature = measurement.temperature_celsius.unwrap();
        let humidity = measurement.humidity_percent.unwrap();
        assert!((-40.0..=85.0).contains(&temperature), "temperature {}", temperature);
        assert!((0.0..=100.0).contains(&humidity), "humidity {}", humidity);
        assert!((temperature - 19.08).abs() < 0.05, "temperature {}", temperature);
    }

    #[test]
    fn test_sentinels_mark_sample_unconverted() {
        let all = RawSample::from_bytes(&[0x80, 0x00, 0x00, 0x80, 0x00, 0x00, 0x80, 0x00]);
        assert!(!all.is_converted());

        let only_pressure = RawSample::from_bytes(&[0x80, 0x00, 0x00, 0x50, 0x00, 0x00, 0x7F, 0xFF]);
        assert!(!only_pressure.is_converted());

        let only_temperature = RawSample::from_bytes(&[0x80, 0x6A, 0x00, 0x80, 0x00, 0x00, 0x7F, 0xFF]);
        assert!(!only_temperature.is_converted());

        let only_humidity = RawSample::from_bytes(&[0x80, 0x6A, 0x00, 0x50, 0x00, 0x00, 0x80, 0x00]);
        assert!(!only_humidity.is_converted());
    }

    #[test]
    fn test_pressure_zero_denominator_returns_zero() {
        let calib = CalibrationCoefficients {
            dig_p1: 0,
            ..reference_calibration()
        };
        assert_eq!(calib.compensate_pressure(0x806A0, 100_000), 0.0);
    }

    #[test]
    fn test_humidity_zero_term_and_clamp() {
        let calib = reference_calibration();
        assert_eq!(calib.compensate_humidity(0x7FFF, 76800), 0.0);

        for adc_h in [0, 0x1000, 0x7FFF, 0xFFFF] {
            for t_fine in [-200_000, 0, 100_000, 300_000] {
                let h = calib.compensate_humidity(adc_h, t_fine);
                assert!((0.0..=100.0).contains(&h), "humidity {} for {}/{}", h, adc_h, t_fine);
            }
        }
    }

    #[test]
    fn test_settings_constants() {
        assert_eq!(CONFIG_SETTINGS, 0xA0);
        assert_eq!(CTRL_MEAS_SETTINGS, 0x27);
    }

    mod device {
        use super::super::*;
        use crate::bus::StubI2cBus;
        use std::sync::Arc;

        fn config(address: u8) -> SensorConfig {
            SensorConfig {
                sensor_type: "BME280".to_string(),
                enabled: true,
                topic_suffix: "bme280/data".to_string(),
                publish_interval: Duration::from_secs(10),
                i2c_bus: Some("stub".to_string()),
                i2c_address: address,
                gpio_pin: None,
            }
        }

        #[test]
        fn test_init_writes_configuration_in_order() {
            let stub = Arc::new(StubI2cBus::new("stub"));
            let sensor = Bme280Sensor::new(config(0x76), stub.clone()).unwrap();
            assert_eq!(sensor.address(), 0x76);

            let writes: Vec<(u8, u8)> = stub
                .writes()
                .iter()
                .filter(|w| w.addr == 0x76)
                .map(|w| (w.reg, w.value))
                .collect();
            assert_eq!(writes, vec![(0xF2, 0x01), (0xF5, 0xA0), (0xF4, 0x27)]);
        }

        #[test]
        fn test_identity_mismatch_rejected() {
            let stub = Arc::new(StubI2cBus::new("stub"));
            stub.set_register(0x76, REG_CHIP_ID, 0x58);
            match Bme280Sensor::new(config(0x76), stub.clone()) {
                Err(InitError::IdentityMismatch { addr, expected, found }) => {
                    assert_eq!((addr, expected, found), (0x76, 0x60, 0x58));
                }
                other => panic!("expected identity mismatch, got {:?}", other.err()),
            }
            assert!(stub.writes().is_empty());
        }

        #[test]
        fn test_short_calibration_read_fails_init() {
            let stub = Arc::new(StubI2cBus::new("stub"));
            stub.truncate_reads(0x77, REG_CALIB_T1_LSB, 20);
            assert!(matches!(
                Bme280Sensor::new(config(0x77), stub),
                Err(InitError::Calibration(_))
            ));
        }

        #[test]
        fn test_read_stub_measurement() {
            let stub = Arc::new(StubI2cBus::new("stub"));
            let mut sensor = Bme280Sensor::new(config(0x76), stub).unwrap();
            let measurement = sensor.read().unwrap();

            let temperature = measurement.temperature_celsius.unwrap();
            assert!((temperature - 29.65).abs() < 0.1, "temperature {}", temperature);
            assert!(measurement.pressure_hpa.is_some());
            let humidity = measurement.humidity_percent.unwrap();
            assert!((0.0..=100.0).contains(&humidity));
            assert!(!measurement.has_errors());
        }

        #[test]
        fn test_sentinel_read_is_not_ready() {
            let stub = Arc::new(StubI2cBus::new("stub"));
            let mut sensor = Bme280Sensor::new(config(0x76), stub.clone()).unwrap();
            stub.set_block(0x76, REG_PRESS_MSB, &[0x80, 0x00, 0x00, 0x6A, 0xBC, 0xD0, 0x7F, 0x80]);
            assert!(matches!(sensor.read(), Err(ReadError::NotReady)));
        }

        #[test]
        fn test_bus_failure_surfaces_as_read_error() {
            let stub = Arc::new(StubI2cBus::new("stub"));
            let mut sensor = Bme280Sensor::new(config(0x76), stub.clone()).unwrap();
            stub.fail_read(0x76, REG_PRESS_MSB);
            assert!(matches!(sensor.read(), Err(ReadError::Bus(_))));

            stub.clear_faults();
            assert!(sensor.read().is_ok());
        }
    }
}
