use sensorhub::builder::SensorBuilder;
use sensorhub::bus::{SharedBus, StubI2cBus};
use sensorhub::error::{BusError, ConfigError};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GLOBAL_INTERVAL: Duration = Duration::from_secs(10);

/// Builder whose factory hands out seeded stubs and remembers every one.
fn recording_builder() -> (SensorBuilder, Arc<Mutex<Vec<SharedBus>>>) {
    let opened: Arc<Mutex<Vec<SharedBus>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&opened);
    let builder = SensorBuilder::new(
        Box::new(move |path: &str| -> Result<SharedBus, BusError> {
            let bus: SharedBus = Arc::new(StubI2cBus::new(path));
            log.lock().unwrap().push(Arc::clone(&bus));
            Ok(bus)
        }),
        GLOBAL_INTERVAL,
    );
    (builder, opened)
}

#[test]
fn test_builder_continues_after_failed_entry() {
    let mut builder = SensorBuilder::stub(GLOBAL_INTERVAL);
    let entries = json!([
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "env",
         "i2c_bus": "/dev/i2c-1"},
        {"type": "Dummy", "enabled": true, "publish_topic_suffix": "dummy"},
        {"type": "LPS25HB", "enabled": true, "publish_topic_suffix": "baro",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x5D", "publish_interval_sec": 3}
    ]);

    let sensors = builder.build_sensors(&entries).unwrap();
    assert_eq!(sensors.len(), 2);
    assert_eq!(sensors[0].sensor_type(), "Dummy");
    assert_eq!(sensors[0].publish_interval(), GLOBAL_INTERVAL);
    assert_eq!(sensors[1].sensor_type(), "LPS25HB");
    assert_eq!(sensors[1].publish_interval(), Duration::from_secs(3));
    assert_eq!(builder.get_stats().skipped, 1);
}

#[test]
fn test_entries_on_same_bus_share_one_handle() {
    let (mut builder, opened) = recording_builder();
    let entries = json!([
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "env",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x76"},
        {"type": "LPS25HB", "enabled": true, "publish_topic_suffix": "baro",
         "i2c_bus": "/dev/i2c-1", "i2c_address": 93},
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "env2",
         "i2c_bus": "/dev/i2c-0", "i2c_address": "0x77"}
    ]);

    let sensors = builder.build_sensors(&entries).unwrap();
    assert_eq!(sensors.len(), 3);
    assert_eq!(builder.bus_count(), 2);

    let opened = opened.lock().unwrap();
    assert_eq!(opened.len(), 2, "one factory call per distinct bus id");

    let bus1 = builder.bus("/dev/i2c-1").unwrap();
    let bus0 = builder.bus("/dev/i2c-0").unwrap();
    assert!(Arc::ptr_eq(&bus1, &opened[0]));
    assert!(Arc::ptr_eq(&bus0, &opened[1]));
    // Builder cache, two sensors and the recording vector
    assert_eq!(Arc::strong_count(&bus1), 5);
}

#[test]
fn test_identity_mismatch_excludes_sensor() {
    let builder_stub = Arc::new(StubI2cBus::new("/dev/i2c-1"));
    builder_stub.set_register(0x76, 0xD0, 0x58);
    let shared: SharedBus = builder_stub.clone();
    let mut builder = SensorBuilder::new(
        Box::new(move |_: &str| -> Result<SharedBus, BusError> { Ok(Arc::clone(&shared)) }),
        GLOBAL_INTERVAL,
    );
    let entries = json!([
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "env",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x76"},
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "env2",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x77"}
    ]);

    let sensors = builder.build_sensors(&entries).unwrap();
    assert_eq!(sensors.len(), 1);
    assert_eq!(sensors[0].topic_suffix(), "env2");
    // The failed sensor never got to its configuration writes
    assert!(builder_stub.writes().iter().all(|w| w.addr == 0x77));
}

#[test]
fn test_unknown_and_disabled_entries_are_skipped() {
    let mut builder = SensorBuilder::stub(GLOBAL_INTERVAL);
    let entries = json!([
        {"type": "DHT22", "enabled": true, "publish_topic_suffix": "dht", "gpio_pin": 4},
        {"type": "BME280", "publish_topic_suffix": "env", "i2c_bus": "/dev/i2c-1",
         "i2c_address": "0x76"},
        {"type": "Dummy", "enabled": true, "publish_topic_suffix": "dummy"}
    ]);

    let sensors = builder.build_sensors(&entries).unwrap();
    assert_eq!(sensors.len(), 1);
    assert_eq!(builder.get_stats().disabled, 1);
    assert_eq!(builder.get_stats().skipped, 1);
    assert_eq!(builder.bus_count(), 0, "disabled entry must not open its bus");
}

#[test]
fn test_non_array_sensor_list_is_fatal() {
    let mut builder = SensorBuilder::stub(GLOBAL_INTERVAL);
    let result = builder.build_sensors(&json!({"type": "Dummy"}));
    assert!(matches!(result, Err(ConfigError::NotAnArray)));
}

#[test]
fn test_empty_list_is_valid() {
    let mut builder = SensorBuilder::stub(GLOBAL_INTERVAL);
    let sensors = builder.build_sensors(&json!([])).unwrap();
    assert!(sensors.is_empty());
}

#[test]
fn test_invalid_addresses_rejected() {
    let mut builder = SensorBuilder::stub(GLOBAL_INTERVAL);
    let entries = json!([
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "a",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x00"},
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "b",
         "i2c_bus": "/dev/i2c-1", "i2c_address": 300},
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "c",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "76"}
    ]);
    assert!(builder.build_sensors(&entries).unwrap().is_empty());
    assert_eq!(builder.get_stats().skipped, 3);
}
