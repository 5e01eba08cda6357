use sensorhub::agent::SensorHub;
use sensorhub::builder::SensorBuilder;
use sensorhub::config::{BusBackend, HubConfig};
use sensorhub::publisher::{ConnectBehavior, ConnectionState, LoopbackTransport, PublisherOptions};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

const CONFIG: &str = r#"{
    "mqtt": {
        "broker_address": "tcp://localhost:1883",
        "client_id_base": "sensorhub",
        "topic_base": "sensors"
    },
    "global_publish_interval_sec": 10,
    "sensors": [
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "env",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x76"},
        {"type": "LPS25HB", "enabled": true, "publish_topic_suffix": "baro",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x5D", "publish_interval_sec": 5},
        {"type": "Dummy", "enabled": true, "publish_topic_suffix": "dummy",
         "publish_interval_sec": 1},
        {"type": "BME280", "enabled": true, "publish_topic_suffix": "ghost",
         "i2c_bus": "/dev/i2c-1", "i2c_address": "0x40"}
    ]
}"#;

fn hub(behavior: ConnectBehavior) -> SensorHub<LoopbackTransport> {
    let config = HubConfig::from_json_str(CONFIG).unwrap();
    let options = PublisherOptions {
        connect_timeout: Duration::from_millis(200),
        max_reconnect_attempts: 0,
        ..PublisherOptions::default()
    };
    SensorHub::with_transport(
        &config,
        config.platform_name(BusBackend::Stub),
        SensorBuilder::stub(config.global_publish_interval()),
        LoopbackTransport::with_behavior(behavior),
        options,
    )
    .unwrap()
}

#[test]
fn test_hub_builds_reachable_sensors_only() {
    let hub = hub(ConnectBehavior::Accept);
    let status = hub.get_status();
    assert_eq!(status.platform, "Stub_Platform");
    assert_eq!(status.sensors, 3, "device at 0x40 does not answer");
    assert_eq!(status.buses, 1);
    assert_eq!(status.build.skipped, 1);
    assert!(!status.connected);
}

#[test]
fn test_cycle_publishes_every_sensor_once() {
    let mut hub = hub(ConnectBehavior::Accept);
    hub.start();
    assert_eq!(hub.publisher().state(), ConnectionState::Connected);

    assert_eq!(hub.run_cycle(Instant::now()), 3);
    let messages = hub.publisher().transport().messages();
    let topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(topics, vec!["sensors/env", "sensors/baro", "sensors/dummy"]);

    let baro: Value = serde_json::from_slice(&messages[1].payload).unwrap();
    assert_eq!(baro["pressure_hpa"], 1013.25);
    assert_eq!(baro["temperature_celsius"], 21.5);
    assert_eq!(baro["platform"], "Stub_Platform");
    assert_eq!(baro["sensor_type"], "LPS25HB");

    // Nobody is due again right away
    assert_eq!(hub.run_cycle(Instant::now()), 0);
}

#[test]
fn test_startup_without_broker_is_not_fatal() {
    let mut hub = hub(ConnectBehavior::Refuse);
    hub.start();
    assert!(!hub.publisher().is_connected());

    assert_eq!(hub.run_cycle(Instant::now()), 3);
    let stats = hub.get_status().scheduler;
    assert_eq!(stats.rejected, 3);
    assert_eq!(stats.published, 0);
    assert!(hub.publisher().transport().messages().is_empty());
}

#[test]
fn test_dry_run_until_stopped() {
    let config = HubConfig::from_json_str(CONFIG).unwrap();
    let mut hub = SensorHub::dry_run(&config, BusBackend::Stub).unwrap();
    let stop = hub.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::SeqCst);
    });

    hub.run();
    stopper.join().unwrap();

    assert_eq!(hub.publisher().transport().messages().len(), 3);
    assert_eq!(hub.publisher().state(), ConnectionState::Disconnected);
    assert_eq!(hub.publisher().transport().disconnects(), 1);
}
