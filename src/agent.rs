use crate::builder::{BuildStats, SensorBuilder};
use crate::config::{BusBackend, HubConfig};
use crate::error::AgentError;
use crate::publisher::{
    LoopbackTransport, MqttPublisher, MqttTransport, PublisherOptions, PublisherStats,
    RumqttTransport,
};
use crate::scheduler::{AcquisitionScheduler, SchedulerOptions, SchedulerStats};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Point-in-time view of the hub, as printed by the CLI on shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub platform: String,
    pub sensors: usize,
    pub buses: usize,
    pub connected: bool,
    pub build: BuildStats,
    pub scheduler: SchedulerStats,
    pub publisher: PublisherStats,
}

/// Owns the whole pipeline: sensors, scheduler and publisher.
///
/// Dropping the hub disconnects from the broker.
pub struct SensorHub<T: MqttTransport = RumqttTransport> {
    // Declared first so the publisher disconnects before the buses close
    publisher: MqttPublisher<T>,
    scheduler: AcquisitionScheduler,
    builder: SensorBuilder,
    platform: String,
    stop: Arc<AtomicBool>,
}

impl SensorHub<RumqttTransport> {
    /// Live hub talking to the configured broker.
    pub fn from_config(config: &HubConfig, backend: BusBackend) -> Result<Self, AgentError> {
        let platform = config.platform_name(backend);
        let transport = RumqttTransport::from_settings(&config.mqtt, &platform)?;
        let builder = SensorBuilder::for_backend(backend, config.global_publish_interval());
        Self::with_transport(
            config,
            platform,
            builder,
            transport,
            PublisherOptions::from_settings(&config.mqtt),
        )
    }
}

impl SensorHub<LoopbackTransport> {
    /// Hub whose messages are only logged.
    pub fn dry_run(config: &HubConfig, backend: BusBackend) -> Result<Self, AgentError> {
        let builder = SensorBuilder::for_backend(backend, config.global_publish_interval());
        Self::with_transport(
            config,
            config.platform_name(backend),
            builder,
            LoopbackTransport::echoing(),
            PublisherOptions::from_settings(&config.mqtt),
        )
    }
}

impl<T: MqttTransport> SensorHub<T> {
    /// Builds the sensors with `builder` and wires them to `transport`.
    ///
    /// Only a malformed `sensors` list is an error; an empty sensor set is not.
    pub fn with_transport(
        config: &HubConfig,
        platform: String,
        mut builder: SensorBuilder,
        transport: T,
        options: PublisherOptions,
    ) -> Result<Self, AgentError> {
        let sensors = builder.build_sensors(&config.sensors)?;
        if sensors.is_empty() {
            warn!("no active sensors, the hub will only keep the broker link");
        }

        let scheduler = AcquisitionScheduler::new(
            sensors,
            SchedulerOptions::new(config.mqtt.topic_base.clone(), platform.clone()),
        );
        let publisher = MqttPublisher::new(transport, options);

        info!(
            "sensor hub ready: platform {}, {} sensor(s), topic base '{}'",
            platform,
            scheduler.sensor_count(),
            config.mqtt.topic_base
        );
        Ok(Self {
            publisher,
            scheduler,
            builder,
            platform,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replaces the stop flag with one owned by the caller.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Connects once and keeps going if that fails; the scheduler asks for
    /// reconnects while readings are being dropped.
    pub fn start(&self) {
        match self.publisher.connect() {
            Ok(()) => info!("initial broker connection established"),
            Err(e) => warn!("initial broker connection failed, continuing: {}", e),
        }
    }

    /// Runs until the stop flag is set, then disconnects.
    pub fn run(&mut self) {
        self.start();
        self.scheduler.run(&self.publisher, &self.stop);
        if let Err(e) = self.publisher.disconnect() {
            warn!("disconnect at shutdown failed: {}", e);
        }
        info!("sensor hub stopped");
    }

    /// One scheduler pass without sleeping.
    pub fn run_cycle(&mut self, now: Instant) -> usize {
        self.scheduler.run_cycle(now, &self.publisher)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn publisher(&self) -> &MqttPublisher<T> {
        &self.publisher
    }

    pub fn scheduler(&self) -> &AcquisitionScheduler {
        &self.scheduler
    }

    pub fn builder(&self) -> &SensorBuilder {
        &self.builder
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn get_status(&self) -> HubStatus {
        HubStatus {
            platform: self.platform.clone(),
            sensors: self.scheduler.sensor_count(),
            buses: self.builder.bus_count(),
            connected: self.publisher.is_connected(),
            build: *self.builder.get_stats(),
            scheduler: self.scheduler.get_stats().clone(),
            publisher: self.publisher.get_stats(),
        }
    }
}

impl<T: MqttTransport> std::fmt::Debug for SensorHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHub")
            .field("platform", &self.platform)
            .field("publisher", &self.publisher)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
