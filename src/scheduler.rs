use crate::error::PublishError;
use crate::sensors::Sensor;
use crate::telemetry::PublishJob;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_TICK_MS: u64 = 100;
/// Per-sensor intervals are whole seconds, so one second is the floor.
pub const MIN_PUBLISH_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_CHECK_SECS: u64 = 5;

// The tick must stay strictly below any sensor's own interval
const_assert!(DEFAULT_TICK_MS < MIN_PUBLISH_INTERVAL_MS);

/// Where enriched readings go. Implemented by the MQTT publisher.
pub trait MeasurementSink {
    fn is_connected(&self) -> bool;

    /// Hands one payload to the transport. Must not block on the network.
    fn submit(&self, topic: &str, payload: &str) -> Result<(), PublishError>;

    /// Asks for a reconnect attempt without waiting for its outcome.
    fn request_reconnect(&self);
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: Duration,
    pub topic_base: String,
    pub platform: String,
    pub reconnect_check_interval: Duration,
}

impl SchedulerOptions {
    pub fn new(topic_base: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            topic_base: topic_base.into(),
            platform: platform.into(),
            reconnect_check_interval: Duration::from_secs(DEFAULT_RECONNECT_CHECK_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub reads_attempted: u64,
    pub read_failures: u64,
    pub published: u64,
    pub rejected: u64,
    pub reconnect_requests: u64,
    pub cycles: u64,
}

struct Slot {
    sensor: Box<dyn Sensor>,
    interval: Duration,
    next_due: Instant,
}

/// Polls each enrolled sensor on its own interval from a single loop.
pub struct AcquisitionScheduler {
    slots: Vec<Slot>,
    options: SchedulerOptions,
    tick: Duration,
    stats: SchedulerStats,
    last_reconnect_request: Option<Instant>,
}

impl AcquisitionScheduler {
    /// Every sensor becomes due immediately.
    pub fn new(sensors: Vec<Box<dyn Sensor>>, options: SchedulerOptions) -> Self {
        Self::starting_at(sensors, options, Instant::now())
    }

    pub fn starting_at(sensors: Vec<Box<dyn Sensor>>, options: SchedulerOptions, now: Instant) -> Self {
        let slots: Vec<Slot> = sensors
            .into_iter()
            .map(|sensor| Slot {
                interval: sensor.publish_interval(),
                next_due: now,
                sensor,
            })
            .collect();

        let tick = clamp_tick(options.tick, slots.iter().map(|s| s.interval).min());
        if tick != options.tick {
            warn!(
                "scheduler tick {:?} clamped to {:?} to stay below the shortest interval",
                options.tick, tick
            );
        }

        Self {
            slots,
            options,
            tick,
            stats: SchedulerStats::default(),
            last_reconnect_request: None,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn sensor_count(&self) -> usize {
        self.slots.len()
    }

    pub fn next_due(&self, index: usize) -> Option<Instant> {
        self.slots.get(index).map(|slot| slot.next_due)
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// One pass over the enrolled sensors. Returns how many were read.
    pub fn run_cycle(&mut self, now: Instant, sink: &dyn MeasurementSink) -> usize {
        self.stats.cycles += 1;
        let mut reads = 0;

        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if !slot.sensor.is_enabled() || now < slot.next_due {
                continue;
            }

            reads += 1;
            self.stats.reads_attempted += 1;
            let result = slot.sensor.read();
            slot.next_due = now + slot.interval;

            match result {
                Ok(measurement) => {
                    let job = PublishJob::new(
                        measurement,
                        slot.sensor.sensor_type(),
                        slot.sensor.topic_suffix(),
                        &self.options.topic_base,
                        &self.options.platform,
                        Utc::now(),
                    );
                    self.dispatch(job, now, sink);
                }
                Err(e) => {
                    self.stats.read_failures += 1;
                    warn!(
                        "failed to read {} ({}): {}",
                        slot.sensor.sensor_type(),
                        slot.sensor.topic_suffix(),
                        e
                    );
                }
            }
        }

        // Checked every cycle, even when nothing was read
        if !sink.is_connected() {
            self.maybe_request_reconnect(now, sink);
        }
        reads
    }

    fn dispatch(&mut self, job: PublishJob, now: Instant, sink: &dyn MeasurementSink) {
        if !sink.is_connected() {
            self.stats.rejected += 1;
            warn!("publisher disconnected, dropping reading for {}", job.topic);
            return;
        }

        let payload = match job.payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.rejected += 1;
                warn!("failed to serialize reading for {}: {}", job.topic, e);
                return;
            }
        };

        match sink.submit(&job.topic, &payload) {
            Ok(()) => {
                self.stats.published += 1;
                debug!("queued {} bytes on {}", payload.len(), job.topic);
            }
            Err(PublishError::NotConnected) => {
                self.stats.rejected += 1;
                warn!("publisher dropped the link, reading for {} lost", job.topic);
                self.maybe_request_reconnect(now, sink);
            }
            Err(e) => {
                self.stats.rejected += 1;
                warn!("publish to {} failed: {}", job.topic, e);
            }
        }
    }

    fn maybe_request_reconnect(&mut self, now: Instant, sink: &dyn MeasurementSink) {
        let due = self.last_reconnect_request.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.options.reconnect_check_interval
        });
        if due {
            self.last_reconnect_request = Some(now);
            self.stats.reconnect_requests += 1;
            info!("requesting publisher reconnect");
            sink.request_reconnect();
        }
    }

    /// Ticks until `stop` is set. The flag is checked once per tick.
    pub fn run(&mut self, sink: &dyn MeasurementSink, stop: &AtomicBool) {
        info!(
            "acquisition loop started: {} sensor(s), tick {:?}",
            self.slots.len(),
            self.tick
        );
        while !stop.load(Ordering::SeqCst) {
            self.run_cycle(Instant::now(), sink);
            std::thread::sleep(self.tick);
        }
        info!(
            "acquisition loop stopped: {} reads, {} failures, {} published, {} rejected",
            self.stats.reads_attempted,
            self.stats.read_failures,
            self.stats.published,
            self.stats.rejected
        );
    }
}

/// Keeps `requested` strictly below the shortest enrolled interval.
fn clamp_tick(requested: Duration, shortest: Option<Duration>) -> Duration {
    match shortest {
        Some(shortest) if requested >= shortest => shortest / 2,
        _ => requested,
    }
}

impl std::fmt::Debug for AcquisitionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionScheduler")
            .field("sensors", &self.slots.len())
            .field("tick", &self.tick)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_clamp() {
        let tick = Duration::from_millis(DEFAULT_TICK_MS);
        assert_eq!(clamp_tick(tick, None), tick);
        assert_eq!(clamp_tick(tick, Some(Duration::from_secs(1))), tick);
        assert_eq!(
            clamp_tick(Duration::from_secs(2), Some(Duration::from_secs(1))),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_default_options() {
        let options = SchedulerOptions::new("sensors", "Stub_Platform");
        assert_eq!(options.tick, Duration::from_millis(100));
        assert_eq!(options.reconnect_check_interval, Duration::from_secs(5));
    }
}
