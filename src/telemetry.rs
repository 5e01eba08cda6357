//! Measurement enrichment: stamps a reading with its metadata and topic.

use crate::sensors::Measurement;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One enriched reading ready for the publisher. Built per due sensor per
/// tick and dropped right after the publish attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PublishJob {
    #[serde(flatten)]
    pub measurement: Measurement,
    pub timestamp: String,
    pub platform: String,
    pub sensor_type: String,
    pub topic_suffix: String,
    #[serde(skip)]
    pub topic: String,
}

impl PublishJob {
    pub fn new(
        measurement: Measurement,
        sensor_type: &str,
        topic_suffix: &str,
        topic_base: &str,
        platform: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            measurement,
            timestamp: format_timestamp(at),
            platform: platform.to_string(),
            sensor_type: sensor_type.to_string(),
            topic_suffix: topic_suffix.to_string(),
            topic: join_topic(topic_base, topic_suffix),
        }
    }

    /// JSON body published on [`PublishJob::topic`].
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn join_topic(base: &str, suffix: &str) -> String {
    format!("{}/{}", base, suffix)
}
