//! Usage events

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use testbridge_common::TestProvider;
use tracing::info;

pub const DISCOVERY_START: &str = "testing.discovery.start";
pub const DISCOVERY_DONE: &str = "testing.discovery.done";
pub const EXECUTION_FAILED: &str = "testing.execution.failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub name: &'static str,
    pub properties: BTreeMap<&'static str, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            properties: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key, value.into());
        self
    }

    pub fn discovery_start(tool: TestProvider) -> Self {
        Self::new(DISCOVERY_START).with("tool", tool.to_string())
    }

    pub fn discovery_done(tool: TestProvider, failed: bool) -> Self {
        Self::new(DISCOVERY_DONE)
            .with("tool", tool.to_string())
            .with("failed", failed)
    }

    pub fn execution_failed(tool: TestProvider, cancelled: bool) -> Self {
        Self::new(EXECUTION_FAILED)
            .with("tool", tool.to_string())
            .with("cancelled", cancelled)
    }
}

pub trait TelemetrySink: Send + Sync {
    fn send(&self, event: TelemetryEvent);
}

/// Logs events under the `testbridge::telemetry` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn send(&self, event: TelemetryEvent) {
        let properties = serde_json::to_string(&event.properties).unwrap_or_default();
        info!(target: "testbridge::telemetry", "{} {}", event.name, properties);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn send(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
