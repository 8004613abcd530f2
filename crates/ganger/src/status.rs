//! Status-reply value types.
//!
//! A shared worker answers queries with a [`WorkerStatus`]: free-form text
//! plus named numeric counters with optional bounds. On the wire these
//! serialize with camelCase keys (`textStatus`) inside the status envelope.

use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Anchor the wall-execution-time counter; called from the runtime entry
/// points so the measurement starts near actual process start.
pub(crate) fn mark_process_start() {
    Lazy::force(&PROCESS_START);
}

/// One named numeric counter with optional unit and acceptance bounds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCounter {
    pub name: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl WorkerCounter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Counters every worker can report: wall execution time and, where the
    /// platform exposes it, resident memory usage.
    pub fn system_counters() -> Vec<WorkerCounter> {
        let mut counters = vec![
            WorkerCounter::new("sys_wall_execution_time", PROCESS_START.elapsed().as_secs_f64())
                .with_unit("s")
                .with_bounds(Some(0.0), None),
        ];
        if let Some(bytes) = resident_memory_bytes() {
            counters.push(
                WorkerCounter::new("sys_memory_usage", bytes)
                    .with_unit("B")
                    .with_bounds(Some(0.0), None),
            );
        }
        counters
    }
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<f64> {
    None
}

/// The payload of a status reply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerStatus {
    pub text_status: Option<String>,
    pub counters: Vec<WorkerCounter>,
}

impl WorkerStatus {
    pub fn new(text_status: Option<String>, counters: Vec<WorkerCounter>) -> Self {
        Self {
            text_status,
            counters,
        }
    }

    /// Decode a status payload from a generic wire value. Missing fields
    /// default; anything that is not an object is not a status.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl From<&str> for WorkerStatus {
    fn from(text: &str) -> Self {
        WorkerStatus::new(Some(text.to_owned()), Vec::new())
    }
}

impl From<String> for WorkerStatus {
    fn from(text: String) -> Self {
        WorkerStatus::new(Some(text), Vec::new())
    }
}

impl From<Vec<WorkerCounter>> for WorkerStatus {
    fn from(counters: Vec<WorkerCounter>) -> Self {
        WorkerStatus::new(None, counters)
    }
}
