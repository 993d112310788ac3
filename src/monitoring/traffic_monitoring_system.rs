use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::communication::channel::Mailbox;
use crate::communication::messages::Payload;
use crate::error::SinkError;
use crate::shared_data::{current_timestamp, MetricReport, MetricSource, SimClock, Tick};

/// One row of the append-only metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: u64,
    pub tick: Tick,
    pub source: String,
    pub intersection_id: String,
    pub vehicle_id: Option<u64>,
    pub waiting_time: f64,
    pub throughput_count: u64,
    pub queued: Option<usize>,
    pub green_phase: Option<String>,
    pub disruption_severity: Option<f64>,
    pub preempted: Option<bool>,
}

impl MetricRecord {
    pub fn from_report(report: &MetricReport, tick: Tick) -> Self {
        let mut record = MetricRecord {
            timestamp: current_timestamp(),
            tick,
            source: String::new(),
            intersection_id: report.intersection_id.to_string(),
            vehicle_id: None,
            waiting_time: report.waiting_time,
            throughput_count: report.throughput_count,
            queued: None,
            green_phase: None,
            disruption_severity: None,
            preempted: None,
        };
        match &report.source {
            MetricSource::Vehicle { vehicle_id } => {
                record.source = "vehicle".to_string();
                record.vehicle_id = Some(vehicle_id.0);
            }
            MetricSource::Controller { snapshot } => {
                record.source = "controller".to_string();
                record.queued = Some(snapshot.total_waiting());
                record.green_phase = snapshot.green_phase.clone();
                record.disruption_severity = Some(snapshot.disruption_severity);
                record.preempted = Some(snapshot.preempted);
            }
        }
        record
    }

    pub fn is_vehicle(&self) -> bool {
        self.vehicle_id.is_some()
    }
}

/// Destination for metric records. One call per event, append-only.
pub trait MetricsSink: Send {
    fn append(&mut self, record: &MetricRecord) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

/// Generic helper to log a record to a CSV file, writing the header only
/// when the file is new.
fn log_to_csv<T: Serialize>(path: &Path, record: &T) -> Result<(), SinkError> {
    let file_exists = path.exists();
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);
    wtr.serialize(record)?;
    wtr.flush()?;
    Ok(())
}

pub struct CsvMetricsSink {
    path: PathBuf,
    name: String,
}

impl CsvMetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("csv:{}", path.display());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvMetricsSink {
    fn append(&mut self, record: &MetricRecord) -> Result<(), SinkError> {
        log_to_csv(&self.path, record)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricsSink {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn append(&mut self, record: &MetricRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Totals over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub vehicles_departed: u64,
    pub mean_wait: f64,
    pub max_wait: f64,
    pub controller_reports: u64,
    pub controller_throughput: u64,
}

impl MetricsSummary {
    pub fn add(&mut self, record: &MetricRecord) {
        if record.is_vehicle() {
            let n = self.vehicles_departed as f64;
            self.mean_wait = (self.mean_wait * n + record.waiting_time) / (n + 1.0);
            self.max_wait = self.max_wait.max(record.waiting_time);
            self.vehicles_departed += 1;
        } else {
            self.controller_reports += 1;
            self.controller_throughput += record.throughput_count;
        }
    }
}

pub fn summarize(records: &[MetricRecord]) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    for record in records {
        summary.add(record);
    }
    summary
}

/// Appends every `METRIC_REPORT` that reaches `mailbox` to all sinks until
/// the mailbox closes. A failing sink is logged and skipped for that record.
pub async fn run_metrics_collector(
    mut sinks: Vec<Box<dyn MetricsSink>>,
    mut mailbox: Mailbox,
    clock: SimClock,
) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    while let Some(envelope) = mailbox.recv().await {
        let Payload::MetricReport(report) = &envelope.payload else {
            warn!(
                "Metrics collector ignored {} from {}",
                envelope.message_type(),
                envelope.from
            );
            continue;
        };
        let record = MetricRecord::from_report(report, clock.now());
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.append(&record) {
                warn!("Metrics sink {} failed: {}", sink.name(), e);
            }
        }
        summary.add(&record);
    }
    info!(
        "Metrics collector stopped: {} departures, mean wait {:.2} ticks",
        summary.vehicles_departed, summary.mean_wait
    );
    summary
}
