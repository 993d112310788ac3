pub mod traffic_monitoring_system;

pub use traffic_monitoring_system::{
    run_metrics_collector, summarize, CsvMetricsSink, MemoryMetricsSink, MetricRecord,
    MetricsSink, MetricsSummary,
};
