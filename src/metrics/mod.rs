//! Metrics reporting and export.

mod exporter;
mod instrumenter;

pub use exporter::MetricsExporter;
pub use instrumenter::{HitStatus, Instrumenter, NoopInstrumenter, PrometheusInstrumenter};
