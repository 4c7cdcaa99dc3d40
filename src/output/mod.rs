//! Report writing and progress display.

pub mod progress;
mod report;

pub use report::{ImageReport, ReportSummary};
