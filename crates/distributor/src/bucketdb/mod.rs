//! Bucket database: per-bucket replica sets built from node reports

mod database;
mod report;

pub use database::{BucketDatabase, BucketRange, BucketSnapshot, UpdateOutcome};
pub use report::{
    report_channel, spawn_report_applier, BucketReport, ReportError, ReportSink,
    REPORT_CHANNEL_CAPACITY,
};
