//! Batch import of browser bookmark exports.
//!
//! A job owns one item per submitted entry. The job driver turns pending
//! items into bookmarks in submission order; enrichments it requests run as
//! separate queue tasks and report back through
//! [`ImportManager::on_enrichment_finished`].

pub mod formats;
pub mod job;
mod manager;

pub use formats::{parse_export, should_enrich, ImportEntry, ImportRequest};
pub use job::{ImportJob, ImportJobItem, ItemEnrichment, ItemStatus, JobStatus};
pub use manager::{
    EnrichRequest, ImportJobView, ImportManager, ImportRecovery, ImportSubmitted, ItemsQuery,
};
