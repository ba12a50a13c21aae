use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
    Canceled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Pending | ItemStatus::Processing)
    }
}

/// Progress of the enrichment an item handed to the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemEnrichment {
    Queued,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Eid,
    pub user_id: String,
    pub status: JobStatus,

    pub total: usize,
    pub imported_count: usize,
    pub skipped_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub canceled_count: usize,

    pub enqueue_enrich_count: usize,
    pub enrich_completed: usize,
    pub enrich_failed: usize,

    pub use_nano_model: bool,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn new(user_id: &str, total: usize, use_nano_model: bool) -> Self {
        let now = Utc::now();
        ImportJob {
            id: Eid::new(),
            user_id: user_id.to_string(),
            status: JobStatus::Pending,
            total,
            imported_count: 0,
            skipped_count: 0,
            failed_count: 0,
            canceled_count: 0,
            enqueue_enrich_count: 0,
            enrich_completed: 0,
            enrich_failed: 0,
            use_nano_model,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Recomputes the counters from the job's items.
    pub fn tally(&mut self, items: &[&ImportJobItem]) {
        let count = |status: ItemStatus| items.iter().filter(|i| i.status == status).count();
        let enriched = |state: ItemEnrichment| {
            items
                .iter()
                .filter(|i| i.enrichment == Some(state))
                .count()
        };

        self.imported_count = count(ItemStatus::Completed);
        self.skipped_count = count(ItemStatus::Skipped);
        self.failed_count = count(ItemStatus::Failed);
        self.canceled_count = count(ItemStatus::Canceled);

        self.enqueue_enrich_count = items.iter().filter(|i| i.enrichment.is_some()).count();
        self.enrich_completed = enriched(ItemEnrichment::Completed);
        self.enrich_failed = enriched(ItemEnrichment::Failed);
    }

    /// Every item is settled and every enrichment it queued has reported back.
    pub fn is_settled(&self, items: &[&ImportJobItem]) -> bool {
        items.iter().all(|i| i.status.is_terminal())
            && self.enrich_completed + self.enrich_failed == self.enqueue_enrich_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJobItem {
    pub id: Eid,
    pub job_id: Eid,
    /// Submission order within the job
    pub position: usize,

    pub url: String,
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enrich: bool,

    pub bookmark_id: Option<Eid>,
    pub status: ItemStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub enrichment: Option<ItemEnrichment>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
