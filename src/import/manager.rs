use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    thread::sleep,
    time::{Duration, Instant},
};

use crate::{
    app::errors::AppError,
    bookmarks::{normalize_url, BookmarkManager, NewBookmark},
    eid::Eid,
    storage::{JsonTable, StorageManager},
};

use super::{
    formats::ImportRequest,
    job::{ImportJob, ImportJobItem, ItemEnrichment, ItemStatus, JobStatus},
};

pub const DEFAULT_ITEMS_PER_PAGE: usize = 50;
pub const MAX_ITEMS_PER_PAGE: usize = 200;
const DRIVER_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSubmitted {
    pub job_id: Eid,
    pub imported: usize,
    pub skipped: usize,
    pub enrichment_queued: usize,
    pub use_nano_model: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemsQuery {
    #[serde(default)]
    pub with_items: bool,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_items_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_items_per_page() -> usize {
    DEFAULT_ITEMS_PER_PAGE
}

impl Default for ItemsQuery {
    fn default() -> Self {
        ItemsQuery {
            with_items: false,
            page: default_page(),
            per_page: default_items_per_page(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportJobView {
    pub job: ImportJob,
    pub current_item: Option<ImportJobItem>,
    pub items: Vec<ImportJobItem>,
    pub items_total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// Enrichment the job driver wants queued.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichRequest {
    pub bookmark_id: Eid,
    pub job_id: Eid,
    pub use_nano_model: bool,
}

/// Work left behind by a previous run.
#[derive(Debug, Default)]
pub struct ImportRecovery {
    pub jobs: Vec<Eid>,
    pub enrichments: Vec<EnrichRequest>,
}

pub struct ImportManager {
    jobs: JsonTable<ImportJob>,
    items: JsonTable<ImportJobItem>,
    bmark_mgr: Arc<dyn BookmarkManager>,
    /// Serializes counter recomputation so the last writer sees the newest items.
    tally_lock: Mutex<()>,
    /// Jobs whose driver is between claiming an item and settling it.
    in_flight: Mutex<HashSet<Eid>>,
}

/// Marks a job's driver busy with an item until dropped.
struct ItemGuard<'a> {
    in_flight: &'a Mutex<HashSet<Eid>>,
    job_id: Eid,
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl ImportManager {
    pub fn load(
        storage: Arc<dyn StorageManager>,
        bmark_mgr: Arc<dyn BookmarkManager>,
    ) -> anyhow::Result<Self> {
        Ok(ImportManager {
            jobs: JsonTable::load(storage.clone(), "import_jobs.json")?,
            items: JsonTable::load(storage, "import_items.json")?,
            bmark_mgr,
            tally_lock: Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    fn enter_item(&self, job_id: &Eid) -> ItemGuard<'_> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone());
        ItemGuard {
            in_flight: &self.in_flight,
            job_id: job_id.clone(),
        }
    }

    fn driver_busy(&self, job_id: &Eid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(job_id)
    }

    /// Waits for the job's driver to settle the item it is working on.
    fn wait_for_driver(&self, job_id: &Eid) {
        let deadline = Instant::now() + DRIVER_SETTLE_TIMEOUT;
        while self.driver_busy(job_id) {
            if Instant::now() > deadline {
                log::warn!("[{job_id}] import driver did not settle its item in time");
                return;
            }
            sleep(Duration::from_millis(20));
        }
    }

    fn job(&self, id: &Eid) -> Option<ImportJob> {
        self.jobs.read().iter().find(|j| &j.id == id).cloned()
    }

    fn owned_job(&self, user_id: &str, id: &Eid) -> Result<ImportJob, AppError> {
        self.job(id)
            .filter(|j| j.user_id == user_id)
            .ok_or(AppError::NotFound("Import job"))
    }

    fn is_canceled(&self, job_id: &Eid) -> bool {
        self.job(job_id)
            .map(|j| j.status == JobStatus::Canceled)
            .unwrap_or(true)
    }

    /// Recomputes the job counters and completes the job once it is settled.
    fn sync(&self, job_id: &Eid) -> Result<ImportJob, AppError> {
        let _guard = self.tally_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let items = self.items.read();
        let items = items.iter().filter(|i| &i.job_id == job_id).collect::<Vec<_>>();

        self.jobs.mutate(|jobs| {
            let job = jobs
                .iter_mut()
                .find(|j| &j.id == job_id)
                .ok_or(AppError::NotFound("Import job"))?;

            job.tally(&items);
            if job.status == JobStatus::Processing && job.is_settled(&items) {
                log::info!(
                    "[{job_id}] import completed: {} imported, {} skipped, {} failed",
                    job.imported_count,
                    job.skipped_count,
                    job.failed_count
                );
                job.status = JobStatus::Completed;
                job.finished_at = Some(Utc::now());
            }
            job.updated_at = Utc::now();
            Ok(job.clone())
        })
    }

    /// Registers a batch. Invalid, repeated and already saved urls are
    /// recorded as skipped items right away.
    pub fn submit(&self, user_id: &str, request: ImportRequest) -> Result<ImportSubmitted, AppError> {
        if request.bookmarks.is_empty() {
            return Err(AppError::validation("No bookmarks provided"));
        }

        let job = ImportJob::new(user_id, request.bookmarks.len(), request.use_nano_model);
        let mut seen = HashSet::new();
        let now = Utc::now();

        let items = request
            .bookmarks
            .into_iter()
            .enumerate()
            .map(|(position, entry)| {
                let skip_reason = match normalize_url(&entry.url) {
                    Err(_) => Some("Invalid URL"),
                    Ok((url, _)) if !seen.insert(url.clone()) => Some("Duplicate in batch"),
                    Ok((url, _)) if self.bmark_mgr.find_by_url(user_id, &url).is_some() => {
                        Some("Already bookmarked")
                    }
                    Ok(_) => None,
                };

                ImportJobItem {
                    id: Eid::new(),
                    job_id: job.id.clone(),
                    position,
                    url: entry.url.trim().to_string(),
                    title: entry.title,
                    tags: entry.tags,
                    enrich: entry.enrich,
                    bookmark_id: None,
                    status: match skip_reason {
                        Some(_) => ItemStatus::Skipped,
                        None => ItemStatus::Pending,
                    },
                    error: skip_reason.map(String::from),
                    enrichment: None,
                    started_at: None,
                    finished_at: skip_reason.map(|_| now),
                }
            })
            .collect::<Vec<_>>();

        let pending = items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .collect::<Vec<_>>();
        let submitted = ImportSubmitted {
            job_id: job.id.clone(),
            imported: pending.len(),
            skipped: items.len() - pending.len(),
            enrichment_queued: pending.iter().filter(|i| i.enrich).count(),
            use_nano_model: job.use_nano_model,
        };

        self.items.mutate(|rows| {
            rows.extend(items);
            Ok(())
        })?;
        self.jobs.mutate(|jobs| {
            jobs.push(job);
            Ok(())
        })?;
        self.sync(&submitted.job_id)?;

        log::info!(
            "[{}] import submitted: {} to import, {} skipped",
            submitted.job_id,
            submitted.imported,
            submitted.skipped
        );
        Ok(submitted)
    }

    fn next_pending(&self, job_id: &Eid) -> Option<ImportJobItem> {
        self.items
            .read()
            .iter()
            .filter(|i| &i.job_id == job_id && i.status == ItemStatus::Pending)
            .min_by_key(|i| i.position)
            .cloned()
    }

    fn claim_item(&self, item_id: &Eid) -> Result<bool, AppError> {
        self.items.mutate(|items| {
            match items
                .iter_mut()
                .find(|i| &i.id == item_id && i.status == ItemStatus::Pending)
            {
                Some(item) => {
                    item.status = ItemStatus::Processing;
                    item.started_at = Some(Utc::now());
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Settles an in-flight item. An item the user skipped while its bookmark
    /// was being created keeps the skip but still records the bookmark and
    /// its enrichment. Returns false when nothing was recorded.
    fn finish_item(
        &self,
        item_id: &Eid,
        status: ItemStatus,
        bookmark_id: Option<Eid>,
        error: Option<String>,
        enrichment: Option<ItemEnrichment>,
    ) -> Result<bool, AppError> {
        self.items.mutate(|items| {
            let Some(item) = items.iter_mut().find(|i| &i.id == item_id) else {
                return Ok(false);
            };

            match item.status {
                ItemStatus::Processing => {
                    item.status = status;
                    item.error = error;
                    item.finished_at = Some(Utc::now());
                }
                ItemStatus::Skipped if bookmark_id.is_some() && item.bookmark_id.is_none() => {}
                _ => return Ok(false),
            }

            item.bookmark_id = bookmark_id;
            item.enrichment = enrichment;
            Ok(true)
        })
    }

    /// Walks the job's pending items in submission order, creating their
    /// bookmarks and handing enrichments to `enqueue`. Stops starting new
    /// items as soon as the job is canceled.
    pub fn drive(&self, job_id: &Eid, enqueue: impl Fn(EnrichRequest)) -> Result<(), AppError> {
        let started = self.jobs.mutate(|jobs| {
            let job = jobs
                .iter_mut()
                .find(|j| &j.id == job_id)
                .ok_or(AppError::NotFound("Import job"))?;
            if job.status.is_terminal() {
                return Ok(None);
            }
            job.status = JobStatus::Processing;
            job.started_at.get_or_insert_with(Utc::now);
            Ok(Some(job.clone()))
        })?;
        let Some(job) = started else {
            log::debug!("[{job_id}] import is not running");
            return Ok(());
        };

        let result = self.drive_items(&job, &enqueue);
        if let Err(err) = &result {
            self.fail(job_id, &err.to_string())?;
        }

        self.sync(job_id)?;
        result
    }

    /// Marks a running job failed after an unexpected driver error.
    pub fn fail(&self, job_id: &Eid, error: &str) -> Result<(), AppError> {
        log::error!("[{job_id}] import failed: {error}");
        self.jobs.mutate(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| &j.id == job_id) {
                if !job.status.is_terminal() {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                }
                job.last_error = Some(error.to_string());
            }
            Ok(())
        })
    }

    fn drive_items(&self, job: &ImportJob, enqueue: &impl Fn(EnrichRequest)) -> Result<(), AppError> {
        while let Some(item) = self.next_pending(&job.id) {
            if self.is_canceled(&job.id) {
                log::info!("[{}] import canceled", job.id);
                break;
            }
            let _busy = self.enter_item(&job.id);
            if !self.claim_item(&item.id)? {
                continue;
            }

            let created = self.bmark_mgr.create(NewBookmark {
                user_id: job.user_id.clone(),
                url: item.url.clone(),
                title: item.title.clone(),
                tags: item.tags.clone(),
                import_job_id: Some(job.id.clone()),
                ..Default::default()
            });

            match created {
                Ok((bmark, true)) => {
                    self.finish_item(
                        &item.id,
                        ItemStatus::Skipped,
                        Some(bmark.id),
                        Some("Already bookmarked".to_string()),
                        None,
                    )?;
                }
                Ok((bmark, false)) => {
                    let enrichment = item.enrich.then_some(ItemEnrichment::Queued);
                    let finished = self.finish_item(
                        &item.id,
                        ItemStatus::Completed,
                        Some(bmark.id.clone()),
                        None,
                        enrichment,
                    )?;
                    if finished && item.enrich {
                        enqueue(EnrichRequest {
                            bookmark_id: bmark.id,
                            job_id: job.id.clone(),
                            use_nano_model: job.use_nano_model,
                        });
                    }
                }
                Err(err) => {
                    log::warn!("[{}] failed to import {}: {err}", job.id, item.url);
                    self.finish_item(&item.id, ItemStatus::Failed, None, Some(err.to_string()), None)?;
                }
            }

            self.sync(&job.id)?;
        }

        Ok(())
    }

    /// Records the result of an enrichment queued by the job driver.
    pub fn on_enrichment_finished(
        &self,
        job_id: &Eid,
        bookmark_id: &Eid,
        succeeded: bool,
    ) -> Result<(), AppError> {
        self.items.mutate(|items| {
            if let Some(item) = items.iter_mut().find(|i| {
                &i.job_id == job_id
                    && i.bookmark_id.as_ref() == Some(bookmark_id)
                    && i.enrichment == Some(ItemEnrichment::Queued)
            }) {
                item.enrichment = Some(if succeeded {
                    ItemEnrichment::Completed
                } else {
                    ItemEnrichment::Failed
                });
            }
            Ok(())
        })?;

        if self.job(job_id).is_none() {
            log::debug!("[{job_id}] import was deleted, dropping enrichment result");
            return Ok(());
        }
        self.sync(job_id).map(|_| ())
    }

    pub fn stop(&self, user_id: &str, job_id: &Eid) -> Result<ImportJob, AppError> {
        let job = self.owned_job(user_id, job_id)?;
        if job.status.is_terminal() {
            return Err(AppError::conflict("Import job is not running"));
        }

        self.jobs.mutate(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| &j.id == job_id) {
                job.status = JobStatus::Canceled;
                job.finished_at = Some(Utc::now());
            }
            Ok(())
        })?;

        let now = Utc::now();
        self.items.mutate(|items| {
            for item in items
                .iter_mut()
                .filter(|i| &i.job_id == job_id && i.status == ItemStatus::Pending)
            {
                item.status = ItemStatus::Canceled;
                item.finished_at = Some(now);
            }
            Ok(())
        })?;

        log::info!("[{job_id}] import stopped");
        self.sync(job_id)
    }

    pub fn skip(&self, user_id: &str, job_id: &Eid, item_id: &Eid) -> Result<ImportJobItem, AppError> {
        self.owned_job(user_id, job_id)?;

        let item = self.items.mutate(|items| {
            let item = items
                .iter_mut()
                .find(|i| &i.id == item_id && &i.job_id == job_id)
                .ok_or(AppError::NotFound("Import item"))?;
            if item.status.is_terminal() {
                return Err(AppError::conflict("Import item is already finished"));
            }

            item.status = ItemStatus::Skipped;
            item.error = Some("Skipped by user".to_string());
            item.finished_at = Some(Utc::now());
            Ok(item.clone())
        })?;

        self.sync(job_id)?;
        Ok(item)
    }

    /// Removes the job and its items. With `remove_bookmarks` the bookmarks
    /// it created are deleted too; their ids are returned.
    pub fn delete(
        &self,
        user_id: &str,
        job_id: &Eid,
        remove_bookmarks: bool,
    ) -> Result<Vec<Eid>, AppError> {
        let job = self.owned_job(user_id, job_id)?;
        if !job.status.is_terminal() {
            self.stop(user_id, job_id)?;
        }
        // a bookmark being created right now must not escape the scan below
        self.wait_for_driver(job_id);

        let mut removed = vec![];
        if remove_bookmarks {
            removed = self
                .bmark_mgr
                .all(user_id)
                .into_iter()
                .filter(|b| b.import_job_id.as_ref() == Some(job_id))
                .map(|b| b.id)
                .collect();
            self.bmark_mgr.delete_many(&removed)?;
        }

        self.items.mutate(|items| {
            items.retain(|i| &i.job_id != job_id);
            Ok(())
        })?;
        self.jobs.mutate(|jobs| {
            jobs.retain(|j| &j.id != job_id);
            Ok(())
        })?;

        log::info!("[{job_id}] import deleted, {} bookmarks removed", removed.len());
        Ok(removed)
    }

    pub fn view(&self, user_id: &str, job_id: &Eid, query: &ItemsQuery) -> Result<ImportJobView, AppError> {
        let job = self.owned_job(user_id, job_id)?;
        let page = query.page.max(1);
        let per_page = query.per_page.clamp(1, MAX_ITEMS_PER_PAGE);

        let rows = self.items.read();
        let mut items = rows.iter().filter(|i| &i.job_id == job_id).collect::<Vec<_>>();
        items.sort_by_key(|i| i.position);

        let current_item = items
            .iter()
            .find(|i| i.status == ItemStatus::Processing)
            .map(|i| (*i).clone());
        let items_total = items.len();
        let items = if query.with_items {
            items
                .into_iter()
                .skip((page - 1) * per_page)
                .take(per_page)
                .cloned()
                .collect()
        } else {
            vec![]
        };

        Ok(ImportJobView {
            job,
            current_item,
            items,
            items_total,
            page,
            per_page,
        })
    }

    /// The caller's jobs, newest first.
    pub fn list(&self, user_id: &str) -> Vec<ImportJob> {
        let mut jobs = self
            .jobs
            .read()
            .iter()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        jobs
    }

    /// Fails items interrupted mid-import and collects the jobs and
    /// enrichments that have to be queued again. Enrichments of stopped
    /// jobs are queued too, their bookmarks were imported already.
    pub fn recover(&self) -> Result<ImportRecovery, AppError> {
        let jobs = self
            .jobs
            .read()
            .iter()
            .map(|j| (j.id.clone(), j.use_nano_model, j.status.is_terminal()))
            .collect::<Vec<_>>();
        if jobs.is_empty() {
            return Ok(ImportRecovery::default());
        }

        let now = Utc::now();
        self.items.mutate(|items| {
            for item in items.iter_mut().filter(|i| i.status == ItemStatus::Processing) {
                log::warn!("[{}] import item {} was interrupted", item.job_id, item.id);
                item.status = ItemStatus::Failed;
                item.error = Some("Interrupted".to_string());
                item.finished_at = Some(now);
            }
            Ok(())
        })?;

        let mut recovery = ImportRecovery::default();
        for (job_id, use_nano_model, terminal) in jobs {
            recovery.enrichments.extend(
                self.items
                    .read()
                    .iter()
                    .filter(|i| i.job_id == job_id && i.enrichment == Some(ItemEnrichment::Queued))
                    .filter_map(|i| i.bookmark_id.clone())
                    .map(|bookmark_id| EnrichRequest {
                        bookmark_id,
                        job_id: job_id.clone(),
                        use_nano_model,
                    }),
            );
            if !terminal {
                self.sync(&job_id)?;
                recovery.jobs.push(job_id);
            }
        }

        Ok(recovery)
    }
}
