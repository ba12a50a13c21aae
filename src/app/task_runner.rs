use std::{
    sync::{
        atomic::{AtomicU16, Ordering},
        mpsc, Arc, PoisonError, RwLock,
    },
    thread::sleep,
    time::Duration,
};

use crate::{
    bookmarks::{BookmarkManager, EnrichmentStatus, PageMedia},
    config::Config,
    eid::Eid,
    enrichment::{EnrichOutcome, Enricher},
    import::{EnrichRequest, ImportManager},
};

/// Everything a task needs to run.
pub struct Workers {
    pub bmark_mgr: Arc<dyn BookmarkManager>,
    pub enricher: Arc<Enricher>,
    pub imports: Arc<ImportManager>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    /// run the enrichment pipeline for a bookmark
    Enrich {
        bookmark_id: Eid,
        use_nano_model: bool,
        /// import job waiting for the result
        job_id: Option<Eid>,
    },

    /// walk the pending items of an import job
    Import { job_id: Eid },

    /// stop accepting work once the tasks already queued have run
    Shutdown,
}

impl From<EnrichRequest> for Task {
    fn from(req: EnrichRequest) -> Self {
        Task::Enrich {
            bookmark_id: req.bookmark_id,
            use_nano_model: req.use_nano_model,
            job_id: Some(req.job_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Done,
    Skipped,
    Error(String),
}

fn max_threads(config: &RwLock<Config>) -> u16 {
    config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .task_queue_max_threads
        .max(1)
}

/// Blocks until a worker slot is free.
pub fn throttle(counter: &AtomicU16, config: &RwLock<Config>) {
    while counter.load(Ordering::SeqCst) >= max_threads(config) {
        sleep(Duration::from_millis(50));
    }
}

pub fn start_queue(
    task_rx: mpsc::Receiver<Task>,
    task_tx: mpsc::Sender<Task>,
    workers: Arc<Workers>,
    config: Arc<RwLock<Config>>,
) {
    let thread_ctr = Arc::new(AtomicU16::new(0));

    log::debug!("waiting for tasks");
    while let Ok(task) = task_rx.recv() {
        // graceful shutdown
        if let Task::Shutdown = &task {
            log::info!(
                "waiting for {} running tasks",
                thread_ctr.load(Ordering::SeqCst)
            );
            while thread_ctr.load(Ordering::SeqCst) > 0 {
                sleep(Duration::from_millis(100));
            }
            return;
        };

        // the slot is taken here, on the dispatcher, so no two tasks can race for it
        throttle(&thread_ctr, &config);
        thread_ctr.fetch_add(1, Ordering::SeqCst);

        log::debug!("starting {task:?}");
        let task_handle = std::thread::spawn({
            let workers = workers.clone();
            let task_tx = task_tx.clone();
            let task = task.clone();
            move || {
                let status = task.run(&workers, &task_tx);
                match &status {
                    Status::Error(err) => log::warn!("{task:?} finished with error: {err}"),
                    status => log::debug!("{task:?} finished: {status:?}"),
                }
            }
        });

        // handle thread panics
        let thread_counter = thread_ctr.clone();
        let workers = workers.clone();
        std::thread::spawn(move || {
            if let Err(err) = task_handle.join() {
                log::error!("task_handle panicked: {err:?}");
                task.recover_from_panic(&workers);
            }

            thread_counter.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

impl Task {
    pub fn run(&self, workers: &Workers, task_tx: &mpsc::Sender<Task>) -> Status {
        match self {
            Task::Enrich {
                bookmark_id,
                use_nano_model,
                job_id,
            } => {
                // runs even for stopped imports, the bookmark exists already
                let outcome = workers.enricher.run(bookmark_id, *use_nano_model);

                if let Some(job_id) = job_id {
                    let succeeded = match &outcome {
                        EnrichOutcome::Completed => true,
                        EnrichOutcome::Failed(_) => false,
                        // someone else ran it, count what they ended up with
                        EnrichOutcome::NotClaimed => workers
                            .bmark_mgr
                            .find(bookmark_id)
                            .map(|b| b.enrichment_status == EnrichmentStatus::Completed)
                            .unwrap_or(false),
                    };
                    if let Err(err) =
                        workers
                            .imports
                            .on_enrichment_finished(job_id, bookmark_id, succeeded)
                    {
                        return Status::Error(err.to_string());
                    }
                }

                match outcome {
                    EnrichOutcome::Completed => Status::Done,
                    EnrichOutcome::Failed(err) => Status::Error(err),
                    EnrichOutcome::NotClaimed => Status::Skipped,
                }
            }
            Task::Import { job_id } => {
                let enqueue = |req: EnrichRequest| {
                    if let Err(err) = task_tx.send(req.into()) {
                        log::error!("[{job_id}] failed to queue enrichment: {err}");
                    }
                };

                match workers.imports.drive(job_id, enqueue) {
                    Ok(()) => Status::Done,
                    Err(err) => Status::Error(err.to_string()),
                }
            }
            Task::Shutdown => Status::Skipped,
        }
    }

    /// Settles whatever a panicking task left in flight.
    fn recover_from_panic(&self, workers: &Workers) {
        match self {
            Task::Enrich {
                bookmark_id,
                job_id,
                ..
            } => {
                let stuck = workers
                    .bmark_mgr
                    .find(bookmark_id)
                    .map(|b| b.enrichment_status == EnrichmentStatus::Processing)
                    .unwrap_or(false);
                if stuck {
                    if let Err(err) = workers.bmark_mgr.fail_enrichment(
                        bookmark_id,
                        "Enrichment crashed",
                        PageMedia::default(),
                    ) {
                        log::error!("[{bookmark_id}] {err}");
                    }
                }
                if let Some(job_id) = job_id {
                    if let Err(err) = workers
                        .imports
                        .on_enrichment_finished(job_id, bookmark_id, false)
                    {
                        log::error!("[{job_id}] {err}");
                    }
                }
            }
            Task::Import { job_id } => {
                if let Err(err) = workers.imports.fail(job_id, "Import worker crashed") {
                    log::error!("[{job_id}] {err}");
                }
            }
            Task::Shutdown => {}
        }
    }
}
