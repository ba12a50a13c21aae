use std::collections::HashMap;
use std::sync::{mpsc, Arc, PoisonError, RwLock, RwLockReadGuard};

use serde::Deserialize;

use crate::{
    bookmarks::{
        self, Bookmark, BookmarkManager, BookmarkPage, BookmarkPatch, FolderFilter, ListQuery,
        NewBookmark, TagCount,
    },
    collections::{
        Collection, CollectionCreate, CollectionDetail, CollectionStore, CollectionUpdate,
        CollectionView,
    },
    config::{Config, UserConfig},
    eid::Eid,
    enrichment::Enricher,
    extractor::{ContentExtractor, WebExtractor},
    folders::{Folder, FolderCreate, FolderStore, FolderUpdate, FolderView},
    import::{ImportJob, ImportJobItem, ImportJobView, ImportManager, ImportRequest, ImportSubmitted, ItemsQuery},
    llm::{LanguageModel, OpenAiModel},
    public::{self, PublicBookmarks, Subscriber, SubscriberStore},
    search::{self, SearchHistory, SearchHistoryEntry, SearchMode, SearchQuery, SearchResponse},
    semantic::{embeddings, Embedder, SemanticIndex},
    storage::{self, BackendLocal},
};

use super::{
    errors::AppError,
    task_runner::{self, Task, Workers},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBookmark {
    #[serde(default)]
    pub url: String,
    pub notes: Option<String>,
    pub description: Option<String>,
}

pub struct AppLocal {
    pub bmark_mgr: Arc<dyn BookmarkManager>,
    pub folders: Arc<FolderStore>,
    pub collections: Arc<CollectionStore>,
    pub imports: Arc<ImportManager>,
    pub history: Arc<SearchHistory>,
    pub subscribers: Arc<SubscriberStore>,
    enricher: Arc<Enricher>,

    task_tx: Option<Arc<mpsc::Sender<Task>>>,
    task_queue_handle: Option<std::thread::JoinHandle<()>>,

    config: Arc<RwLock<Config>>,
}

impl AppLocal {
    /// Opens the stores under the configured base path with the real
    /// extraction, LLM and embedding backends.
    pub fn load(config: Arc<RwLock<Config>>) -> anyhow::Result<Self> {
        let (base_path, embedder) = {
            let config = config.read().unwrap_or_else(PoisonError::into_inner);
            (
                config.base_path().to_string(),
                embeddings::from_config(&config)?,
            )
        };
        let storage_mgr: Arc<dyn storage::StorageManager> = Arc::new(BackendLocal::new(&base_path)?);

        Self::new_with(
            storage_mgr,
            Arc::new(WebExtractor::new(config.clone())),
            Arc::new(OpenAiModel::new(config.clone())),
            embedder,
            config,
        )
    }

    pub fn new_with(
        storage_mgr: Arc<dyn storage::StorageManager>,
        extractor: Arc<dyn ContentExtractor>,
        llm: Arc<dyn LanguageModel>,
        embedder: Option<Arc<dyn Embedder>>,
        config: Arc<RwLock<Config>>,
    ) -> anyhow::Result<Self> {
        let bmark_mgr: Arc<dyn BookmarkManager> =
            Arc::new(bookmarks::BackendJson::load(storage_mgr.clone())?);
        let folders = Arc::new(FolderStore::load(storage_mgr.clone())?);
        let imports = Arc::new(ImportManager::load(storage_mgr.clone(), bmark_mgr.clone())?);

        let semantic = match embedder {
            Some(embedder) => {
                log::info!("semantic search enabled with {}", embedder.model_name());
                Some(Arc::new(SemanticIndex::load(embedder, storage_mgr.clone())?))
            }
            None => None,
        };

        Ok(AppLocal {
            enricher: Arc::new(Enricher::new(
                bmark_mgr.clone(),
                folders.clone(),
                extractor,
                llm,
                semantic,
            )),
            bmark_mgr,
            folders,
            collections: Arc::new(CollectionStore::load(storage_mgr.clone())?),
            imports,
            history: Arc::new(SearchHistory::load(storage_mgr.clone())?),
            subscribers: Arc::new(SubscriberStore::load(storage_mgr)?),
            task_tx: None,
            task_queue_handle: None,
            config,
        })
    }

    /// Starts the task queue and requeues work interrupted by the last shutdown.
    pub fn run_queue(&mut self) -> anyhow::Result<()> {
        let (task_tx, task_rx) = mpsc::channel::<Task>();

        let workers = Arc::new(self.workers());

        let handle = std::thread::spawn({
            let task_tx = task_tx.clone();
            let config = self.config.clone();
            move || {
                task_runner::start_queue(task_rx, task_tx, workers, config);
            }
        });

        self.task_queue_handle = Some(handle);
        self.task_tx = Some(Arc::new(task_tx));

        self.recover()
    }

    pub fn workers(&self) -> Workers {
        Workers {
            bmark_mgr: self.bmark_mgr.clone(),
            enricher: self.enricher.clone(),
            imports: self.imports.clone(),
        }
    }

    fn recover(&self) -> anyhow::Result<()> {
        for bmark in self.bmark_mgr.recover_interrupted()? {
            log::info!("[{}] restarting interrupted enrichment", bmark.id);
            self.schedule(Task::Enrich {
                bookmark_id: bmark.id,
                use_nano_model: false,
                job_id: None,
            });
        }

        let recovery = self.imports.recover()?;
        for req in recovery.enrichments {
            self.schedule(req.into());
        }
        for job_id in recovery.jobs {
            log::info!("[{job_id}] resuming import");
            self.schedule(Task::Import { job_id });
        }

        Ok(())
    }

    fn schedule(&self, task: Task) {
        match &self.task_tx {
            Some(task_tx) => {
                if let Err(err) = task_tx.send(task) {
                    log::error!("{err}");
                }
            }
            None => log::warn!("task queue is not running, dropping {task:?}"),
        }
    }

    pub fn wait_task_queue_finish(&mut self) {
        if let Some(handle) = self.task_queue_handle.take() {
            if let Err(err) = handle.join() {
                log::error!("task queue panicked: {err:?}");
            }
        }
    }

    pub fn shutdown(&self) {
        self.schedule(Task::Shutdown);
    }

    pub fn config(&self) -> Arc<RwLock<Config>> {
        self.config.clone()
    }

    fn read_config(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user_by_username(&self, username: &str) -> Result<UserConfig, AppError> {
        self.read_config()
            .user_by_username(public::handle_to_username(username))
            .cloned()
            .ok_or(AppError::NotFound("User"))
    }

    fn semantic(&self) -> Option<&Arc<SemanticIndex>> {
        self.enricher.semantic()
    }
}

// bookmarks
impl AppLocal {
    /// Returns the bookmark and whether it was already saved. New bookmarks
    /// are queued for enrichment.
    pub fn create_bookmark(
        &self,
        user_id: &str,
        create: CreateBookmark,
    ) -> Result<(Bookmark, bool), AppError> {
        let (bmark, already_exists) = self.bmark_mgr.create(NewBookmark {
            user_id: user_id.to_string(),
            url: create.url,
            notes: create.notes,
            description: create.description,
            ..Default::default()
        })?;

        if !already_exists {
            log::info!("[{}] created bookmark for {}", bmark.id, bmark.url);
            self.schedule(Task::Enrich {
                bookmark_id: bmark.id.clone(),
                use_nano_model: false,
                job_id: None,
            });
        }

        Ok((bmark, already_exists))
    }

    pub fn get_bookmark(&self, user_id: &str, id: &Eid) -> Result<Bookmark, AppError> {
        self.bmark_mgr.get(user_id, id)
    }

    pub fn list_bookmarks(&self, user_id: &str, query: &ListQuery) -> BookmarkPage {
        self.bmark_mgr.list(user_id, query)
    }

    pub fn update_bookmark(
        &self,
        user_id: &str,
        id: &Eid,
        patch: BookmarkPatch,
    ) -> Result<Bookmark, AppError> {
        let folder_exists = |folder_id: &Eid| self.folders.get(user_id, folder_id).is_ok();
        self.bmark_mgr.patch(user_id, id, patch, &folder_exists)
    }

    pub fn set_visibility(
        &self,
        user_id: &str,
        id: &Eid,
        is_public: bool,
    ) -> Result<Bookmark, AppError> {
        self.bmark_mgr.patch(
            user_id,
            id,
            BookmarkPatch {
                is_public: Some(is_public),
                ..Default::default()
            },
            &|_: &Eid| false,
        )
    }

    pub fn delete_bookmark(&self, user_id: &str, id: &Eid) -> Result<(), AppError> {
        self.bmark_mgr.delete(user_id, id)?;
        self.collections.remove_bookmarks(std::slice::from_ref(id))?;
        if let Some(semantic) = self.semantic() {
            semantic.remove(std::slice::from_ref(id));
        }
        Ok(())
    }

    pub fn track_access(&self, user_id: &str, id: &Eid) -> Result<u64, AppError> {
        self.bmark_mgr.track_access(user_id, id)
    }

    pub fn retry_enrichment(&self, user_id: &str, id: &Eid) -> Result<Bookmark, AppError> {
        let bmark = self.bmark_mgr.reset_for_retry(user_id, id)?;
        // the old vector describes the previous analysis
        if let Some(semantic) = self.semantic() {
            semantic.remove(std::slice::from_ref(id));
        }
        log::info!("[{id}] enrichment retry requested");
        self.schedule(Task::Enrich {
            bookmark_id: bmark.id.clone(),
            use_nano_model: false,
            job_id: None,
        });
        Ok(bmark)
    }

    pub fn tag_stats(
        &self,
        user_id: &str,
        folder: Option<&FolderFilter>,
        limit: usize,
    ) -> Vec<TagCount> {
        self.bmark_mgr.tag_counts(user_id, folder, limit)
    }
}

// folders
impl AppLocal {
    pub fn list_folders(&self, user_id: &str) -> Vec<FolderView> {
        let counts = self.bmark_mgr.folder_counts(user_id);
        self.folders
            .list(user_id)
            .into_iter()
            .map(|folder| FolderView {
                bookmark_count: counts.get(&folder.id).copied().unwrap_or(0),
                folder,
            })
            .collect()
    }

    pub fn create_folder(&self, user_id: &str, create: FolderCreate) -> Result<Folder, AppError> {
        self.folders.create(user_id, create)
    }

    pub fn update_folder(
        &self,
        user_id: &str,
        id: &Eid,
        update: FolderUpdate,
    ) -> Result<Folder, AppError> {
        self.folders.update(user_id, id, update)
    }

    /// Deletes the folder; its bookmarks become unfiled.
    pub fn delete_folder(&self, user_id: &str, id: &Eid) -> Result<usize, AppError> {
        // gone first, so no patch can file a bookmark into it after the unfiling
        self.folders.delete(user_id, id)?;
        self.bmark_mgr.unfile_folder(user_id, id)
    }
}

// collections
impl AppLocal {
    pub fn list_collections(&self, user_id: &str) -> Vec<CollectionView> {
        self.collections.list(user_id)
    }

    pub fn get_collection(&self, user_id: &str, id: &Eid) -> Result<CollectionDetail, AppError> {
        let collection = self.collections.get(user_id, id)?;
        let mut owned: HashMap<Eid, Bookmark> = self
            .bmark_mgr
            .all(user_id)
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();
        let bookmarks: Vec<Bookmark> = self
            .collections
            .bookmark_ids(id)
            .iter()
            .filter_map(|bookmark_id| owned.remove(bookmark_id))
            .collect();

        Ok(CollectionDetail {
            collection,
            bookmark_count: bookmarks.len(),
            bookmarks,
        })
    }

    pub fn create_collection(
        &self,
        user_id: &str,
        create: CollectionCreate,
    ) -> Result<Collection, AppError> {
        self.collections.create(user_id, create)
    }

    pub fn update_collection(
        &self,
        user_id: &str,
        id: &Eid,
        update: CollectionUpdate,
    ) -> Result<Collection, AppError> {
        self.collections.update(user_id, id, update)
    }

    /// Deletes the collection. Its bookmarks stay where they are.
    pub fn delete_collection(&self, user_id: &str, id: &Eid) -> Result<(), AppError> {
        self.collections.delete(user_id, id)
    }

    pub fn add_to_collection(
        &self,
        user_id: &str,
        id: &Eid,
        bookmark_id: &Eid,
    ) -> Result<(), AppError> {
        let bookmark_exists = |bookmark_id: &Eid| self.bmark_mgr.get(user_id, bookmark_id).is_ok();
        self.collections
            .add_bookmark(user_id, id, bookmark_id, &bookmark_exists)
    }

    pub fn remove_from_collection(
        &self,
        user_id: &str,
        id: &Eid,
        bookmark_id: &Eid,
    ) -> Result<(), AppError> {
        self.collections.remove_bookmark(user_id, id, bookmark_id)
    }
}

// imports
impl AppLocal {
    pub fn submit_import(
        &self,
        user_id: &str,
        request: ImportRequest,
    ) -> Result<ImportSubmitted, AppError> {
        let submitted = self.imports.submit(user_id, request)?;
        self.schedule(Task::Import {
            job_id: submitted.job_id.clone(),
        });
        Ok(submitted)
    }

    pub fn import_status(
        &self,
        user_id: &str,
        job_id: &Eid,
        query: &ItemsQuery,
    ) -> Result<ImportJobView, AppError> {
        self.imports.view(user_id, job_id, query)
    }

    pub fn list_imports(&self, user_id: &str) -> Vec<ImportJob> {
        self.imports.list(user_id)
    }

    pub fn stop_import(&self, user_id: &str, job_id: &Eid) -> Result<ImportJob, AppError> {
        self.imports.stop(user_id, job_id)
    }

    pub fn skip_import_item(
        &self,
        user_id: &str,
        job_id: &Eid,
        item_id: &Eid,
    ) -> Result<ImportJobItem, AppError> {
        self.imports.skip(user_id, job_id, item_id)
    }

    /// Returns the number of bookmarks removed along with the job.
    pub fn delete_import(
        &self,
        user_id: &str,
        job_id: &Eid,
        remove_bookmarks: bool,
    ) -> Result<usize, AppError> {
        let removed = self.imports.delete(user_id, job_id, remove_bookmarks)?;
        self.collections.remove_bookmarks(&removed)?;
        if let Some(semantic) = self.semantic() {
            semantic.remove(&removed);
        }
        Ok(removed.len())
    }
}

// search
impl AppLocal {
    pub fn search(&self, user_id: &str, query: SearchQuery) -> Result<SearchResponse, AppError> {
        let results = match query.mode {
            SearchMode::Keyword => search::keyword(self.bmark_mgr.all(user_id), &query),
            SearchMode::Semantic => {
                let semantic = self.semantic().ok_or(AppError::SemanticDisabled)?;
                let threshold = self.read_config().embeddings.threshold;
                search::semantic(semantic, &self.bmark_mgr, user_id, &query, threshold)?
            }
        };

        if !query.q.is_empty() {
            if let Err(err) = self
                .history
                .record(user_id, &query.q, query.mode, results.len())
            {
                log::warn!("failed to record search history: {err}");
            }
        }

        Ok(SearchResponse {
            query: query.q,
            mode: query.mode,
            count: results.len(),
            results,
        })
    }

    pub fn search_history(&self, user_id: &str, limit: usize) -> Vec<SearchHistoryEntry> {
        self.history.recent(user_id, limit)
    }
}

// public profiles
impl AppLocal {
    pub fn public_bookmarks(
        &self,
        username: &str,
        viewer: Option<&UserConfig>,
    ) -> Result<PublicBookmarks, AppError> {
        let owner = self.user_by_username(username)?;
        Ok(public::profile_bookmarks(&self.bmark_mgr, &owner, viewer))
    }

    pub fn subscribe(&self, username: &str, email: &str) -> Result<Subscriber, AppError> {
        let owner = self.user_by_username(username)?;
        self.subscribers.subscribe(&owner.id, email)
    }

    pub fn unsubscribe(&self, username: &str, email: &str) -> Result<(), AppError> {
        let owner = self.user_by_username(username)?;
        self.subscribers.unsubscribe(&owner.id, email)
    }

    pub fn subscriber_count(&self, username: &str) -> Result<usize, AppError> {
        let owner = self.user_by_username(username)?;
        Ok(self.subscribers.count(&owner.id))
    }

    fn owned_profile(&self, username: &str, viewer: &UserConfig) -> Result<UserConfig, AppError> {
        let owner = self.user_by_username(username)?;
        if owner.id != viewer.id {
            return Err(AppError::Unauthorized);
        }
        Ok(owner)
    }

    pub fn subscribers(
        &self,
        username: &str,
        viewer: &UserConfig,
    ) -> Result<Vec<Subscriber>, AppError> {
        let owner = self.owned_profile(username, viewer)?;
        Ok(self.subscribers.list(&owner.id))
    }

    pub fn is_subscribed(&self, username: &str, viewer: &UserConfig) -> Result<bool, AppError> {
        let owner = self.user_by_username(username)?;
        Ok(self.subscribers.is_subscribed(&owner.id, &viewer.email))
    }

    pub fn remove_subscriber(
        &self,
        username: &str,
        viewer: &UserConfig,
        email: &str,
    ) -> Result<(), AppError> {
        let owner = self.owned_profile(username, viewer)?;
        self.subscribers.remove(&owner.id, email)
    }
}
