mod app;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::app::AppLocal;
use crate::bookmarks::{Bookmark, EnrichmentStatus};
use crate::config::{Config, UserConfig};
use crate::eid::Eid;
use crate::extractor::{ContentExtractor, ExtractError, Extraction};
use crate::import::ImportJob;
use crate::llm::{Analysis, AnalysisRequest, LanguageModel, LlmError};
use crate::semantic::{Embedder, EmbeddingError};
use crate::storage;

pub const ALICE: &str = "u-alice";
pub const BOB: &str = "u-bob";
pub const ALICE_TOKEN: &str = "alice-secret-token";
pub const BOB_TOKEN: &str = "bob-secret-token";

/// Serves canned pages. Urls containing "broken" fail to scrape.
#[derive(Default)]
pub struct StubExtractor {
    pub calls: AtomicUsize,
}

impl StubExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContentExtractor for StubExtractor {
    fn extract(&self, url: &str) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("broken") {
            return Err(ExtractError::Failed("connection refused".to_string()));
        }

        Ok(Extraction {
            title: Some(format!("Page at {url}")),
            description: None,
            text: format!("Article body for {url}"),
            thumbnail_url: Some(format!("{url}/og.png")),
            favicon_url: None,
        })
    }
}

/// Echoes its input back as an analysis. Content containing "llm-fail" is rejected.
pub struct StubLlm;

impl LanguageModel for StubLlm {
    fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, LlmError> {
        if request.content.contains("llm-fail") {
            return Err(LlmError::Malformed("expected a json object".to_string()));
        }

        Ok(Analysis {
            clean_title: format!("Clean {}", request.title.clone().unwrap_or_default()),
            ai_summary: format!("Summary: {}", request.content),
            auto_tags: vec!["stub".to_string()],
            intent_type: "reference".to_string(),
            technical_level: "intermediate".to_string(),
            content_type: "article".to_string(),
            key_quotes: vec![],
            suggested_folder: request.folders.first().cloned(),
        })
    }
}

/// Puts texts about rust and cooking on separate axes.
pub struct TopicEmbedder;

impl Embedder for TopicEmbedder {
    fn model_name(&self) -> &str {
        "topic-test"
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.to_lowercase();
        Ok(vec![
            text.contains("rust") as u8 as f32,
            text.contains("cooking") as u8 as f32,
            0.01,
        ])
    }
}

fn user(id: &str, username: &str, token: &str) -> UserConfig {
    UserConfig {
        id: id.to_string(),
        username: username.to_string(),
        email: format!("{username}@example.com"),
        token: token.to_string(),
        full_name: None,
        avatar_url: None,
    }
}

pub struct TestApp {
    pub app: AppLocal,
    pub extractor: Arc<StubExtractor>,
    pub tmp: tempfile::TempDir,
}

/// Creates an isolated AppLocal using a unique temp directory with two
/// users, alice and bob. The task queue is not started.
pub fn create_app(with_embeddings: bool) -> TestApp {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    open_app(tmp, with_embeddings)
}

/// Opens an app over an existing data directory, the way a restarted
/// daemon would. The task queue is not started.
pub fn open_app(tmp: tempfile::TempDir, with_embeddings: bool) -> TestApp {
    let base_path = tmp.path().to_str().unwrap().to_string();

    let mut config = Config::load_with(&base_path).expect("failed to load config");
    config.users = vec![
        user(ALICE, "alice", ALICE_TOKEN),
        user(BOB, "bob", BOB_TOKEN),
    ];

    let storage_mgr = Arc::new(storage::BackendLocal::new(&base_path).unwrap());
    let extractor = Arc::new(StubExtractor::default());
    let embedder: Option<Arc<dyn Embedder>> = match with_embeddings {
        true => Some(Arc::new(TopicEmbedder)),
        false => None,
    };

    let app = AppLocal::new_with(
        storage_mgr,
        extractor.clone(),
        Arc::new(StubLlm),
        embedder,
        Arc::new(RwLock::new(config)),
    )
    .expect("failed to create app");

    TestApp {
        app,
        extractor,
        tmp,
    }
}

/// Same as [`create_app`] with the task queue running.
pub fn create_running_app(with_embeddings: bool) -> TestApp {
    let mut test_app = create_app(with_embeddings);
    test_app.app.run_queue().expect("failed to start queue");
    test_app
}

pub fn wait_until<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check() {
            return value;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Waits for the bookmark to leave pending/processing.
pub fn wait_enriched(app: &AppLocal, user_id: &str, id: &Eid) -> Bookmark {
    wait_until("enrichment", || {
        let bmark = app.get_bookmark(user_id, id).ok()?;
        matches!(
            bmark.enrichment_status,
            EnrichmentStatus::Completed | EnrichmentStatus::Failed
        )
        .then_some(bmark)
    })
}

/// Waits for the import job to reach a terminal status.
pub fn wait_import(app: &AppLocal, user_id: &str, job_id: &Eid) -> ImportJob {
    wait_until("import", || {
        let job = app
            .list_imports(user_id)
            .into_iter()
            .find(|j| &j.id == job_id)?;
        job.status.is_terminal().then_some(job)
    })
}
