//! Drives a single bookmark through extraction, analysis and embedding.
//!
//! The only way into the pipeline is [`BookmarkManager::claim_enrichment`],
//! so two tasks queued for the same bookmark never run it concurrently.

use std::sync::Arc;

use crate::{
    bookmarks::{
        truncate_chars, Bookmark, BookmarkManager, EnrichmentResult, PageMedia,
    },
    eid::Eid,
    extractor::{ContentExtractor, Extraction},
    folders::FolderStore,
    llm::{Analysis, AnalysisRequest, LanguageModel},
    semantic::{embeddings::MAX_EMBEDDING_CHARS, SemanticIndex},
};

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    Completed,
    Failed(String),
    /// The bookmark was gone or not pending, so nothing ran.
    NotClaimed,
}

pub struct Enricher {
    bmark_mgr: Arc<dyn BookmarkManager>,
    folders: Arc<FolderStore>,
    extractor: Arc<dyn ContentExtractor>,
    llm: Arc<dyn LanguageModel>,
    semantic: Option<Arc<SemanticIndex>>,
}

/// Text that represents a bookmark in the vector index.
pub fn embedding_text(bmark: &Bookmark, content: &str) -> String {
    let mut parts: Vec<&str> = vec![&bmark.clean_title];
    if let Some(summary) = &bmark.ai_summary {
        parts.push(summary);
    }
    let tags = bmark.auto_tags.join(" ");
    parts.push(&tags);
    if let Some(notes) = &bmark.raw_notes {
        parts.push(notes);
    }
    parts.push(content);

    let text = parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    truncate_chars(&text, MAX_EMBEDDING_CHARS)
}

impl Enricher {
    pub fn new(
        bmark_mgr: Arc<dyn BookmarkManager>,
        folders: Arc<FolderStore>,
        extractor: Arc<dyn ContentExtractor>,
        llm: Arc<dyn LanguageModel>,
        semantic: Option<Arc<SemanticIndex>>,
    ) -> Self {
        Enricher {
            bmark_mgr,
            folders,
            extractor,
            llm,
            semantic,
        }
    }

    pub fn semantic(&self) -> Option<&Arc<SemanticIndex>> {
        self.semantic.as_ref()
    }

    pub fn run(&self, id: &Eid, use_nano_model: bool) -> EnrichOutcome {
        let bmark = match self.bmark_mgr.claim_enrichment(id) {
            Ok(Some(bmark)) => bmark,
            Ok(None) => {
                log::debug!("[{id}] not pending, skipping enrichment");
                return EnrichOutcome::NotClaimed;
            }
            Err(err) => {
                log::error!("[{id}] failed to claim bookmark: {err}");
                return EnrichOutcome::NotClaimed;
            }
        };

        log::info!("[{id}] enriching {}", bmark.url);
        let mut media = PageMedia::default();

        match self.enrich(&bmark, use_nano_model, &mut media) {
            Ok(result) => match self.bmark_mgr.complete_enrichment(id, result) {
                Ok(_) => {
                    log::info!("[{id}] enrichment completed");
                    EnrichOutcome::Completed
                }
                Err(err) => {
                    if let Some(semantic) = &self.semantic {
                        semantic.remove(std::slice::from_ref(id));
                    }
                    self.fail(id, err.to_string(), PageMedia::default())
                }
            },
            Err(err) => self.fail(id, err, media),
        }
    }

    fn fail(&self, id: &Eid, error: String, media: PageMedia) -> EnrichOutcome {
        log::warn!("[{id}] enrichment failed: {error}");
        if let Err(err) = self.bmark_mgr.fail_enrichment(id, &error, media) {
            log::error!("[{id}] failed to record enrichment error: {err}");
        }
        EnrichOutcome::Failed(error)
    }

    fn extract(&self, bmark: &Bookmark) -> Result<Extraction, String> {
        match &bmark.user_description {
            Some(description) => Ok(Extraction {
                text: description.clone(),
                ..Default::default()
            }),
            None => self.extractor.extract(&bmark.url).map_err(|err| err.to_string()),
        }
    }

    fn enrich(
        &self,
        bmark: &Bookmark,
        use_nano_model: bool,
        media: &mut PageMedia,
    ) -> Result<EnrichmentResult, String> {
        let extraction = self.extract(bmark)?;
        *media = PageMedia {
            title: extraction.title.clone(),
            favicon_url: extraction.favicon_url.clone(),
            thumbnail_url: extraction.thumbnail_url.clone(),
        };

        let folders = self
            .folders
            .list(&bmark.user_id)
            .into_iter()
            .map(|f| f.name)
            .collect();

        let request = AnalysisRequest {
            url: bmark.url.clone(),
            title: extraction.title.clone().or_else(|| Some(bmark.original_title.clone())),
            content: extraction.text.clone(),
            notes: bmark.raw_notes.clone(),
            folders,
            use_nano_model,
        };
        let Analysis {
            clean_title,
            ai_summary,
            auto_tags,
            intent_type,
            technical_level,
            content_type,
            key_quotes,
            suggested_folder,
        } = self.llm.analyze(&request).map_err(|err| err.to_string())?;

        let result = EnrichmentResult {
            clean_title,
            ai_summary,
            auto_tags,
            content_type,
            intent_type,
            technical_level,
            key_quotes,
            suggested_folder_name: suggested_folder,
            media: media.clone(),
        };

        if let Some(semantic) = &self.semantic {
            let enriched = Bookmark {
                clean_title: result.clean_title.clone(),
                ai_summary: Some(result.ai_summary.clone()),
                auto_tags: result.auto_tags.clone(),
                ..bmark.clone()
            };
            semantic
                .index_bookmark(
                    &bmark.id,
                    &bmark.user_id,
                    &embedding_text(&enriched, &extraction.text),
                )
                .map_err(|err| err.to_string())?;
        }

        Ok(result)
    }
}
