use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::{cmp::Ordering, collections::HashMap, hash::Hash, str::FromStr, sync::Arc};

use crate::{
    app::errors::AppError,
    eid::Eid,
    storage::{JsonTable, StorageManager},
};

pub const DEFAULT_PER_PAGE: usize = 20;
pub const MAX_PER_PAGE: usize = 100;
const MAX_ERROR_CHARS: usize = 500;
const MAX_INITIAL_TITLE_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FromStr for EnrichmentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "processing" => Ok(EnrichmentStatus::Processing),
            "completed" => Ok(EnrichmentStatus::Completed),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => Err(AppError::validation(format!("Invalid status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: Eid,
    pub user_id: String,

    pub url: String,
    pub domain: String,

    pub original_title: String,
    pub clean_title: String,
    pub ai_summary: Option<String>,
    pub raw_notes: Option<String>,
    /// Text supplied at creation that replaces page extraction.
    #[serde(default)]
    pub user_description: Option<String>,
    #[serde(default)]
    pub auto_tags: Vec<String>,
    pub content_type: Option<String>,
    pub intent_type: Option<String>,
    pub technical_level: Option<String>,
    #[serde(default)]
    pub key_quotes: Vec<String>,

    pub favicon_url: Option<String>,
    pub thumbnail_url: Option<String>,

    pub enrichment_status: EnrichmentStatus,
    pub enrichment_error: Option<String>,

    #[serde(default)]
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,

    pub folder_id: Option<Eid>,
    #[serde(default)]
    pub is_public: bool,
    pub suggested_folder_name: Option<String>,

    /// Import job that created this row, if any.
    #[serde(default)]
    pub import_job_id: Option<Eid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hash for Bookmark {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialEq for Bookmark {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Bookmark {
    /// Every tag in `tags` must be present on the bookmark.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter()
            .all(|tag| self.auto_tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    }

    pub fn in_folder(&self, filter: &FolderFilter) -> bool {
        match filter {
            FolderFilter::Unfiled => self.folder_id.is_none(),
            FolderFilter::Folder(id) => self.folder_id.as_ref() == Some(id),
        }
    }
}

pub fn google_favicon(domain: &str) -> String {
    format!("https://www.google.com/s2/favicons?domain={domain}&sz=64")
}

/// Validates a submitted URL and derives its display domain.
pub fn normalize_url(raw: &str) -> Result<(String, String), AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::validation("URL is required"));
    }

    let invalid = || AppError::validation("Invalid URL format");
    let parsed = url::Url::parse(raw).map_err(|_| invalid())?;
    if !["http", "https"].contains(&parsed.scheme()) {
        return Err(invalid());
    }

    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let domain = host.strip_prefix("www.").unwrap_or(host).to_lowercase();

    Ok((raw.to_string(), domain))
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = vec![];
    for tag in tags {
        let tag = tag.trim().to_lowercase().replace(' ', "-");
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default)]
pub struct NewBookmark {
    pub user_id: String,
    pub url: String,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub import_job_id: Option<Eid>,
}

/// User-editable fields. Enrichment fields are never touched by a patch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookmarkPatch {
    pub clean_title: Option<String>,
    pub ai_summary: Option<String>,
    pub auto_tags: Option<Vec<String>>,
    pub raw_notes: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub folder_id: Option<Option<Eid>>,
    pub is_public: Option<bool>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl BookmarkPatch {
    pub fn is_empty(&self) -> bool {
        self.clean_title.is_none()
            && self.ai_summary.is_none()
            && self.auto_tags.is_none()
            && self.raw_notes.is_none()
            && self.folder_id.is_none()
            && self.is_public.is_none()
    }
}

/// Outcome of a successful pipeline run, written together with the status flip.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentResult {
    pub clean_title: String,
    pub ai_summary: String,
    pub auto_tags: Vec<String>,
    pub content_type: String,
    pub intent_type: String,
    pub technical_level: String,
    pub key_quotes: Vec<String>,
    pub suggested_folder_name: Option<String>,
    pub media: PageMedia,
}

/// Page metadata that is kept even when enrichment fails later on.
#[derive(Debug, Clone, Default)]
pub struct PageMedia {
    pub title: Option<String>,
    pub favicon_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderFilter {
    Unfiled,
    Folder(Eid),
}

impl FromStr for FolderFilter {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(AppError::validation("folder_id must not be empty")),
            "unfiled" | "null" => Ok(FolderFilter::Unfiled),
            id => Ok(FolderFilter::Folder(Eid::from(id))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    LastAccessedAt,
    AccessCount,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone)]
pub struct ListQuery {
    pub page: usize,
    pub per_page: usize,
    pub domain: Option<String>,
    pub content_type: Option<String>,
    pub intent_type: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<EnrichmentStatus>,
    pub folder: Option<FolderFilter>,
    pub is_public: Option<bool>,
    pub sort: SortKey,
    pub order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            domain: None,
            content_type: None,
            intent_type: None,
            tags: vec![],
            status: None,
            folder: None,
            is_public: None,
            sort: SortKey::default(),
            order: SortOrder::default(),
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, AppError> {
    value
        .parse::<usize>()
        .map_err(|_| AppError::validation(format!("{key} must be a positive integer")))
}

impl ListQuery {
    /// Builds a query from raw query-string pairs. `tag` and `tag[]` may repeat.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, AppError> {
        let mut query = ListQuery::default();

        for (key, value) in pairs {
            let value = value.trim();
            match key.as_str() {
                "page" => query.page = parse_number(key, value)?.max(1),
                "per_page" => {
                    query.per_page = parse_number(key, value)?.clamp(1, MAX_PER_PAGE)
                }
                "domain" if !value.is_empty() => query.domain = Some(value.to_lowercase()),
                "content_type" if !value.is_empty() => {
                    query.content_type = Some(value.to_string())
                }
                "intent_type" if !value.is_empty() => query.intent_type = Some(value.to_string()),
                "tag" | "tag[]" if !value.is_empty() => query.tags.push(value.to_lowercase()),
                "status" if !value.is_empty() => query.status = Some(value.parse()?),
                "folder_id" if !value.is_empty() => query.folder = Some(value.parse()?),
                "is_public" if !value.is_empty() => query.is_public = Some(value == "true"),
                "sort" => {
                    query.sort = match value {
                        "created_at" => SortKey::CreatedAt,
                        "updated_at" => SortKey::UpdatedAt,
                        "last_accessed_at" => SortKey::LastAccessedAt,
                        "access_count" => SortKey::AccessCount,
                        "title" | "clean_title" => SortKey::Title,
                        other => {
                            return Err(AppError::validation(format!("Invalid sort: {other}")))
                        }
                    }
                }
                "order" => {
                    query.order = match value {
                        "asc" => SortOrder::Asc,
                        "desc" => SortOrder::Desc,
                        other => {
                            return Err(AppError::validation(format!("Invalid order: {other}")))
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(query)
    }

    fn matches(&self, bmark: &Bookmark) -> bool {
        if let Some(domain) = &self.domain {
            if &bmark.domain != domain {
                return false;
            }
        }
        if let Some(content_type) = &self.content_type {
            if bmark.content_type.as_ref() != Some(content_type) {
                return false;
            }
        }
        if let Some(intent_type) = &self.intent_type {
            if bmark.intent_type.as_ref() != Some(intent_type) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if &bmark.enrichment_status != status {
                return false;
            }
        }
        if let Some(folder) = &self.folder {
            if !bmark.in_folder(folder) {
                return false;
            }
        }
        if let Some(is_public) = self.is_public {
            if bmark.is_public != is_public {
                return false;
            }
        }

        bmark.has_tags(&self.tags)
    }

    fn compare(&self, a: &Bookmark, b: &Bookmark) -> Ordering {
        let ord = match self.sort {
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortKey::LastAccessedAt => a.last_accessed_at.cmp(&b.last_accessed_at),
            SortKey::AccessCount => a.access_count.cmp(&b.access_count),
            SortKey::Title => a
                .clean_title
                .to_lowercase()
                .cmp(&b.clean_title.to_lowercase()),
        }
        .then_with(|| a.id.cmp(&b.id));

        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BookmarkPage {
    pub bookmarks: Vec<Bookmark>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub pages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

pub trait BookmarkManager: Send + Sync {
    /// Returns the stored row and whether it already existed for (user, url).
    fn create(&self, new: NewBookmark) -> Result<(Bookmark, bool), AppError>;
    fn get(&self, user_id: &str, id: &Eid) -> Result<Bookmark, AppError>;
    fn find(&self, id: &Eid) -> Option<Bookmark>;
    fn find_by_url(&self, user_id: &str, url: &str) -> Option<Bookmark>;
    fn all(&self, user_id: &str) -> Vec<Bookmark>;
    fn list(&self, user_id: &str, query: &ListQuery) -> BookmarkPage;
    /// `folder_exists` is consulted under the write lock, so a folder deleted
    /// concurrently can never be assigned.
    fn patch(
        &self,
        user_id: &str,
        id: &Eid,
        patch: BookmarkPatch,
        folder_exists: &dyn Fn(&Eid) -> bool,
    ) -> Result<Bookmark, AppError>;
    fn delete(&self, user_id: &str, id: &Eid) -> Result<(), AppError>;
    fn delete_many(&self, ids: &[Eid]) -> Result<usize, AppError>;
    fn track_access(&self, user_id: &str, id: &Eid) -> Result<u64, AppError>;

    /// Compare-and-swap `pending -> processing`. `None` when the row is gone or
    /// not pending, which means another attempt owns it or it is already done.
    fn claim_enrichment(&self, id: &Eid) -> Result<Option<Bookmark>, AppError>;
    fn complete_enrichment(&self, id: &Eid, result: EnrichmentResult)
        -> Result<Bookmark, AppError>;
    fn fail_enrichment(&self, id: &Eid, error: &str, media: PageMedia) -> Result<(), AppError>;
    fn reset_for_retry(&self, user_id: &str, id: &Eid) -> Result<Bookmark, AppError>;

    fn unfile_folder(&self, user_id: &str, folder_id: &Eid) -> Result<usize, AppError>;
    fn folder_counts(&self, user_id: &str) -> HashMap<Eid, usize>;
    fn tag_counts(&self, user_id: &str, folder: Option<&FolderFilter>, limit: usize)
        -> Vec<TagCount>;

    /// Fails rows left `processing` by a previous run and returns the
    /// directly created rows that are still waiting for enrichment.
    fn recover_interrupted(&self) -> Result<Vec<Bookmark>, AppError>;
}

pub struct BackendJson {
    table: JsonTable<Bookmark>,
}

impl BackendJson {
    pub fn load(storage: Arc<dyn StorageManager>) -> anyhow::Result<Self> {
        Ok(BackendJson {
            table: JsonTable::load(storage, "bookmarks.json")?,
        })
    }

    fn with_owned<R>(
        &self,
        user_id: &str,
        id: &Eid,
        f: impl FnOnce(&mut Bookmark) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        self.table.mutate(|bmarks| {
            let bmark = bmarks
                .iter_mut()
                .find(|b| &b.id == id && b.user_id == user_id)
                .ok_or(AppError::NotFound("Bookmark"))?;
            f(bmark)
        })
    }

    fn with_any<R>(
        &self,
        id: &Eid,
        f: impl FnOnce(&mut Bookmark) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        self.table.mutate(|bmarks| {
            let bmark = bmarks
                .iter_mut()
                .find(|b| &b.id == id)
                .ok_or(AppError::NotFound("Bookmark"))?;
            f(bmark)
        })
    }
}

impl BookmarkManager for BackendJson {
    fn create(&self, new: NewBookmark) -> Result<(Bookmark, bool), AppError> {
        let (url, domain) = normalize_url(&new.url)?;

        self.table.mutate(|bmarks| {
            if let Some(existing) = bmarks
                .iter()
                .find(|b| b.user_id == new.user_id && b.url == url)
            {
                return Ok((existing.clone(), true));
            }

            let description = non_blank(new.description);
            let title = non_blank(new.title)
                .or_else(|| {
                    description
                        .as_ref()
                        .and_then(|d| d.lines().next())
                        .map(|line| truncate_chars(line.trim(), MAX_INITIAL_TITLE_CHARS))
                        .filter(|line| !line.is_empty())
                })
                .unwrap_or_else(|| url.clone());

            let now = Utc::now();
            let bmark = Bookmark {
                id: Eid::new(),
                user_id: new.user_id,
                favicon_url: Some(google_favicon(&domain)),
                url,
                domain,
                original_title: title.clone(),
                clean_title: title,
                ai_summary: None,
                raw_notes: non_blank(new.notes),
                user_description: description,
                auto_tags: normalize_tags(new.tags),
                content_type: None,
                intent_type: None,
                technical_level: None,
                key_quotes: vec![],
                thumbnail_url: None,
                enrichment_status: EnrichmentStatus::Pending,
                enrichment_error: None,
                access_count: 0,
                last_accessed_at: None,
                folder_id: None,
                is_public: false,
                suggested_folder_name: None,
                import_job_id: new.import_job_id,
                created_at: now,
                updated_at: now,
            };

            bmarks.push(bmark.clone());
            Ok((bmark, false))
        })
    }

    fn get(&self, user_id: &str, id: &Eid) -> Result<Bookmark, AppError> {
        self.table
            .read()
            .iter()
            .find(|b| &b.id == id && b.user_id == user_id)
            .cloned()
            .ok_or(AppError::NotFound("Bookmark"))
    }

    fn find(&self, id: &Eid) -> Option<Bookmark> {
        self.table.read().iter().find(|b| &b.id == id).cloned()
    }

    fn find_by_url(&self, user_id: &str, url: &str) -> Option<Bookmark> {
        let url = url.trim();
        self.table
            .read()
            .iter()
            .find(|b| b.user_id == user_id && b.url == url)
            .cloned()
    }

    fn all(&self, user_id: &str) -> Vec<Bookmark> {
        self.table
            .read()
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect()
    }

    fn list(&self, user_id: &str, query: &ListQuery) -> BookmarkPage {
        let mut matched: Vec<Bookmark> = self
            .table
            .read()
            .iter()
            .filter(|b| b.user_id == user_id && query.matches(b))
            .cloned()
            .collect();

        matched.sort_by(|a, b| query.compare(a, b));

        let total = matched.len();
        let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
        let page = query.page.max(1);
        let bookmarks = matched
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        BookmarkPage {
            bookmarks,
            total,
            page,
            per_page,
            pages: total.div_ceil(per_page),
        }
    }

    fn patch(
        &self,
        user_id: &str,
        id: &Eid,
        patch: BookmarkPatch,
        folder_exists: &dyn Fn(&Eid) -> bool,
    ) -> Result<Bookmark, AppError> {
        if patch.is_empty() {
            return Err(AppError::validation("No valid fields to update"));
        }

        self.with_owned(user_id, id, |bmark| {
            if let Some(Some(folder_id)) = &patch.folder_id {
                if !folder_exists(folder_id) {
                    return Err(AppError::validation("Invalid folder_id"));
                }
            }

            if let Some(title) = patch.clean_title {
                let title = title.trim().to_string();
                if title.is_empty() {
                    return Err(AppError::validation("clean_title must not be empty"));
                }
                bmark.clean_title = title;
            }
            if let Some(summary) = patch.ai_summary {
                bmark.ai_summary = non_blank(Some(summary));
            }
            if let Some(tags) = patch.auto_tags {
                bmark.auto_tags = normalize_tags(tags);
            }
            if let Some(notes) = patch.raw_notes {
                bmark.raw_notes = non_blank(Some(notes));
            }
            if let Some(folder_id) = patch.folder_id {
                bmark.folder_id = folder_id;
            }
            if let Some(is_public) = patch.is_public {
                bmark.is_public = is_public;
            }

            bmark.updated_at = Utc::now();
            Ok(bmark.clone())
        })
    }

    fn delete(&self, user_id: &str, id: &Eid) -> Result<(), AppError> {
        self.table.mutate(|bmarks| {
            let idx = bmarks
                .iter()
                .position(|b| &b.id == id && b.user_id == user_id)
                .ok_or(AppError::NotFound("Bookmark"))?;
            bmarks.remove(idx);
            Ok(())
        })
    }

    fn delete_many(&self, ids: &[Eid]) -> Result<usize, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.table.mutate(|bmarks| {
            let before = bmarks.len();
            bmarks.retain(|b| !ids.contains(&b.id));
            Ok(before - bmarks.len())
        })
    }

    fn track_access(&self, user_id: &str, id: &Eid) -> Result<u64, AppError> {
        self.with_owned(user_id, id, |bmark| {
            bmark.access_count += 1;
            bmark.last_accessed_at = Some(Utc::now());
            Ok(bmark.access_count)
        })
    }

    fn claim_enrichment(&self, id: &Eid) -> Result<Option<Bookmark>, AppError> {
        let claimable = self
            .table
            .read()
            .iter()
            .any(|b| &b.id == id && b.enrichment_status == EnrichmentStatus::Pending);
        if !claimable {
            return Ok(None);
        }

        // re-checked under the write lock; the read above only avoids a
        // snapshot write for tasks that lost the race
        self.table.mutate(|bmarks| {
            match bmarks
                .iter_mut()
                .find(|b| &b.id == id && b.enrichment_status == EnrichmentStatus::Pending)
            {
                Some(bmark) => {
                    bmark.enrichment_status = EnrichmentStatus::Processing;
                    bmark.enrichment_error = None;
                    Ok(Some(bmark.clone()))
                }
                None => Ok(None),
            }
        })
    }

    fn complete_enrichment(
        &self,
        id: &Eid,
        result: EnrichmentResult,
    ) -> Result<Bookmark, AppError> {
        self.with_any(id, |bmark| {
            if let Some(title) = result.media.title {
                bmark.original_title = title;
            }
            if result.media.favicon_url.is_some() {
                bmark.favicon_url = result.media.favicon_url;
            }
            if result.media.thumbnail_url.is_some() {
                bmark.thumbnail_url = result.media.thumbnail_url;
            }

            bmark.clean_title = result.clean_title;
            bmark.ai_summary = Some(result.ai_summary);
            bmark.auto_tags = result.auto_tags;
            bmark.content_type = Some(result.content_type);
            bmark.intent_type = Some(result.intent_type);
            bmark.technical_level = Some(result.technical_level);
            bmark.key_quotes = result.key_quotes;
            bmark.suggested_folder_name = result.suggested_folder_name;

            bmark.enrichment_status = EnrichmentStatus::Completed;
            bmark.enrichment_error = None;
            bmark.updated_at = Utc::now();
            Ok(bmark.clone())
        })
    }

    fn fail_enrichment(&self, id: &Eid, error: &str, media: PageMedia) -> Result<(), AppError> {
        self.with_any(id, |bmark| {
            if let Some(title) = media.title {
                bmark.original_title = title;
            }
            if media.favicon_url.is_some() {
                bmark.favicon_url = media.favicon_url;
            }
            if media.thumbnail_url.is_some() {
                bmark.thumbnail_url = media.thumbnail_url;
            }

            bmark.enrichment_status = EnrichmentStatus::Failed;
            bmark.enrichment_error = Some(truncate_chars(error, MAX_ERROR_CHARS));
            bmark.updated_at = Utc::now();
            Ok(())
        })
    }

    fn reset_for_retry(&self, user_id: &str, id: &Eid) -> Result<Bookmark, AppError> {
        self.with_owned(user_id, id, |bmark| {
            if bmark.enrichment_status == EnrichmentStatus::Processing {
                return Err(AppError::conflict("Enrichment is already in progress"));
            }

            bmark.enrichment_status = EnrichmentStatus::Pending;
            bmark.enrichment_error = None;
            Ok(bmark.clone())
        })
    }

    fn unfile_folder(&self, user_id: &str, folder_id: &Eid) -> Result<usize, AppError> {
        self.table.mutate(|bmarks| {
            let mut count = 0;
            for bmark in bmarks
                .iter_mut()
                .filter(|b| b.user_id == user_id && b.folder_id.as_ref() == Some(folder_id))
            {
                bmark.folder_id = None;
                count += 1;
            }
            Ok(count)
        })
    }

    fn folder_counts(&self, user_id: &str) -> HashMap<Eid, usize> {
        let mut counts = HashMap::new();
        for bmark in self.table.read().iter().filter(|b| b.user_id == user_id) {
            if let Some(folder_id) = &bmark.folder_id {
                *counts.entry(folder_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn tag_counts(
        &self,
        user_id: &str,
        folder: Option<&FolderFilter>,
        limit: usize,
    ) -> Vec<TagCount> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for bmark in self
            .table
            .read()
            .iter()
            .filter(|b| b.user_id == user_id)
            .filter(|b| folder.map(|f| b.in_folder(f)).unwrap_or(true))
        {
            for tag in &bmark.auto_tags {
                *counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        let mut tags = counts
            .into_iter()
            .map(|(tag, count)| TagCount { tag, count })
            .collect::<Vec<_>>();
        tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        tags.truncate(limit);
        tags
    }

    fn recover_interrupted(&self) -> Result<Vec<Bookmark>, AppError> {
        let interrupted = self
            .table
            .read()
            .iter()
            .any(|b| b.enrichment_status == EnrichmentStatus::Processing);

        if interrupted {
            self.table.mutate(|bmarks| {
                for bmark in bmarks
                    .iter_mut()
                    .filter(|b| b.enrichment_status == EnrichmentStatus::Processing)
                {
                    log::warn!("[{}] enrichment was interrupted", bmark.id);
                    bmark.enrichment_status = EnrichmentStatus::Failed;
                    bmark.enrichment_error = Some("Enrichment interrupted by restart".to_string());
                }
                Ok(())
            })?;
        }

        Ok(self
            .table
            .read()
            .iter()
            .filter(|b| b.enrichment_status == EnrichmentStatus::Pending)
            .filter(|b| b.import_job_id.is_none())
            .cloned()
            .collect())
    }
}
