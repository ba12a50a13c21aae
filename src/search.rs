use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, str::FromStr, sync::Arc};

use crate::{
    app::errors::AppError,
    bookmarks::{Bookmark, BookmarkManager, EnrichmentStatus},
    eid::Eid,
    semantic::SemanticIndex,
    storage::{JsonTable, StorageManager},
};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const MAX_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Keyword,
    Semantic,
}

impl FromStr for SearchMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            other => Err(AppError::validation(format!("Invalid search mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub q: String,
    pub mode: SearchMode,
    pub limit: usize,
    pub offset: usize,
    pub domain: Option<String>,
    pub content_type: Option<String>,
    pub tags: Vec<String>,
}

impl SearchQuery {
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, AppError> {
        let mut query = SearchQuery {
            limit: DEFAULT_LIMIT,
            ..Default::default()
        };

        for (key, value) in pairs {
            let value = value.trim();
            match key.as_str() {
                "q" => query.q = value.to_string(),
                "mode" if !value.is_empty() => query.mode = value.parse()?,
                "limit" => {
                    query.limit = value
                        .parse::<usize>()
                        .map_err(|_| AppError::validation("limit must be a positive integer"))?
                        .clamp(1, MAX_LIMIT)
                }
                "offset" => {
                    query.offset = value
                        .parse()
                        .map_err(|_| AppError::validation("offset must be a positive integer"))?
                }
                "domain" if !value.is_empty() => query.domain = Some(value.to_lowercase()),
                "content_type" if !value.is_empty() => {
                    query.content_type = Some(value.to_string())
                }
                "tag" | "tag[]" if !value.is_empty() => query.tags.push(value.to_lowercase()),
                _ => {}
            }
        }

        if query.q.is_empty() && query.tags.is_empty() {
            return Err(AppError::validation("Search query is required"));
        }
        if query.q.is_empty() && query.mode == SearchMode::Semantic {
            return Err(AppError::validation("Semantic search needs a query"));
        }

        Ok(query)
    }

    fn matches_filters(&self, bmark: &Bookmark) -> bool {
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
        bmark.has_tags(&self.tags)
    }

    fn matches_terms(&self, bmark: &Bookmark) -> bool {
        let haystack = [
            bmark.clean_title.as_str(),
            bmark.original_title.as_str(),
            bmark.ai_summary.as_deref().unwrap_or_default(),
            bmark.domain.as_str(),
        ]
        .join("\n")
        .to_lowercase();

        self.q.split_whitespace().all(|term| {
            let term = term.to_lowercase();
            haystack.contains(&term) || bmark.auto_tags.iter().any(|t| t.contains(&term))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub bookmark: Bookmark,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchHit>,
    pub count: usize,
}

/// Term search over the user's completed bookmarks, newest first.
pub fn keyword(mut bookmarks: Vec<Bookmark>, query: &SearchQuery) -> Vec<SearchHit> {
    bookmarks.retain(|b| {
        b.enrichment_status == EnrichmentStatus::Completed
            && query.matches_filters(b)
            && query.matches_terms(b)
    });
    bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

    bookmarks
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .map(|bookmark| SearchHit {
            bookmark,
            similarity: None,
        })
        .collect()
}

/// Nearest bookmarks to the embedded query that pass the filters.
pub fn semantic(
    index: &SemanticIndex,
    bmark_mgr: &Arc<dyn BookmarkManager>,
    user_id: &str,
    query: &SearchQuery,
    threshold: f32,
) -> Result<Vec<SearchHit>, AppError> {
    let matches = index
        .search(user_id, &query.q, threshold, query.limit * 2)
        .map_err(|err| AppError::Other(err.into()))?;

    Ok(matches
        .into_iter()
        .filter_map(|m| {
            let bookmark = bmark_mgr.find(&m.id)?;
            let visible = bookmark.user_id == user_id
                && bookmark.enrichment_status == EnrichmentStatus::Completed
                && query.matches_filters(&bookmark);
            visible.then(|| SearchHit {
                bookmark,
                similarity: Some((m.score * 1000.0).round() / 1000.0),
            })
        })
        .take(query.limit)
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub id: Eid,
    pub user_id: String,
    pub query: String,
    pub mode: SearchMode,
    pub results_count: usize,
    pub created_at: DateTime<Utc>,
}

pub struct SearchHistory {
    table: JsonTable<SearchHistoryEntry>,
}

impl SearchHistory {
    pub fn load(storage: Arc<dyn StorageManager>) -> anyhow::Result<Self> {
        Ok(SearchHistory {
            table: JsonTable::load(storage, "search_history.json")?,
        })
    }

    pub fn record(
        &self,
        user_id: &str,
        query: &str,
        mode: SearchMode,
        results_count: usize,
    ) -> Result<(), AppError> {
        self.table.mutate(|rows| {
            rows.push(SearchHistoryEntry {
                id: Eid::new(),
                user_id: user_id.to_string(),
                query: query.to_string(),
                mode,
                results_count,
                created_at: Utc::now(),
            });
            Ok(())
        })
    }

    /// Most recent distinct queries of the user.
    pub fn recent(&self, user_id: &str, limit: usize) -> Vec<SearchHistoryEntry> {
        let mut seen = HashSet::new();
        self.table
            .read()
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .filter(|e| seen.insert(e.query.to_lowercase()))
            .take(limit.clamp(1, MAX_HISTORY_LIMIT))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_query_requires_text_or_tag() {
        assert!(SearchQuery::from_pairs(&pairs(&[])).is_err());
        assert!(SearchQuery::from_pairs(&pairs(&[("q", "  ")])).is_err());
        assert!(SearchQuery::from_pairs(&pairs(&[("tag", "rust")])).is_ok());
        assert!(SearchQuery::from_pairs(&pairs(&[("tag", "rust"), ("mode", "semantic")])).is_err());
        assert!(SearchQuery::from_pairs(&pairs(&[("q", "x"), ("mode", "fuzzy")])).is_err());
    }

    #[test]
    fn test_limit_is_clamped() {
        let query = SearchQuery::from_pairs(&pairs(&[("q", "x"), ("limit", "1000")])).unwrap();
        assert_eq!(query.limit, MAX_LIMIT);

        let query = SearchQuery::from_pairs(&pairs(&[("q", "x")])).unwrap();
        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert_eq!(query.mode, SearchMode::Keyword);
    }

    #[test]
    fn test_history_is_deduplicated_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(
            crate::storage::BackendLocal::new(tmp.path().to_str().unwrap()).unwrap(),
        );
        let history = SearchHistory::load(storage).unwrap();

        history.record("u1", "rust", SearchMode::Keyword, 3).unwrap();
        history.record("u1", "tokio", SearchMode::Semantic, 1).unwrap();
        history.record("u1", "Rust", SearchMode::Keyword, 2).unwrap();
        history.record("u2", "other", SearchMode::Keyword, 0).unwrap();

        let recent = history.recent("u1", 10);
        let queries = recent.iter().map(|e| e.query.as_str()).collect::<Vec<_>>();
        assert_eq!(queries, vec!["Rust", "tokio"]);

        assert_eq!(history.recent("u1", 1).len(), 1);
    }
}
