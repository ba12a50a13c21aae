//! Public profile pages and their e-mail subscribers.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};

use crate::{
    app::errors::AppError,
    bookmarks::{Bookmark, BookmarkManager},
    config::UserConfig,
    eid::Eid,
    storage::{JsonTable, StorageManager},
};

const MAX_PUBLIC_BOOKMARKS: usize = 100;

static EMAIL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

/// Strips the `@` prefix used in profile urls.
pub fn handle_to_username(handle: &str) -> &str {
    handle.trim().trim_start_matches('@')
}

pub fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    let valid = EMAIL.as_ref().map(|re| re.is_match(&email)).unwrap_or(false);
    if !valid {
        return Err(AppError::validation("Invalid email address"));
    }
    Ok(email)
}

/// The slice of a bookmark shown on a profile page. Notes, owner id and
/// enrichment bookkeeping stay private.
#[derive(Debug, Clone, Serialize)]
pub struct PublicBookmark {
    pub id: Eid,
    pub url: String,
    pub original_title: String,
    pub clean_title: String,
    pub user_description: Option<String>,
    pub ai_summary: Option<String>,
    pub auto_tags: Vec<String>,
    pub domain: String,
    pub favicon_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_public: bool,
    pub is_saved_by_viewer: bool,
}

impl PublicBookmark {
    fn new(bmark: Bookmark, is_saved_by_viewer: bool) -> Self {
        PublicBookmark {
            id: bmark.id,
            url: bmark.url,
            original_title: bmark.original_title,
            clean_title: bmark.clean_title,
            user_description: bmark.user_description,
            ai_summary: bmark.ai_summary,
            auto_tags: bmark.auto_tags,
            domain: bmark.domain,
            favicon_url: bmark.favicon_url,
            created_at: bmark.created_at,
            is_public: bmark.is_public,
            is_saved_by_viewer,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicProfile {
    pub avatar_url: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicBookmarks {
    pub bookmarks: Vec<PublicBookmark>,
    pub total_count: usize,
    pub username: String,
    pub is_owner: bool,
    pub profile: PublicProfile,
}

/// The owner sees every bookmark; anyone else only the public ones.
pub fn profile_bookmarks(
    bmark_mgr: &Arc<dyn BookmarkManager>,
    owner: &UserConfig,
    viewer: Option<&UserConfig>,
) -> PublicBookmarks {
    let is_owner = viewer.map(|v| v.id == owner.id).unwrap_or(false);

    let mut bookmarks = bmark_mgr
        .all(&owner.id)
        .into_iter()
        .filter(|b| is_owner || b.is_public)
        .collect::<Vec<_>>();
    bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    let total_count = bookmarks.len();
    bookmarks.truncate(MAX_PUBLIC_BOOKMARKS);

    // only other signed-in users can have saved one of these
    let saved: HashSet<String> = match viewer {
        Some(viewer) if !is_owner => bmark_mgr.all(&viewer.id).into_iter().map(|b| b.url).collect(),
        _ => HashSet::new(),
    };

    let bookmarks = bookmarks
        .into_iter()
        .map(|bmark| {
            let is_saved = saved.contains(&bmark.url);
            PublicBookmark::new(bmark, is_saved)
        })
        .collect::<Vec<_>>();

    PublicBookmarks {
        total_count,
        bookmarks,
        username: owner.username.clone(),
        is_owner,
        profile: PublicProfile {
            avatar_url: owner.avatar_url.clone(),
            full_name: owner.full_name.clone(),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Eid,
    /// Profile being followed
    pub owner_id: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct SubscriberStore {
    table: JsonTable<Subscriber>,
}

impl SubscriberStore {
    pub fn load(storage: Arc<dyn StorageManager>) -> anyhow::Result<Self> {
        Ok(SubscriberStore {
            table: JsonTable::load(storage, "subscribers.json")?,
        })
    }

    /// Adds or reactivates a subscription.
    pub fn subscribe(&self, owner_id: &str, email: &str) -> Result<Subscriber, AppError> {
        let email = normalize_email(email)?;

        self.table.mutate(|subs| {
            let now = Utc::now();
            match subs
                .iter_mut()
                .find(|s| s.owner_id == owner_id && s.email == email)
            {
                Some(sub) if sub.is_active => Err(AppError::conflict("Already subscribed")),
                Some(sub) => {
                    sub.is_active = true;
                    sub.updated_at = now;
                    Ok(sub.clone())
                }
                None => {
                    let sub = Subscriber {
                        id: Eid::new(),
                        owner_id: owner_id.to_string(),
                        email,
                        is_active: true,
                        created_at: now,
                        updated_at: now,
                    };
                    subs.push(sub.clone());
                    Ok(sub)
                }
            }
        })
    }

    pub fn unsubscribe(&self, owner_id: &str, email: &str) -> Result<(), AppError> {
        let email = normalize_email(email)?;

        self.table.mutate(|subs| {
            let sub = subs
                .iter_mut()
                .find(|s| s.owner_id == owner_id && s.email == email && s.is_active)
                .ok_or(AppError::NotFound("Subscription"))?;
            sub.is_active = false;
            sub.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn count(&self, owner_id: &str) -> usize {
        self.table
            .read()
            .iter()
            .filter(|s| s.owner_id == owner_id && s.is_active)
            .count()
    }

    /// Active subscribers, newest first.
    pub fn list(&self, owner_id: &str) -> Vec<Subscriber> {
        let mut subs = self
            .table
            .read()
            .iter()
            .filter(|s| s.owner_id == owner_id && s.is_active)
            .cloned()
            .collect::<Vec<_>>();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        subs
    }

    pub fn is_subscribed(&self, owner_id: &str, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.table
            .read()
            .iter()
            .any(|s| s.owner_id == owner_id && s.email == email && s.is_active)
    }

    pub fn remove(&self, owner_id: &str, email: &str) -> Result<(), AppError> {
        let email = email.trim().to_lowercase();

        self.table.mutate(|subs| {
            let idx = subs
                .iter()
                .position(|s| s.owner_id == owner_id && s.email == email)
                .ok_or(AppError::NotFound("Subscriber"))?;
            subs.remove(idx);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn store() -> (SubscriberStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> =
            Arc::new(BackendLocal::new(tmp.path().to_str().unwrap()).unwrap());
        (SubscriberStore::load(storage).unwrap(), tmp)
    }

    #[test]
    fn test_email_validation() {
        assert_eq!(normalize_email(" Ann@Example.COM ").unwrap(), "ann@example.com");
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("a@b").is_err());
        assert!(normalize_email("").is_err());
    }

    #[test]
    fn test_handle_to_username() {
        assert_eq!(handle_to_username("@alice"), "alice");
        assert_eq!(handle_to_username("alice"), "alice");
    }

    #[test]
    fn test_subscribe_lifecycle() {
        let (store, _tmp) = store();

        store.subscribe("owner", "fan@example.com").unwrap();
        assert!(matches!(
            store.subscribe("owner", "FAN@example.com"),
            Err(AppError::Conflict(_))
        ));
        assert_eq!(store.count("owner"), 1);
        assert!(store.is_subscribed("owner", "fan@example.com"));

        store.unsubscribe("owner", "fan@example.com").unwrap();
        assert_eq!(store.count("owner"), 0);
        assert!(matches!(
            store.unsubscribe("owner", "fan@example.com"),
            Err(AppError::NotFound(_))
        ));

        // coming back reactivates the same row
        let again = store.subscribe("owner", "fan@example.com").unwrap();
        assert!(again.is_active);
        assert_eq!(store.list("owner").len(), 1);

        store.remove("owner", "fan@example.com").unwrap();
        assert!(store.list("owner").is_empty());
        assert!(store.remove("owner", "fan@example.com").is_err());
    }
}
