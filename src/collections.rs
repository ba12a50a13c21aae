//! Hand-curated bookmark collections.
//!
//! Unlike folders a bookmark may sit in any number of collections, so
//! membership lives in its own table keyed by (collection, bookmark).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    app::errors::AppError,
    bookmarks::Bookmark,
    eid::Eid,
    storage::{JsonTable, StorageManager},
};

pub const DEFAULT_ICON: &str = "📁";
pub const DEFAULT_COLOR: &str = "#6366f1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: Eid,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub collection_id: Eid,
    pub bookmark_id: Eid,
    pub user_id: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionView {
    #[serde(flatten)]
    pub collection: Collection,
    pub bookmark_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionDetail {
    #[serde(flatten)]
    pub collection: Collection,
    pub bookmark_count: usize,
    /// Most recently added first
    pub bookmarks: Vec<Bookmark>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionCreate {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

pub struct CollectionStore {
    table: JsonTable<Collection>,
    members: JsonTable<Membership>,
}

fn clean_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Collection name is required"));
    }
    Ok(name.to_string())
}

fn clean_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

fn owned<'a>(
    collections: &'a mut [Collection],
    user_id: &str,
    id: &Eid,
) -> Result<&'a mut Collection, AppError> {
    collections
        .iter_mut()
        .find(|c| &c.id == id && c.user_id == user_id)
        .ok_or(AppError::NotFound("Collection"))
}

impl CollectionStore {
    pub fn load(storage: Arc<dyn StorageManager>) -> anyhow::Result<Self> {
        Ok(CollectionStore {
            table: JsonTable::load(storage.clone(), "collections.json")?,
            members: JsonTable::load(storage, "collection_bookmarks.json")?,
        })
    }

    /// Collections of a user, last touched first.
    pub fn list(&self, user_id: &str) -> Vec<CollectionView> {
        let mut counts: HashMap<Eid, usize> = HashMap::new();
        for member in self.members.read().iter().filter(|m| m.user_id == user_id) {
            *counts.entry(member.collection_id.clone()).or_default() += 1;
        }

        let mut views: Vec<CollectionView> = self
            .table
            .read()
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| CollectionView {
                bookmark_count: counts.get(&c.id).copied().unwrap_or(0),
                collection: c.clone(),
            })
            .collect();
        views.sort_by(|a, b| b.collection.updated_at.cmp(&a.collection.updated_at));
        views
    }

    pub fn get(&self, user_id: &str, id: &Eid) -> Result<Collection, AppError> {
        self.table
            .read()
            .iter()
            .find(|c| &c.id == id && c.user_id == user_id)
            .cloned()
            .ok_or(AppError::NotFound("Collection"))
    }

    /// Bookmark ids of the collection, most recently added first.
    pub fn bookmark_ids(&self, collection_id: &Eid) -> Vec<Eid> {
        let mut members: Vec<Membership> = self
            .members
            .read()
            .iter()
            .rev()
            .filter(|m| &m.collection_id == collection_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        members.into_iter().map(|m| m.bookmark_id).collect()
    }

    pub fn create(&self, user_id: &str, create: CollectionCreate) -> Result<Collection, AppError> {
        let name = clean_name(&create.name)?;

        self.table.mutate(|collections| {
            let now = Utc::now();
            let collection = Collection {
                id: Eid::new(),
                user_id: user_id.to_string(),
                name,
                description: clean_description(create.description),
                icon: create.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
                color: create.color.unwrap_or_else(|| DEFAULT_COLOR.to_string()),
                created_at: now,
                updated_at: now,
            };
            collections.push(collection.clone());
            Ok(collection)
        })
    }

    pub fn update(
        &self,
        user_id: &str,
        id: &Eid,
        update: CollectionUpdate,
    ) -> Result<Collection, AppError> {
        if update.name.is_none()
            && update.description.is_none()
            && update.icon.is_none()
            && update.color.is_none()
        {
            return Err(AppError::validation("No valid fields to update"));
        }

        let name = update.name.as_deref().map(clean_name).transpose()?;

        self.table.mutate(|collections| {
            let collection = owned(collections, user_id, id)?;

            if let Some(name) = name {
                collection.name = name;
            }
            if update.description.is_some() {
                // an empty description clears it
                collection.description = clean_description(update.description);
            }
            if let Some(icon) = update.icon {
                collection.icon = icon;
            }
            if let Some(color) = update.color {
                collection.color = color;
            }
            collection.updated_at = Utc::now();

            Ok(collection.clone())
        })
    }

    pub fn delete(&self, user_id: &str, id: &Eid) -> Result<(), AppError> {
        self.table.mutate(|collections| {
            let idx = collections
                .iter()
                .position(|c| &c.id == id && c.user_id == user_id)
                .ok_or(AppError::NotFound("Collection"))?;
            collections.remove(idx);
            Ok(())
        })?;

        self.members.mutate(|members| {
            members.retain(|m| &m.collection_id != id);
            Ok(())
        })
    }

    /// Adds a bookmark to the collection. Adding it twice is a no-op.
    ///
    /// `bookmark_exists` is consulted under the membership lock, so a
    /// bookmark deleted concurrently either fails here or has its membership
    /// swept by [`CollectionStore::remove_bookmarks`] afterwards.
    pub fn add_bookmark(
        &self,
        user_id: &str,
        id: &Eid,
        bookmark_id: &Eid,
        bookmark_exists: &dyn Fn(&Eid) -> bool,
    ) -> Result<(), AppError> {
        self.get(user_id, id)?;

        let added = self.members.mutate(|members| {
            let present = members
                .iter()
                .any(|m| &m.collection_id == id && &m.bookmark_id == bookmark_id);
            if present {
                return Ok(false);
            }
            if !bookmark_exists(bookmark_id) {
                return Err(AppError::NotFound("Bookmark"));
            }

            members.push(Membership {
                collection_id: id.clone(),
                bookmark_id: bookmark_id.clone(),
                user_id: user_id.to_string(),
                added_at: Utc::now(),
            });
            Ok(true)
        })?;

        if added {
            self.touch(user_id, id)?;
        }
        Ok(())
    }

    /// Takes a bookmark out of the collection. Removing a bookmark that is
    /// not in it succeeds.
    pub fn remove_bookmark(&self, user_id: &str, id: &Eid, bookmark_id: &Eid) -> Result<(), AppError> {
        self.get(user_id, id)?;

        let removed = self.members.mutate(|members| {
            let before = members.len();
            members.retain(|m| !(&m.collection_id == id && &m.bookmark_id == bookmark_id));
            Ok(before != members.len())
        })?;

        if removed {
            self.touch(user_id, id)?;
        }
        Ok(())
    }

    /// Drops every membership of the given bookmarks. Returns how many went.
    pub fn remove_bookmarks(&self, bookmark_ids: &[Eid]) -> Result<usize, AppError> {
        if bookmark_ids.is_empty() {
            return Ok(0);
        }

        self.members.mutate(|members| {
            let before = members.len();
            members.retain(|m| !bookmark_ids.contains(&m.bookmark_id));
            Ok(before - members.len())
        })
    }

    fn touch(&self, user_id: &str, id: &Eid) -> Result<(), AppError> {
        self.table.mutate(|collections| {
            // gone in the meantime, nothing left to touch
            if let Ok(collection) = owned(collections, user_id, id) {
                collection.updated_at = Utc::now();
            }
            Ok(())
        })
    }
}
