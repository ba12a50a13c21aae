use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    app::errors::AppError,
    eid::Eid,
    storage::{JsonTable, StorageManager},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: Eid,
    pub user_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderView {
    #[serde(flatten)]
    pub folder: Folder,
    pub bookmark_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderCreate {
    #[serde(default)]
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderUpdate {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

pub struct FolderStore {
    table: JsonTable<Folder>,
}

fn clean_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Folder name is required"));
    }
    Ok(name.to_string())
}

fn ensure_unique(
    folders: &[Folder],
    user_id: &str,
    name: &str,
    except: Option<&Eid>,
) -> Result<(), AppError> {
    let taken = folders.iter().any(|f| {
        f.user_id == user_id && f.name.eq_ignore_ascii_case(name) && Some(&f.id) != except
    });
    if taken {
        return Err(AppError::conflict("Folder with this name already exists"));
    }
    Ok(())
}

impl FolderStore {
    pub fn load(storage: Arc<dyn StorageManager>) -> anyhow::Result<Self> {
        Ok(FolderStore {
            table: JsonTable::load(storage, "folders.json")?,
        })
    }

    /// Folders of a user ordered by name.
    pub fn list(&self, user_id: &str) -> Vec<Folder> {
        let mut folders: Vec<Folder> = self
            .table
            .read()
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect();
        folders.sort_by_key(|f| f.name.to_lowercase());
        folders
    }

    pub fn get(&self, user_id: &str, id: &Eid) -> Result<Folder, AppError> {
        self.table
            .read()
            .iter()
            .find(|f| &f.id == id && f.user_id == user_id)
            .cloned()
            .ok_or(AppError::NotFound("Folder"))
    }

    pub fn create(&self, user_id: &str, create: FolderCreate) -> Result<Folder, AppError> {
        let name = clean_name(&create.name)?;

        self.table.mutate(|folders| {
            ensure_unique(folders, user_id, &name, None)?;

            let now = Utc::now();
            let folder = Folder {
                id: Eid::new(),
                user_id: user_id.to_string(),
                name,
                icon: create.icon,
                color: create.color,
                created_at: now,
                updated_at: now,
            };
            folders.push(folder.clone());
            Ok(folder)
        })
    }

    pub fn update(&self, user_id: &str, id: &Eid, update: FolderUpdate) -> Result<Folder, AppError> {
        if update.name.is_none() && update.icon.is_none() && update.color.is_none() {
            return Err(AppError::validation("No valid fields to update"));
        }

        let name = update.name.as_deref().map(clean_name).transpose()?;

        self.table.mutate(|folders| {
            if let Some(name) = &name {
                ensure_unique(folders, user_id, name, Some(id))?;
            }

            let folder = folders
                .iter_mut()
                .find(|f| &f.id == id && f.user_id == user_id)
                .ok_or(AppError::NotFound("Folder"))?;

            if let Some(name) = name {
                folder.name = name;
            }
            if let Some(icon) = update.icon {
                folder.icon = Some(icon);
            }
            if let Some(color) = update.color {
                folder.color = Some(color);
            }
            folder.updated_at = Utc::now();

            Ok(folder.clone())
        })
    }

    pub fn delete(&self, user_id: &str, id: &Eid) -> Result<(), AppError> {
        self.table.mutate(|folders| {
            let idx = folders
                .iter()
                .position(|f| &f.id == id && f.user_id == user_id)
                .ok_or(AppError::NotFound("Folder"))?;
            folders.remove(idx);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn store() -> (FolderStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(BackendLocal::new(tmp.path().to_str().unwrap()).unwrap());
        (FolderStore::load(storage).unwrap(), tmp)
    }

    fn named(name: &str) -> FolderCreate {
        FolderCreate {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_names_are_unique_per_user_ignoring_case() {
        let (store, _tmp) = store();
        store.create("u1", named(" Reading ")).unwrap();

        let err = store.create("u1", named("reading")).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // another user may reuse the name
        store.create("u2", named("Reading")).unwrap();
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let (store, _tmp) = store();
        store.create("u1", named("zeta")).unwrap();
        store.create("u1", named("Alpha")).unwrap();

        let names: Vec<_> = store.list("u1").into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["Alpha", "zeta"]);
    }

    #[test]
    fn test_update_validates_fields() {
        let (store, _tmp) = store();
        let folder = store.create("u1", named("a")).unwrap();
        store.create("u1", named("b")).unwrap();

        let err = store
            .update("u1", &folder.id, FolderUpdate::default())
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = store
            .update(
                "u1",
                &folder.id,
                FolderUpdate {
                    name: Some("B".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let updated = store
            .update(
                "u1",
                &folder.id,
                FolderUpdate {
                    name: Some("a".to_string()),
                    color: Some("#ff0000".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn test_other_users_cannot_touch_folder() {
        let (store, _tmp) = store();
        let folder = store.create("u1", named("mine")).unwrap();

        assert!(matches!(
            store.delete("u2", &folder.id),
            Err(AppError::NotFound(_))
        ));
        assert!(store.delete("u1", &folder.id).is_ok());
    }
}
