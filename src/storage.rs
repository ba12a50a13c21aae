use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{app::errors::AppError, eid::Eid};

pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
}

#[derive(Clone)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: &str) -> std::io::Result<Self> {
        let path = PathBuf::from(storage_dir);
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.base_dir.join(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.base_dir.join(ident))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.base_dir.join(ident);
        let temp_path = self.base_dir.join(format!("{}-{ident}", Eid::new()));

        std::fs::write(&temp_path, data)?;

        std::fs::rename(&temp_path, &path)
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.base_dir.join(ident))
    }
}

/// A list of rows kept in memory and snapshotted to a single JSON file
/// after every successful mutation.
pub struct JsonTable<T> {
    rows: RwLock<Vec<T>>,
    ident: String,
    storage: Arc<dyn StorageManager>,
}

impl<T> JsonTable<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn load(storage: Arc<dyn StorageManager>, ident: &str) -> anyhow::Result<Self> {
        let rows = if storage.exists(ident) {
            let data = storage.read(ident)?;
            serde_json::from_slice(&data)
                .map_err(|err| anyhow::anyhow!("{ident} is malformed: {err}"))?
        } else {
            log::info!("creating new table {ident}");
            vec![]
        };

        Ok(JsonTable {
            rows: RwLock::new(rows),
            ident: ident.to_string(),
            storage,
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` under the write lock and persists the table if it succeeds.
    /// The snapshot is written before the lock is released so concurrent
    /// writers never persist out of order.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<T>) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged = rows.clone();
        let result = f(&mut staged)?;

        let data = serde_json::to_vec(&staged)?;
        self.storage.write(&self.ident, &data)?;
        *rows = staged;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
    }

    #[test]
    fn test_table_persists_mutations() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> =
            Arc::new(BackendLocal::new(tmp.path().to_str().unwrap()).unwrap());

        let table = JsonTable::<Row>::load(storage.clone(), "rows.json").unwrap();
        table
            .mutate(|rows| {
                rows.push(Row {
                    name: "a".to_string(),
                });
                Ok(())
            })
            .unwrap();

        let reloaded = JsonTable::<Row>::load(storage, "rows.json").unwrap();
        assert_eq!(reloaded.read().len(), 1);
        assert_eq!(reloaded.read()[0].name, "a");
    }

    #[test]
    fn test_failed_mutation_is_not_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> =
            Arc::new(BackendLocal::new(tmp.path().to_str().unwrap()).unwrap());

        let table = JsonTable::<Row>::load(storage.clone(), "rows.json").unwrap();
        let result: Result<(), AppError> = table.mutate(|rows| {
            rows.push(Row {
                name: "b".to_string(),
            });
            Err(AppError::validation("nope"))
        });

        assert!(result.is_err());
        assert!(table.read().is_empty());
        assert!(!storage.exists("rows.json"));
    }
}
