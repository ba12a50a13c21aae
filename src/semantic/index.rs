//! Per-user cosine similarity over bookmark embeddings.
//!
//! Vectors are normalised on insert, so scoring a query is one dot product
//! per candidate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::eid::Eid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: Eid,
    pub user_id: String,
    /// Unit length once inside the index
    pub embedding: Vec<f32>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IndexError {
    #[error("vector has {got} dimensions, index holds {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot index a zero vector")]
    ZeroNormVector,
}

#[derive(Debug, Default)]
pub struct VectorIndex {
    entries: HashMap<Eid, VectorEntry>,
    /// Fixed by the first vector, released when the index empties
    dimensions: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: Eid,
    pub score: f32,
}

fn normalized(mut v: Vec<f32>) -> Result<Vec<f32>, IndexError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON || !norm.is_finite() {
        return Err(IndexError::ZeroNormVector);
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(v)
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an index from persisted entries, dropping the ones that no
    /// longer fit (zero vectors, a dimension differing from the first entry).
    pub fn from_entries(stored: Vec<VectorEntry>) -> Self {
        stored.into_iter().fold(Self::new(), |mut index, entry| {
            let id = entry.id.clone();
            if let Err(err) = index.insert(entry.id, entry.user_id, entry.embedding) {
                log::warn!("[{id}] dropping stored vector: {err}");
            }
            index
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Eid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &VectorEntry> {
        self.entries.values()
    }

    fn check_dimensions(&self, got: usize) -> Result<(), IndexError> {
        match self.dimensions {
            Some(expected) if expected != got => {
                Err(IndexError::DimensionMismatch { expected, got })
            }
            _ => Ok(()),
        }
    }

    /// Adds the bookmark's vector, replacing any previous one.
    pub fn insert(
        &mut self,
        id: Eid,
        user_id: String,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        self.check_dimensions(embedding.len())?;
        let embedding = normalized(embedding)?;

        self.dimensions = Some(embedding.len());
        self.entries.insert(
            id.clone(),
            VectorEntry {
                id,
                user_id,
                embedding,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: &Eid) -> Option<VectorEntry> {
        let removed = self.entries.remove(id);
        if self.entries.is_empty() {
            self.dimensions = None;
        }
        removed
    }

    /// The user's entries scoring at least `threshold`, best first.
    pub fn search(
        &self,
        user_id: &str,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if self.dimensions.is_none() {
            return Ok(vec![]);
        }
        self.check_dimensions(query.len())?;
        let query = normalized(query.to_vec())?;

        let mut hits = self
            .entries
            .values()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| SearchResult {
                id: entry.id.clone(),
                score: dot(&query, &entry.embedding),
            })
            .filter(|hit| hit.score >= threshold)
            .collect::<Vec<_>>();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> Eid {
        Eid::from(s)
    }

    #[test]
    fn test_search_orders_by_similarity_and_applies_threshold() {
        let mut index = VectorIndex::new();
        index.insert(eid("a"), "u1".into(), vec![1.0, 0.0]).unwrap();
        index.insert(eid("b"), "u1".into(), vec![0.7, 0.7]).unwrap();
        index.insert(eid("c"), "u1".into(), vec![0.0, 1.0]).unwrap();

        let hits = index.search("u1", &[1.0, 0.1], 0.3, 10).unwrap();
        let ids: Vec<_> = hits.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_scores_ignore_magnitude() {
        let mut index = VectorIndex::new();
        index.insert(eid("a"), "u1".into(), vec![10.0, 0.0]).unwrap();

        let hits = index.search("u1", &[0.5, 0.0], 0.0, 1).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_is_scoped_to_user() {
        let mut index = VectorIndex::new();
        index.insert(eid("a"), "u1".into(), vec![1.0, 0.0]).unwrap();
        index.insert(eid("b"), "u2".into(), vec![1.0, 0.0]).unwrap();

        let hits = index.search("u2", &[1.0, 0.0], 0.0, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, eid("b"));
    }

    #[test]
    fn test_insert_validates_vectors() {
        let mut index = VectorIndex::new();
        index.insert(eid("a"), "u1".into(), vec![1.0, 0.0]).unwrap();

        assert_eq!(
            index.insert(eid("b"), "u1".into(), vec![1.0]),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        );
        assert_eq!(
            index.insert(eid("c"), "u1".into(), vec![0.0, 0.0]),
            Err(IndexError::ZeroNormVector)
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index = VectorIndex::new();
        assert!(index.search("u1", &[1.0], 0.0, 5).unwrap().is_empty());
    }

    #[test]
    fn test_from_entries_drops_misfits() {
        let entry = |id: &str, embedding: Vec<f32>| VectorEntry {
            id: eid(id),
            user_id: "u1".into(),
            embedding,
        };
        let index = VectorIndex::from_entries(vec![
            entry("a", vec![1.0, 0.0]),
            entry("b", vec![1.0, 0.0, 0.0]),
            entry("c", vec![0.0, 0.0]),
        ]);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&eid("a")));
    }

    #[test]
    fn test_removing_last_entry_resets_dimensions() {
        let mut index = VectorIndex::new();
        index.insert(eid("a"), "u1".into(), vec![1.0, 0.0]).unwrap();
        index.remove(&eid("a"));
        index.insert(eid("b"), "u1".into(), vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.len(), 1);
    }
}
