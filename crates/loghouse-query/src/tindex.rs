//! Tag Index
//!
//! Resolves tag expressions to the journals they select. The index itself
//! is an external collaborator of the read path - the cursor only needs
//! [`TagIndex::get_journals`] - but an in-memory implementation ships here
//! for wiring the engine and its tests.
//!
//! Journal ids are the lowercase hex of the FNV-1a hash of the canonical
//! tag line, so the same tags always map to the same on-disk directory.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use loghouse_core::{hash::fnv1a64, JournalId, Result, TagLine, TagSet};

use crate::lql::TagExpr;

/// Lookup service mapping tag expressions to `(tag line, journal id)`
/// pairs. Deterministic and cheap; the cursor treats it as a pure lookup.
#[async_trait]
pub trait TagIndex: Send + Sync {
    /// Returns up to `limit` matching journals, sorted by tag line.
    async fn get_journals(
        &self,
        expr: &TagExpr,
        limit: usize,
    ) -> Result<Vec<(TagLine, JournalId)>>;
}

/// In-memory tag index.
#[derive(Default)]
pub struct InMemoryTagIndex {
    known: RwLock<BTreeMap<TagLine, (TagSet, JournalId)>>,
}

impl InMemoryTagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the journal id for a tag set, registering it on first use.
    pub fn get_or_assign(&self, tags: &TagSet) -> JournalId {
        let line = tags.line();
        {
            let known = self.known.read().expect("tag index lock poisoned");
            if let Some((_, id)) = known.get(&line) {
                return id.clone();
            }
        }
        // The id is a pure function of the line, so a racing writer inserts
        // the same value.
        let id = format!("{:016x}", fnv1a64(line.as_str().as_bytes()));
        let mut known = self.known.write().expect("tag index lock poisoned");
        known
            .entry(line)
            .or_insert_with(|| (tags.clone(), id.clone()));
        id
    }
}

#[async_trait]
impl TagIndex for InMemoryTagIndex {
    async fn get_journals(
        &self,
        expr: &TagExpr,
        limit: usize,
    ) -> Result<Vec<(TagLine, JournalId)>> {
        let known = self.known.read().expect("tag index lock poisoned");
        Ok(known
            .iter()
            .filter(|(_, (tags, _))| expr.matches(tags))
            .take(limit)
            .map(|(line, (_, id))| (line.clone(), id.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lql::parse_source_expr;

    fn tags(s: &str) -> TagSet {
        TagSet::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_assign_is_stable() {
        let idx = InMemoryTagIndex::new();
        let a = idx.get_or_assign(&tags("name=app,pod=p1"));
        let b = idx.get_or_assign(&tags("pod=p1,name=app"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn test_get_journals_filters() {
        let idx = InMemoryTagIndex::new();
        idx.get_or_assign(&tags("name=a"));
        idx.get_or_assign(&tags("name=b"));
        idx.get_or_assign(&tags("name=a,pod=x"));

        let expr = parse_source_expr("name=a").unwrap();
        let found = idx.get_journals(&expr, 10).await.unwrap();
        assert_eq!(found.len(), 2);
        // Sorted by tag line.
        assert!(found[0].0 < found[1].0);
    }

    #[tokio::test]
    async fn test_get_journals_respects_limit() {
        let idx = InMemoryTagIndex::new();
        for i in 0..5 {
            idx.get_or_assign(&tags(&format!("name=app,pod=p{}", i)));
        }
        let expr = parse_source_expr("name=app").unwrap();
        let found = idx.get_journals(&expr, 3).await.unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_no_match() {
        let idx = InMemoryTagIndex::new();
        idx.get_or_assign(&tags("name=a"));
        let expr = parse_source_expr("name=ghost").unwrap();
        assert!(idx.get_journals(&expr, 10).await.unwrap().is_empty());
    }
}
