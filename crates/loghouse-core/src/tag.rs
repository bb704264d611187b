//! Tags and Tag Lines
//!
//! A journal is identified by the set of tags its producer supplied
//! (`name=app,pod=x`). Two representations exist:
//!
//! - [`TagSet`]: the parsed, sorted key/value map used for matching
//! - [`TagLine`]: the canonical string rendering (`k1=v1,k2=v2`, keys sorted
//!   lexicographically), immutable once a journal is created
//!
//! The canonical form makes tag lines comparable and hashable: the same set
//! of tags always renders to the same line regardless of input order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A sorted set of key=value tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: BTreeMap<String, String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list of `key=value` pairs.
    ///
    /// Whitespace around keys and values is trimmed. Empty keys and pairs
    /// without `=` are rejected with `Error::Parse`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut tags = BTreeMap::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::Parse(format!("tag \"{}\" is not key=value", part)))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(Error::Parse(format!("empty tag key in \"{}\"", part)));
            }
            tags.insert(k.to_string(), v.trim().to_string());
        }
        Ok(Self { tags })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the canonical tag line: keys sorted, `k=v` joined by commas.
    pub fn line(&self) -> TagLine {
        let line = self
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        TagLine(line)
    }
}

/// Canonical, sorted string form of a tag set. Immutable.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagLine(String);

impl TagLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the line back into a tag set.
    pub fn to_tag_set(&self) -> Result<TagSet> {
        TagSet::parse(&self.0)
    }
}

impl fmt::Display for TagLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
