//! Global search index.
//!
//! Entries from every module are merged, deduplicated by
//! `(owning_module_path, id)` and sorted so that the emitted artifact only
//! depends on the set of entries, never on the order modules finished.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::group::ModuleIndex;
use crate::symbol::{ModulePath, SymbolKind, SymbolRecord};

/// One row of the global search artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchEntry {
    pub owning_module_path: ModulePath,
    pub id: String,
    pub display_name: String,
    pub kind: SymbolKind,
}

impl From<&SymbolRecord> for SearchEntry {
    fn from(record: &SymbolRecord) -> Self {
        Self {
            owning_module_path: record.owning_module_path.clone(),
            id: record.id.clone(),
            display_name: record.display_name.clone(),
            kind: record.kind,
        }
    }
}

/// Flat, sorted list of every indexed symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalSearchIndex {
    entries: Vec<SearchEntry>,
}

impl GlobalSearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a finalized index from module indexes.
    pub fn from_modules<'a>(modules: impl IntoIterator<Item = &'a ModuleIndex>) -> Self {
        let mut index = Self::new();
        for module in modules {
            index.extend_from_module(module);
        }
        index.finalize();
        index
    }

    /// Add every record of a module. Call [`finalize`](Self::finalize) afterwards.
    pub fn extend_from_module(&mut self, module: &ModuleIndex) {
        self.entries.extend(module.records().map(SearchEntry::from));
    }

    pub fn push(&mut self, entry: SearchEntry) {
        self.entries.push(entry);
    }

    /// Deduplicate and sort into artifact order.
    pub fn finalize(&mut self) {
        self.entries.sort_by(|a, b| {
            a.owning_module_path
                .cmp(&b.owning_module_path)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.entries
            .dedup_by(|b, a| a.owning_module_path == b.owning_module_path && a.id == b.id);
        self.entries.sort_by_cached_key(|entry| {
            (
                entry.owning_module_path.clone(),
                entry.display_name.to_lowercase(),
                entry.id.clone(),
            )
        });
    }

    pub fn entries(&self) -> &[SearchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a previously emitted `search-index.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read search index {:?}", path))?;
        let mut index: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse search index {:?}", path))?;
        index.finalize();
        Ok(index)
    }

    /// Name lookup, best matches first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit<'_>> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit<'_>> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let score = match_name(query, &entry.display_name)
                    .max(match_name(query, &entry.id));
                (score > 0.0).then_some(SearchHit { entry, score })
            })
            .collect();

        // Stable on ties, so equal scores keep artifact order.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(limit);
        hits
    }
}

/// A search result.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub entry: &'a SearchEntry,
    /// Relevance score (higher is better)
    pub score: f64,
}

impl fmt::Display for SearchHit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} ({})",
            self.entry.owning_module_path, self.entry.display_name, self.entry.kind
        )
    }
}

/// Score `name` against `query`: exact, prefix, substring, then subsequence.
fn match_name(query: &str, name: &str) -> f64 {
    let query = query.to_lowercase();
    let name = name.to_lowercase();

    if name == query {
        return 1.0;
    }
    if name.starts_with(&query) {
        return 0.9;
    }
    if name.contains(&query) {
        return 0.7;
    }

    let mut score = 0.0;
    let mut consecutive = 0;
    let mut pending = query.chars().peekable();
    for c in name.chars() {
        match pending.peek() {
            Some(&qc) if qc == c => {
                pending.next();
                consecutive += 1;
                score += 0.1 + consecutive as f64 * 0.05;
            }
            Some(_) => consecutive = 0,
            None => break,
        }
    }

    if pending.peek().is_none() {
        // Stays below a substring match.
        (score / query.chars().count() as f64).min(0.6)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(module: &str, id: &str, display: &str) -> SearchEntry {
        SearchEntry {
            owning_module_path: ModulePath::parse(module).unwrap(),
            id: id.to_string(),
            display_name: display.to_string(),
            kind: SymbolKind::Struct,
        }
    }

    fn ids(index: &GlobalSearchIndex) -> Vec<(String, String)> {
        index
            .entries()
            .iter()
            .map(|e| (e.owning_module_path.to_string(), e.id.clone()))
            .collect()
    }

    #[test]
    fn test_finalize_dedups_and_sorts() {
        let mut index = GlobalSearchIndex::new();
        index.push(entry("util", "bar", "bar"));
        index.push(entry("core", "Zed", "Zed"));
        index.push(entry("core", "alpha", "alpha"));
        index.push(entry("util", "bar", "bar"));
        index.push(entry("core", "Beta", "Beta"));
        index.finalize();

        assert_eq!(
            ids(&index),
            vec![
                ("core".to_string(), "alpha".to_string()),
                ("core".to_string(), "Beta".to_string()),
                ("core".to_string(), "Zed".to_string()),
                ("util".to_string(), "bar".to_string()),
            ]
        );
    }

    #[test]
    fn test_finalize_is_order_independent() {
        let items = vec![
            entry("b", "x", "x"),
            entry("a", "y", "Y"),
            entry("a", "x", "y"),
            entry("b", "x", "x"),
        ];

        let mut forward = GlobalSearchIndex::new();
        items.iter().cloned().for_each(|e| forward.push(e));
        forward.finalize();

        let mut backward = GlobalSearchIndex::new();
        items.iter().rev().cloned().for_each(|e| backward.push(e));
        backward.finalize();

        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 3);
    }

    #[test]
    fn test_serializes_as_array() {
        let mut index = GlobalSearchIndex::new();
        index.push(entry("core", "Foo", "Foo"));
        let json = serde_json::to_value(&index).unwrap();

        assert_eq!(
            json,
            serde_json::json!([{
                "owningModulePath": ["core"],
                "id": "Foo",
                "displayName": "Foo",
                "kind": "Struct"
            }])
        );
    }

    #[test]
    fn test_search_ranking() {
        let mut index = GlobalSearchIndex::new();
        index.push(entry("core", "HashMapExt", "HashMapExt"));
        index.push(entry("core", "map", "map"));
        index.push(entry("core", "BitMap", "BitMap"));
        index.push(entry("core", "MaxAge", "MaxAge"));
        index.push(entry("core", "Unrelated", "Unrelated"));
        index.finalize();

        let hits = index.search("map", 10);
        let names: Vec<&str> = hits.iter().map(|h| h.entry.id.as_str()).collect();

        assert_eq!(names[0], "map");
        assert!(names.contains(&"HashMapExt"));
        assert!(names.contains(&"BitMap"));
        assert!(!names.contains(&"Unrelated"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(index.search("map", 1).len(), 1);
        assert!(index.search("  ", 10).is_empty());
    }

    #[test]
    fn test_match_name_tiers() {
        assert_eq!(match_name("foo", "Foo"), 1.0);
        assert_eq!(match_name("foo", "FooBar"), 0.9);
        assert_eq!(match_name("bar", "FooBar"), 0.7);
        let fuzzy = match_name("fb", "FooBar");
        assert!(fuzzy > 0.0 && fuzzy < 0.7);
        assert_eq!(match_name("zz", "FooBar"), 0.0);
    }
}
