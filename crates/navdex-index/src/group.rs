//! Grouping and display ordering of module symbols.
//!
//! Grouping is a pure, total function: every record lands in exactly one
//! kind group, and the order inside a group depends only on the records
//! themselves and their declaration order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::symbol::{ModulePath, SymbolKind, SymbolRecord};

/// Records grouped by kind, in [`SymbolKind`] order.
pub type SymbolsByKind = BTreeMap<SymbolKind, Vec<SymbolRecord>>;

/// Group records by kind.
///
/// Within a group, records are ordered by display name compared
/// case-insensitively; equal names keep their relative input order, which
/// callers pass as declaration order.
pub fn group_by_kind(records: Vec<SymbolRecord>) -> SymbolsByKind {
    let mut groups = SymbolsByKind::new();
    for record in records {
        groups.entry(record.kind).or_default().push(record);
    }
    for group in groups.values_mut() {
        // Stable sort: ties stay in declaration order.
        group.sort_by_cached_key(|record| record.display_name.to_lowercase());
    }
    groups
}

/// Navigation index of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleIndex {
    pub module_path: ModulePath,
    pub symbols_by_kind: SymbolsByKind,
    pub child_modules: Vec<ModulePath>,
}

impl ModuleIndex {
    /// Build an index from records in declaration order.
    pub fn new(
        module_path: ModulePath,
        records: Vec<SymbolRecord>,
        child_modules: Vec<ModulePath>,
    ) -> Self {
        Self {
            module_path,
            symbols_by_kind: group_by_kind(records),
            child_modules,
        }
    }

    /// Records of one kind, in display order.
    pub fn symbols(&self, kind: SymbolKind) -> &[SymbolRecord] {
        self.symbols_by_kind
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All records, kind by kind.
    pub fn records(&self) -> impl Iterator<Item = &SymbolRecord> {
        self.symbols_by_kind.values().flatten()
    }

    /// Look up a record by id.
    pub fn find(&self, id: &str) -> Option<&SymbolRecord> {
        self.records().find(|record| record.id == id)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols_by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols_by_kind.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, kind: SymbolKind) -> SymbolRecord {
        SymbolRecord::new(id, kind, ModulePath::parse("m").unwrap())
    }

    fn names(records: &[SymbolRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_groups_by_kind_in_kind_order() {
        let groups = group_by_kind(vec![
            record("parse", SymbolKind::Function),
            record("Foo", SymbolKind::Struct),
            record("Color", SymbolKind::Enum),
            record("weird", SymbolKind::Other),
        ]);

        let kinds: Vec<SymbolKind> = groups.keys().copied().collect();
        assert_eq!(
            kinds,
            vec![
                SymbolKind::Struct,
                SymbolKind::Enum,
                SymbolKind::Function,
                SymbolKind::Other
            ]
        );
    }

    #[test]
    fn test_sort_is_case_insensitive() {
        let groups = group_by_kind(vec![
            record("beta", SymbolKind::Struct),
            record("Alpha", SymbolKind::Struct),
            record("gamma", SymbolKind::Struct),
            record("Delta", SymbolKind::Struct),
        ]);

        assert_eq!(
            names(&groups[&SymbolKind::Struct]),
            vec!["Alpha", "beta", "Delta", "gamma"]
        );
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let first = record("first", SymbolKind::Function).with_display_name("run");
        let second = record("second", SymbolKind::Function).with_display_name("Run");
        let third = record("third", SymbolKind::Function).with_display_name("RUN");

        let groups = group_by_kind(vec![second.clone(), first.clone(), third.clone()]);
        assert_eq!(
            names(&groups[&SymbolKind::Function]),
            vec!["second", "first", "third"]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(group_by_kind(Vec::new()).is_empty());
    }

    #[test]
    fn test_module_index_accessors() {
        let index = ModuleIndex::new(
            ModulePath::parse("m").unwrap(),
            vec![
                record("Foo", SymbolKind::Struct),
                record("run", SymbolKind::Function),
            ],
            vec![ModulePath::parse("m::inner").unwrap()],
        );

        assert_eq!(index.symbol_count(), 2);
        assert_eq!(index.symbols(SymbolKind::Struct).len(), 1);
        assert!(index.symbols(SymbolKind::Trait).is_empty());
        assert_eq!(index.find("run").unwrap().kind, SymbolKind::Function);
        assert!(index.find("missing").is_none());
    }
}
