//! Aggregation of module symbols and re-export resolution.
//!
//! A [`ModuleSnapshot`] is built once, sequentially, from every discovered
//! module. It is read-only afterwards, so any number of workers can run an
//! [`Aggregator`] over it at the same time.
//!
//! Re-export chains are followed with an explicit loop bounded by
//! `max_reexport_depth` and a visited set. A chain that revisits a name or
//! runs past the bound is a [`ResolveError::CyclicReexport`]; the module
//! holding it then keeps its local symbols only.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::group::ModuleIndex;
use crate::source::{IndexError, LocalSymbol, ModuleSource, Reexport};
use crate::symbol::{ModulePath, QualifiedName, SymbolRecord, Visibility};

/// Default bound on re-export chain length.
pub const DEFAULT_MAX_REEXPORT_DEPTH: usize = 32;

/// Per-alias resolution failures. Neither aborts the build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("cyclic re-export of `{alias}` in {module}: {}", format_chain(.chain))]
    CyclicReexport {
        module: ModulePath,
        alias: String,
        chain: Vec<QualifiedName>,
    },

    #[error("dangling re-export `{alias}` in {module}: `{target}` not found")]
    DanglingReexport {
        module: ModulePath,
        alias: String,
        target: String,
    },
}

impl ResolveError {
    /// Module holding the failed directive.
    pub fn module(&self) -> &ModulePath {
        match self {
            ResolveError::CyclicReexport { module, .. } => module,
            ResolveError::DanglingReexport { module, .. } => module,
        }
    }

    pub fn is_cyclic(&self) -> bool {
        matches!(self, ResolveError::CyclicReexport { .. })
    }
}

fn format_chain(chain: &[QualifiedName]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Options that change aggregation output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregatorConfig {
    /// Longest re-export chain followed before reporting a cycle
    pub max_reexport_depth: usize,
    /// Least visible symbol that is still indexed
    pub visibility: Visibility,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_reexport_depth: DEFAULT_MAX_REEXPORT_DEPTH,
            visibility: Visibility::Public,
        }
    }
}

/// One module inside the snapshot, with lookup tables by id.
#[derive(Debug)]
struct SnapshotModule {
    source: ModuleSource,
    locals: HashMap<String, usize>,
    reexports: HashMap<String, usize>,
}

impl SnapshotModule {
    fn new(source: ModuleSource) -> Self {
        let mut locals = HashMap::new();
        for (position, symbol) in source.local_symbols.iter().enumerate() {
            locals.entry(symbol.id.clone()).or_insert(position);
        }
        let mut reexports = HashMap::new();
        for (position, reexport) in source.reexports.iter().enumerate() {
            reexports.entry(reexport.alias.clone()).or_insert(position);
        }
        Self {
            source,
            locals,
            reexports,
        }
    }

    fn local(&self, id: &str) -> Option<&LocalSymbol> {
        self.locals
            .get(id)
            .and_then(|&position| self.source.local_symbols.get(position))
    }

    fn reexport(&self, alias: &str) -> Option<&Reexport> {
        self.reexports
            .get(alias)
            .and_then(|&position| self.source.reexports.get(position))
    }
}

/// Read-only view of every module's declared symbols and directives.
#[derive(Debug, Default)]
pub struct ModuleSnapshot {
    modules: BTreeMap<ModulePath, SnapshotModule>,
}

impl ModuleSnapshot {
    /// Build the snapshot. Two inputs claiming one module path is fatal.
    pub fn build(sources: Vec<ModuleSource>) -> Result<Self, IndexError> {
        let mut modules = BTreeMap::new();
        for source in sources {
            match modules.entry(source.module_path.clone()) {
                Entry::Occupied(existing) => {
                    let existing: &SnapshotModule = existing.get();
                    return Err(IndexError::ModulePathCollision {
                        module: source.module_path.clone(),
                        first: existing.source.origin_label(),
                        second: source.origin_label(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(SnapshotModule::new(source));
                }
            }
        }
        Ok(Self { modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, path: &ModulePath) -> bool {
        self.modules.contains_key(path)
    }

    /// Module paths in sorted order.
    pub fn module_paths(&self) -> impl Iterator<Item = &ModulePath> {
        self.modules.keys()
    }

    pub fn source(&self, path: &ModulePath) -> Option<&ModuleSource> {
        self.modules.get(path).map(|module| &module.source)
    }

    /// Direct child modules of `path`, sorted.
    pub fn children(&self, path: &ModulePath) -> Vec<ModulePath> {
        // Descendants sort right after their ancestor.
        self.modules
            .range((Bound::Excluded(path), Bound::Unbounded))
            .map(|(candidate, _)| candidate)
            .take_while(|candidate| candidate.starts_with(path))
            .filter(|candidate| candidate.is_child_of(path))
            .cloned()
            .collect()
    }
}

/// Result of aggregating one module.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub index: ModuleIndex,
    pub warnings: Vec<ResolveError>,
    /// Other modules consulted while resolving re-exports
    pub dependencies: BTreeSet<ModulePath>,
}

/// Builds module indexes from a snapshot.
pub struct Aggregator<'a> {
    snapshot: &'a ModuleSnapshot,
    config: AggregatorConfig,
}

impl<'a> Aggregator<'a> {
    pub fn new(snapshot: &'a ModuleSnapshot, config: AggregatorConfig) -> Self {
        Self { snapshot, config }
    }

    /// Resolve `alias -> target` declared in `from` to its originating record.
    ///
    /// Every module looked up along the chain is added to `dependencies`,
    /// including modules that turn out not to exist.
    pub fn resolve(
        &self,
        from: &ModulePath,
        alias: &str,
        target: &str,
        dependencies: &mut BTreeSet<ModulePath>,
    ) -> Result<SymbolRecord, ResolveError> {
        let dangling = |target: String| ResolveError::DanglingReexport {
            module: from.clone(),
            alias: alias.to_string(),
            target,
        };

        let start = QualifiedName::new(from.clone(), alias);
        let mut current =
            QualifiedName::parse_relative(target, from).map_err(|_| dangling(target.to_string()))?;
        let mut visited: HashSet<QualifiedName> = HashSet::from([start.clone()]);
        let mut chain = vec![start, current.clone()];

        for _ in 0..self.config.max_reexport_depth {
            dependencies.insert(current.module.clone());

            let module = self
                .snapshot
                .modules
                .get(&current.module)
                .ok_or_else(|| dangling(current.to_string()))?;

            // An original definition shadows a re-export of the same name,
            // so reaching one ends the chain even when it was seen before.
            if let Some(local) = module.local(&current.id) {
                return Ok(local.to_record(&current.module));
            }

            if !visited.insert(current.clone()) {
                return Err(ResolveError::CyclicReexport {
                    module: from.clone(),
                    alias: alias.to_string(),
                    chain,
                });
            }

            let next = module
                .reexport(&current.id)
                .ok_or_else(|| dangling(current.to_string()))?;
            current = QualifiedName::parse_relative(&next.target, &current.module)
                .map_err(|_| dangling(next.target.clone()))?;
            chain.push(current.clone());
        }

        Err(ResolveError::CyclicReexport {
            module: from.clone(),
            alias: alias.to_string(),
            chain,
        })
    }

    /// Aggregate one module. Returns `None` for a module not in the snapshot.
    pub fn aggregate(&self, path: &ModulePath) -> Option<AggregateOutcome> {
        let module = self.snapshot.modules.get(path)?;
        let mut merger = RecordMerger::default();

        for local in &module.source.local_symbols {
            let record = local.to_record(path);
            if record.visibility.is_within(self.config.visibility) {
                merger.offer(record);
            }
        }

        let mut warnings = Vec::new();
        let mut dependencies = BTreeSet::new();
        let mut aliases = Vec::new();
        for reexport in &module.source.reexports {
            match self.resolve(path, &reexport.alias, &reexport.target, &mut dependencies) {
                Ok(origin) => aliases.push(alias_record(path, reexport, origin)),
                Err(err) => {
                    warn!("{}", err);
                    warnings.push(err);
                }
            }
        }

        if warnings.iter().any(ResolveError::is_cyclic) {
            debug!("Module {} falls back to local symbols only", path);
        } else {
            for record in aliases {
                if record.visibility.is_within(self.config.visibility) {
                    merger.offer(record);
                }
            }
        }

        dependencies.remove(path);
        let index = ModuleIndex::new(
            path.clone(),
            merger.into_records(),
            self.snapshot.children(path),
        );
        debug!(
            "Aggregated {}: {} symbols, {} dependencies",
            path,
            index.symbol_count(),
            dependencies.len()
        );

        Some(AggregateOutcome {
            index,
            warnings,
            dependencies,
        })
    }
}

/// Record listed under `module` for a resolved re-export.
fn alias_record(module: &ModulePath, reexport: &Reexport, origin: SymbolRecord) -> SymbolRecord {
    let display_name = if reexport.alias == origin.id {
        origin.display_name.clone()
    } else {
        reexport.alias.clone()
    };
    SymbolRecord {
        id: reexport.alias.clone(),
        kind: origin.kind,
        display_name,
        short_doc: origin.short_doc.clone(),
        owning_module_path: module.clone(),
        visibility: reexport.visibility,
        source_location: origin.source_location.clone(),
        reexport_of: Some(origin.qualified_name()),
    }
}

/// Deduplicates records by id while keeping first-seen positions.
#[derive(Debug, Default)]
struct RecordMerger {
    records: Vec<SymbolRecord>,
    positions: HashMap<String, usize>,
}

impl RecordMerger {
    fn offer(&mut self, candidate: SymbolRecord) {
        match self.positions.get(&candidate.id) {
            Some(&position) => {
                if prefers(&candidate, &self.records[position]) {
                    self.records[position] = candidate;
                }
            }
            None => {
                self.positions
                    .insert(candidate.id.clone(), self.records.len());
                self.records.push(candidate);
            }
        }
    }

    fn into_records(self) -> Vec<SymbolRecord> {
        self.records
    }
}

/// Whether `candidate` should replace `existing` for the same id.
///
/// A documented record beats an undocumented one; otherwise an original
/// definition beats a re-export; otherwise the first one seen stays.
fn prefers(candidate: &SymbolRecord, existing: &SymbolRecord) -> bool {
    match (candidate.has_doc(), existing.has_doc()) {
        (true, false) => true,
        (false, true) => false,
        _ => existing.is_reexport() && !candidate.is_reexport(),
    }
}
