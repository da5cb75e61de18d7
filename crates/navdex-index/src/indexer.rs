//! Main build orchestrator.
//!
//! The Indexer runs one build: discovery, snapshot, cache planning, parallel
//! per-module aggregation and emission, then the global search index.
//! Workers share only the read-only snapshot and the store handles; each
//! returns its [`ModuleOutcome`] and the orchestrator folds them in module
//! path order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregator, AggregatorConfig, ModuleSnapshot, DEFAULT_MAX_REEXPORT_DEPTH};
use crate::cache::{CacheEntry, CacheStore, DependencyStamp, ModuleCache, RebuildReason, DEFAULT_CACHE_DIR};
use crate::emit::{ArtifactFormat, ArtifactStore, Emitter, FsArtifactStore, SEARCH_INDEX_FILE};
use crate::fingerprint::module_fingerprint;
use crate::group::ModuleIndex;
use crate::retry::RetryPolicy;
use crate::search::GlobalSearchIndex;
use crate::source::{InputFailure, ModuleProvider, ModuleSource};
use crate::symbol::{ModulePath, Visibility};

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Directory receiving the artifacts
    pub output_dir: PathBuf,
    /// Whether the incremental cache is read and written
    pub cache_enabled: bool,
    /// Cache directory; defaults to `<output_dir>/.navdex-cache`
    pub cache_dir: Option<PathBuf>,
    /// Per-module artifact formats
    pub formats: Vec<ArtifactFormat>,
    /// Longest re-export chain followed
    pub max_reexport_depth: usize,
    /// Include crate-internal and private symbols
    pub document_private_items: bool,
    /// Maximum modules built concurrently
    pub jobs: usize,
    /// Rebuild every module regardless of the cache
    pub force: bool,
    /// Retry policy for input reads, cache reads and artifact writes
    pub retry: RetryPolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("target/navdex"),
            cache_enabled: true,
            cache_dir: None,
            formats: vec![ArtifactFormat::Json],
            max_reexport_depth: DEFAULT_MAX_REEXPORT_DEPTH,
            document_private_items: false,
            jobs: default_jobs(),
            force: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Available parallelism, or 4 when it cannot be determined.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl IndexerConfig {
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            max_reexport_depth: self.max_reexport_depth,
            visibility: if self.document_private_items {
                Visibility::Private
            } else {
                Visibility::Public
            },
        }
    }

    /// Cache directory in use, or `None` when caching is disabled.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        if !self.cache_enabled {
            return None;
        }
        Some(
            self.cache_dir
                .clone()
                .unwrap_or_else(|| self.output_dir.join(DEFAULT_CACHE_DIR)),
        )
    }
}

/// Lifecycle of one module within a build.
///
/// Every module starts `Unchanged` and ends in `Skipped`, `Cached`,
/// `Rebuilt` (emitted but not cached), `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unchanged,
    Skipped,
    Rebuilt,
    Cached,
    Failed,
    Cancelled,
}

impl ModuleState {
    /// Whether `self -> next` is a valid transition.
    pub fn can_become(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Unchanged, Skipped)
                | (Unchanged, Rebuilt)
                | (Unchanged, Failed)
                | (Unchanged, Cancelled)
                | (Rebuilt, Cached)
                | (Rebuilt, Failed)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Unchanged => "unchanged",
            ModuleState::Skipped => "skipped",
            ModuleState::Rebuilt => "rebuilt",
            ModuleState::Cached => "cached",
            ModuleState::Failed => "failed",
            ModuleState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of processing one module.
#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub module: ModulePath,
    pub state: ModuleState,
    /// Why the module was rebuilt, if it was
    pub reason: Option<RebuildReason>,
    /// Index feeding the global search index
    pub index: Option<ModuleIndex>,
    pub warnings: Vec<String>,
    pub failure: Option<String>,
}

impl ModuleOutcome {
    fn new(module: ModulePath, reason: Option<RebuildReason>) -> Self {
        Self {
            module,
            state: ModuleState::Unchanged,
            reason,
            index: None,
            warnings: Vec::new(),
            failure: None,
        }
    }

    fn skipped(entry: &CacheEntry) -> Self {
        let mut outcome = Self::new(entry.module_path.clone(), None);
        outcome.index = Some(entry.index.clone());
        outcome.warnings = entry.warnings.clone();
        outcome.advance(ModuleState::Skipped);
        outcome
    }

    fn cancelled(module: ModulePath, reason: RebuildReason) -> Self {
        let mut outcome = Self::new(module, Some(reason));
        outcome.advance(ModuleState::Cancelled);
        outcome
    }

    fn failed(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self.advance(ModuleState::Failed);
        self
    }

    fn advance(&mut self, next: ModuleState) {
        if self.state.can_become(next) {
            self.state = next;
        } else {
            debug!(
                "Ignoring transition {} -> {} for {}",
                self.state, next, self.module
            );
        }
    }
}

/// A module or input that could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    /// Module path, input file, or artifact name
    pub subject: String,
    pub reason: String,
}

/// A non-fatal problem reported in the summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildWarning {
    pub module: ModulePath,
    pub message: String,
}

/// Summary of one build.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub modules_discovered: usize,
    pub rebuilt: Vec<ModulePath>,
    pub skipped: Vec<ModulePath>,
    pub removed: Vec<ModulePath>,
    pub cancelled: Vec<ModulePath>,
    pub failures: Vec<BuildFailure>,
    pub warnings: Vec<BuildWarning>,
    pub search_entries: usize,
    pub search_index_written: bool,
    pub duration_ms: u64,
}

impl BuildReport {
    /// True when every module and input was built and nothing was cancelled.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cancelled.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Indexed {} modules in {}ms: {} rebuilt, {} skipped, {} removed",
            self.modules_discovered,
            self.duration_ms,
            self.rebuilt.len(),
            self.skipped.len(),
            self.removed.len()
        )?;
        if self.search_index_written {
            writeln!(f, "Search index: {} entries", self.search_entries)?;
        } else {
            writeln!(f, "Search index: not written")?;
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Warnings ({}):", self.warnings.len())?;
            for warning in &self.warnings {
                writeln!(f, "  {}: {}", warning.module, warning.message)?;
            }
        }
        if !self.failures.is_empty() {
            writeln!(f, "Failed ({}):", self.failures.len())?;
            for failure in &self.failures {
                writeln!(f, "  {}: {}", failure.subject, failure.reason)?;
            }
        }
        if !self.cancelled.is_empty() {
            writeln!(f, "Cancelled ({}):", self.cancelled.len())?;
            for module in &self.cancelled {
                writeln!(f, "  {}", module)?;
            }
        }
        Ok(())
    }
}

/// Shared, read-only state of the per-module workers.
struct ModuleBuilder {
    snapshot: Arc<ModuleSnapshot>,
    aggregator_config: AggregatorConfig,
    emitter: Emitter,
    cache: Option<CacheStore>,
    fingerprints: BTreeMap<ModulePath, String>,
}

impl ModuleBuilder {
    async fn build(&self, module: ModulePath, reason: RebuildReason) -> ModuleOutcome {
        debug!("Rebuilding {} ({})", module, reason);
        let mut outcome = ModuleOutcome::new(module.clone(), Some(reason));

        let aggregated = match Aggregator::new(&self.snapshot, self.aggregator_config).aggregate(&module) {
            Some(aggregated) => aggregated,
            None => return outcome.failed("module missing from snapshot"),
        };
        outcome.warnings = aggregated.warnings.iter().map(ToString::to_string).collect();

        if let Err(e) = self.emitter.emit_module(&aggregated.index).await {
            warn!("Failed to emit {}: {}", module, e);
            outcome.index = Some(aggregated.index);
            return outcome.failed(e.to_string());
        }
        outcome.advance(ModuleState::Rebuilt);

        if let (Some(store), Some(fingerprint), Some(source)) = (
            &self.cache,
            self.fingerprints.get(&module),
            self.snapshot.source(&module),
        ) {
            let dependencies = aggregated
                .dependencies
                .iter()
                .map(|dependency| DependencyStamp {
                    module: dependency.clone(),
                    fingerprint: self.fingerprints.get(dependency).cloned(),
                })
                .collect();
            let entry = CacheEntry::new(
                source,
                fingerprint.clone(),
                dependencies,
                aggregated.index.clone(),
                outcome.warnings.clone(),
            );
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.store(&entry)).await {
                Ok(Ok(())) => outcome.advance(ModuleState::Cached),
                Ok(Err(e)) => warn!("Failed to cache {}: {}", module, e),
                Err(e) => warn!("Cache task for {} failed: {}", module, e),
            }
        }

        outcome.index = Some(aggregated.index);
        outcome
    }
}

/// Orchestrates documentation index builds.
pub struct Indexer {
    config: IndexerConfig,
    provider: Arc<dyn ModuleProvider>,
    store: Arc<dyn ArtifactStore>,
}

impl Indexer {
    /// Create an indexer writing to `config.output_dir`.
    pub fn new(config: IndexerConfig, provider: Arc<dyn ModuleProvider>) -> Self {
        let store = Arc::new(FsArtifactStore::new(&config.output_dir));
        Self::with_store(config, provider, store)
    }

    /// Create an indexer with a custom artifact store.
    pub fn with_store(
        config: IndexerConfig,
        provider: Arc<dyn ModuleProvider>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            provider,
            store,
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn ModuleProvider> {
        &self.provider
    }

    /// Run a build to completion.
    pub async fn run(&self) -> Result<BuildReport> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Run a build that stops at module boundaries once `cancel` fires.
    ///
    /// Returns `Err` only for run-fatal problems (unreadable root, module
    /// path collisions). Per-module problems land in the report.
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> Result<BuildReport> {
        let start = Instant::now();
        info!("Building navigation index into {:?}", self.config.output_dir);

        let provider = Arc::clone(&self.provider);
        let discovery = tokio::task::spawn_blocking(move || provider.discover())
            .await
            .context("Discovery task failed")??;

        let cache_store = self
            .config
            .resolved_cache_dir()
            .map(|dir| CacheStore::new(dir).with_retry(self.config.retry.clone()));
        let cache = match &cache_store {
            Some(store) => {
                let store = store.clone();
                tokio::task::spawn_blocking(move || store.load())
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Failed to load cache, starting fresh: {}", e);
                        ModuleCache::new()
                    })
            }
            None => ModuleCache::new(),
        };

        let mut report = BuildReport::default();
        let mut modules = discovery.modules;
        for failure in discovery.failures {
            if let Some(module) = restore_failed_input(&failure, &cache, &mut modules) {
                warn!(
                    "Input {} for {} failed, keeping its last successful build",
                    failure.origin, module
                );
                report.warnings.push(BuildWarning {
                    module,
                    message: format!("input {} failed; kept last successful build", failure.origin),
                });
            }
            report.failures.push(BuildFailure {
                subject: failure.origin,
                reason: failure.reason,
            });
        }

        let snapshot = Arc::new(ModuleSnapshot::build(modules)?);
        report.modules_discovered = snapshot.len();
        info!("Discovered {} modules", snapshot.len());

        let aggregator_config = self.config.aggregator_config();
        let fingerprints = compute_fingerprints(&snapshot, &aggregator_config)?;

        let emitter = Emitter::new(
            Arc::clone(&self.store),
            self.config.formats.clone(),
            self.config.retry.clone(),
        );

        if let Some(store) = &cache_store {
            self.remove_stale(&snapshot, &cache, store, &emitter, &mut report)
                .await;
        }

        let mut outcomes = Vec::with_capacity(snapshot.len());
        let mut dirty = Vec::new();
        for module in snapshot.module_paths() {
            match self
                .plan(module, cache_store.is_some(), &cache, &fingerprints, &emitter)
                .await
            {
                Ok(entry) => {
                    debug!("Skipping unchanged module {}", module);
                    outcomes.push(ModuleOutcome::skipped(entry));
                }
                Err(reason) => dirty.push((module.clone(), reason)),
            }
        }
        info!(
            "{} modules to rebuild, {} unchanged",
            dirty.len(),
            outcomes.len()
        );

        let builder = Arc::new(ModuleBuilder {
            snapshot: Arc::clone(&snapshot),
            aggregator_config,
            emitter: emitter.clone(),
            cache: cache_store,
            fingerprints,
        });
        let semaphore = Arc::new(Semaphore::new(self.config.jobs.max(1)));

        let mut handles = Vec::with_capacity(dirty.len());
        for (module, reason) in dirty {
            let builder = Arc::clone(&builder);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let task_module = module.clone();
            let task_reason = reason.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ModuleOutcome::cancelled(task_module, task_reason),
                };
                if cancel.is_cancelled() {
                    return ModuleOutcome::cancelled(task_module, task_reason);
                }
                builder.build(task_module, task_reason).await
            });
            handles.push((module, reason, handle));
        }

        for (module, reason, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes
                    .push(ModuleOutcome::new(module, Some(reason)).failed(format!("build task failed: {}", e))),
            }
        }
        outcomes.sort_by(|a, b| a.module.cmp(&b.module));

        for outcome in &outcomes {
            if !matches!(
                outcome.state,
                ModuleState::Skipped | ModuleState::Rebuilt | ModuleState::Cached
            ) {
                continue;
            }
            match emitter.remove_unconfigured(&outcome.module).await {
                Ok(0) => {}
                Ok(n) => debug!("Removed {} artifact(s) of dropped formats for {}", n, outcome.module),
                Err(e) => warn!("Failed to remove dropped formats of {}: {}", outcome.module, e),
            }
        }

        let search_index = GlobalSearchIndex::from_modules(
            outcomes.iter().filter_map(|outcome| outcome.index.as_ref()),
        );
        report.search_entries = search_index.len();
        fold_outcomes(&mut report, outcomes);

        if cancel.is_cancelled() {
            info!("Build cancelled; search index not written");
        } else {
            match emitter.emit_search_index(&search_index).await {
                Ok(()) => report.search_index_written = true,
                Err(e) => {
                    warn!("Failed to write search index: {}", e);
                    report.failures.push(BuildFailure {
                        subject: SEARCH_INDEX_FILE.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Build finished in {}ms: {} rebuilt, {} skipped, {} failed",
            report.duration_ms,
            report.rebuilt.len(),
            report.skipped.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Decide whether `module` can reuse its cache entry.
    async fn plan<'c>(
        &self,
        module: &ModulePath,
        cache_enabled: bool,
        cache: &'c ModuleCache,
        fingerprints: &BTreeMap<ModulePath, String>,
        emitter: &Emitter,
    ) -> std::result::Result<&'c CacheEntry, RebuildReason> {
        if self.config.force || !cache_enabled {
            return Err(RebuildReason::Forced);
        }
        let fingerprint = fingerprints
            .get(module)
            .ok_or(RebuildReason::FingerprintChanged)?;
        let entry = cache.check(module, fingerprint, fingerprints)?;
        if !emitter.artifacts_present(module).await {
            return Err(RebuildReason::ArtifactMissing);
        }
        Ok(entry)
    }

    /// Delete artifacts and cache entries of modules no longer discovered.
    async fn remove_stale(
        &self,
        snapshot: &ModuleSnapshot,
        cache: &ModuleCache,
        store: &CacheStore,
        emitter: &Emitter,
        report: &mut BuildReport,
    ) {
        let stale: Vec<ModulePath> = cache
            .modules()
            .filter(|module| !snapshot.contains(module))
            .cloned()
            .collect();

        for module in stale {
            info!("Removing stale module {}", module);
            if let Err(e) = emitter.remove_module(&module).await {
                warn!("Failed to remove artifacts of {}: {}", module, e);
                report.failures.push(BuildFailure {
                    subject: module.to_string(),
                    reason: format!("failed to remove stale artifacts: {}", e),
                });
                continue;
            }

            let store = store.clone();
            let target = module.clone();
            match tokio::task::spawn_blocking(move || store.remove(&target)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to remove cache entry of {}: {}", module, e),
                Err(e) => warn!("Cache task for {} failed: {}", module, e),
            }
            report.removed.push(module);
        }
    }
}

/// Put the last good input of a module whose input failed back into
/// `modules`, so the module keeps its artifacts and its re-exporters still
/// resolve. Returns the restored module.
fn restore_failed_input(
    failure: &InputFailure,
    cache: &ModuleCache,
    modules: &mut Vec<ModuleSource>,
) -> Option<ModulePath> {
    let module = match &failure.module_path {
        Some(module) if cache.get(module).is_some() => module.clone(),
        _ => cache.find_by_origin(&failure.origin)?.module_path.clone(),
    };
    if modules.iter().any(|source| source.module_path == module) {
        return None;
    }
    let source = cache.last_good_source(&module)?;
    modules.push(source);
    Some(module)
}

fn compute_fingerprints(
    snapshot: &ModuleSnapshot,
    options: &AggregatorConfig,
) -> Result<BTreeMap<ModulePath, String>> {
    let mut fingerprints = BTreeMap::new();
    for module in snapshot.module_paths() {
        let Some(source) = snapshot.source(module) else {
            continue;
        };
        let fingerprint = module_fingerprint(source, &snapshot.children(module), options)
            .with_context(|| format!("Failed to fingerprint module {}", module))?;
        fingerprints.insert(module.clone(), fingerprint);
    }
    Ok(fingerprints)
}

fn fold_outcomes(report: &mut BuildReport, outcomes: Vec<ModuleOutcome>) {
    for outcome in outcomes {
        report
            .warnings
            .extend(outcome.warnings.into_iter().map(|message| BuildWarning {
                module: outcome.module.clone(),
                message,
            }));

        match outcome.state {
            ModuleState::Skipped => report.skipped.push(outcome.module),
            ModuleState::Rebuilt | ModuleState::Cached => report.rebuilt.push(outcome.module),
            ModuleState::Cancelled => report.cancelled.push(outcome.module),
            ModuleState::Failed | ModuleState::Unchanged => report.failures.push(BuildFailure {
                subject: outcome.module.to_string(),
                reason: outcome
                    .failure
                    .unwrap_or_else(|| "module was not processed".to_string()),
            }),
        }
    }
}
