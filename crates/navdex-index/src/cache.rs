//! Persisted incremental build cache.
//!
//! One entry file per module under `<cache_dir>/modules/`. An entry records
//! the module's fingerprint, the fingerprints of every module its re-exports
//! were resolved through, and the built [`ModuleIndex`]. A module whose
//! fingerprint and dependency fingerprints are unchanged is skipped and its
//! cached index is reused.
//!
//! Each entry also keeps the last input that built successfully, so a module
//! whose input later becomes unreadable can still be served from it.
//!
//! Otherwise the cache is an optimization only: an entry that cannot be read,
//! parsed, or has a different schema is treated as absent.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::emit::write_atomic;
use crate::fingerprint::compute_hash;
use crate::group::ModuleIndex;
use crate::retry::{retry_blocking, RetryPolicy};
use crate::source::ModuleSource;
use crate::symbol::ModulePath;

/// Version of the entry format. Entries with another version are misses.
pub const CACHE_SCHEMA_VERSION: u32 = 2;

/// Default cache directory, relative to the output directory.
pub const DEFAULT_CACHE_DIR: &str = ".navdex-cache";

/// Subdirectory holding per-module entries.
pub const MODULES_DIR: &str = "modules";

/// Fingerprint of a dependency at the time an entry was built.
/// `None` records that the module did not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStamp {
    pub module: ModulePath,
    pub fingerprint: Option<String>,
}

/// Cached build result of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Version of the entry format
    pub schema: u32,

    pub module_path: ModulePath,

    /// Fingerprint of the module's own input
    pub fingerprint: String,

    /// Input the entry was built from
    pub source: ModuleSource,

    /// File the input was read from, if any
    #[serde(default)]
    pub origin: Option<String>,

    /// Modules consulted while resolving re-exports
    pub dependencies: Vec<DependencyStamp>,

    pub index: ModuleIndex,

    /// Resolution warnings raised when the entry was built
    #[serde(default)]
    pub warnings: Vec<String>,

    /// When the module was built
    pub built_at: SystemTime,
}

impl CacheEntry {
    pub fn new(
        source: &ModuleSource,
        fingerprint: String,
        dependencies: Vec<DependencyStamp>,
        index: ModuleIndex,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            schema: CACHE_SCHEMA_VERSION,
            module_path: source.module_path.clone(),
            fingerprint,
            source: source.clone(),
            origin: source.origin.clone(),
            dependencies,
            index,
            warnings,
            built_at: SystemTime::now(),
        }
    }
}

/// Why a module has to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    NotCached,
    FingerprintChanged,
    DependencyChanged(ModulePath),
    ArtifactMissing,
    Forced,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::NotCached => write!(f, "not cached"),
            RebuildReason::FingerprintChanged => write!(f, "input changed"),
            RebuildReason::DependencyChanged(module) => write!(f, "dependency {} changed", module),
            RebuildReason::ArtifactMissing => write!(f, "artifact missing"),
            RebuildReason::Forced => write!(f, "forced"),
        }
    }
}

/// Entries loaded at the start of a build.
#[derive(Debug, Default)]
pub struct ModuleCache {
    entries: BTreeMap<ModulePath, CacheEntry>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, module: &ModulePath) -> Option<&CacheEntry> {
        self.entries.get(module)
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.module_path.clone(), entry);
    }

    /// Cached module paths, sorted.
    pub fn modules(&self) -> impl Iterator<Item = &ModulePath> {
        self.entries.keys()
    }

    /// Entry last built from the input file `origin`.
    pub fn find_by_origin(&self, origin: &str) -> Option<&CacheEntry> {
        self.entries
            .values()
            .find(|entry| entry.origin.as_deref() == Some(origin))
    }

    /// Input `module` was last built from, restored for a failed read.
    pub fn last_good_source(&self, module: &ModulePath) -> Option<ModuleSource> {
        let entry = self.entries.get(module)?;
        let mut source = entry.source.clone();
        source.origin = entry.origin.clone();
        Some(source)
    }

    /// Check whether `module` can be skipped.
    ///
    /// `current` maps every discovered module to its fingerprint; a module
    /// missing from it counts as a dependency that no longer exists.
    pub fn check(
        &self,
        module: &ModulePath,
        fingerprint: &str,
        current: &BTreeMap<ModulePath, String>,
    ) -> Result<&CacheEntry, RebuildReason> {
        let entry = self.entries.get(module).ok_or(RebuildReason::NotCached)?;
        if entry.fingerprint != fingerprint {
            return Err(RebuildReason::FingerprintChanged);
        }
        for dependency in &entry.dependencies {
            if current.get(&dependency.module) != dependency.fingerprint.as_ref() {
                return Err(RebuildReason::DependencyChanged(dependency.module.clone()));
            }
        }
        Ok(entry)
    }
}

/// Directory holding cache entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    retry: RetryPolicy,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for reading entries.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn modules_dir(&self) -> PathBuf {
        self.dir.join(MODULES_DIR)
    }

    /// Entry file of `module`.
    pub fn entry_path(&self, module: &ModulePath) -> PathBuf {
        let digest = compute_hash(module.to_string().as_bytes());
        self.modules_dir().join(format!("{}.json", &digest[..32]))
    }

    /// Load every readable entry. Unusable entries are deleted.
    pub fn load(&self) -> ModuleCache {
        let mut cache = ModuleCache::new();
        let files = match fs::read_dir(self.modules_dir()) {
            Ok(files) => files,
            Err(e) => {
                debug!("No cache entries under {:?}: {}", self.dir, e);
                return cache;
            }
        };

        for file in files.filter_map(|entry| entry.ok()).map(|entry| entry.path()) {
            if file.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_entry(&file) {
                Ok(entry) if file == self.entry_path(&entry.module_path) => cache.insert(entry),
                Ok(entry) => {
                    debug!("Ignoring misplaced cache entry {:?} for {}", file, entry.module_path);
                    let _ = fs::remove_file(&file);
                }
                Err(CacheError::Io(e)) => {
                    // Unreadable is not corrupt; keep it for the next run.
                    debug!("Skipping unreadable cache entry {:?}: {}", file, e);
                }
                Err(e) => {
                    debug!("Discarding cache entry {:?}: {}", file, e);
                    let _ = fs::remove_file(&file);
                }
            }
        }

        debug!("Loaded {} cache entries from {:?}", cache.len(), self.dir);
        cache
    }

    fn read_entry(&self, path: &Path) -> Result<CacheEntry, CacheError> {
        self.read_entry_with(path, |path| fs::read_to_string(path))
    }

    fn read_entry_with<F>(&self, path: &Path, mut read: F) -> Result<CacheEntry, CacheError>
    where
        F: FnMut(&Path) -> std::io::Result<String>,
    {
        let content = retry_blocking(&self.retry, &format!("Reading cache entry {:?}", path), || read(path))
            .map_err(|(e, _)| CacheError::Io(e))?;
        let entry: CacheEntry = serde_json::from_str(&content).map_err(CacheError::Parse)?;
        if entry.schema != CACHE_SCHEMA_VERSION {
            return Err(CacheError::SchemaMismatch {
                found: entry.schema,
                expected: CACHE_SCHEMA_VERSION,
            });
        }
        Ok(entry)
    }

    /// Persist an entry, replacing any previous one for the same module.
    pub fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let content = serde_json::to_vec(entry).map_err(CacheError::Serialize)?;
        write_atomic(&self.entry_path(&entry.module_path), &content).map_err(CacheError::Io)
    }

    /// Delete the entry of `module`, if any.
    pub fn remove(&self, module: &ModulePath) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(module)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Delete every entry.
    pub fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(self.modules_dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}

/// Errors that can occur when reading or writing cache entries.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse cache entry: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize cache entry: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Cache schema {found} does not match {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalSymbol;
    use crate::symbol::{SymbolKind, SymbolRecord};
    use tempfile::tempdir;

    fn path(p: &str) -> ModulePath {
        ModulePath::parse(p).unwrap()
    }

    fn entry(module: &str, fingerprint: &str, dependencies: Vec<DependencyStamp>) -> CacheEntry {
        let module = path(module);
        let mut source = ModuleSource::new(module.clone())
            .with_symbol(LocalSymbol::new("Foo", SymbolKind::Struct));
        source.origin = Some(format!("inputs/{}.symbols.json", module));
        let index = ModuleIndex::new(
            module.clone(),
            vec![SymbolRecord::new("Foo", SymbolKind::Struct, module)],
            Vec::new(),
        );
        CacheEntry::new(&source, fingerprint.to_string(), dependencies, index, Vec::new())
    }

    fn stamp(module: &str, fingerprint: Option<&str>) -> DependencyStamp {
        DependencyStamp {
            module: path(module),
            fingerprint: fingerprint.map(str::to_string),
        }
    }

    #[test]
    fn test_check_reasons() {
        let mut cache = ModuleCache::new();
        cache.insert(entry(
            "util",
            "f-util",
            vec![stamp("core", Some("f-core")), stamp("gone", None)],
        ));

        let mut current = BTreeMap::new();
        current.insert(path("util"), "f-util".to_string());
        current.insert(path("core"), "f-core".to_string());

        assert!(cache.check(&path("util"), "f-util", &current).is_ok());
        assert_eq!(
            cache.check(&path("other"), "x", &current).unwrap_err(),
            RebuildReason::NotCached
        );
        assert_eq!(
            cache.check(&path("util"), "f-util-2", &current).unwrap_err(),
            RebuildReason::FingerprintChanged
        );

        current.insert(path("core"), "f-core-2".to_string());
        assert_eq!(
            cache.check(&path("util"), "f-util", &current).unwrap_err(),
            RebuildReason::DependencyChanged(path("core"))
        );

        current.insert(path("core"), "f-core".to_string());
        current.insert(path("gone"), "appeared".to_string());
        assert_eq!(
            cache.check(&path("util"), "f-util", &current).unwrap_err(),
            RebuildReason::DependencyChanged(path("gone"))
        );
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());

        store.store(&entry("core", "a", Vec::new())).unwrap();
        store.store(&entry("core::util", "b", vec![stamp("core", Some("a"))])).unwrap();

        let cache = store.load();
        assert_eq!(cache.len(), 2);
        let util = cache.get(&path("core::util")).unwrap();
        assert_eq!(util.fingerprint, "b");
        assert_eq!(util.dependencies, vec![stamp("core", Some("a"))]);
        assert_eq!(util.index.symbol_count(), 1);

        store.remove(&path("core")).unwrap();
        store.remove(&path("core")).unwrap();
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn test_corrupt_entries_are_misses() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.store(&entry("core", "a", Vec::new())).unwrap();

        let modules = dir.path().join(MODULES_DIR);
        fs::write(modules.join("garbage.json"), "{ truncated").unwrap();

        let mut old = entry("old", "x", Vec::new());
        old.schema = CACHE_SCHEMA_VERSION + 1;
        fs::write(store.entry_path(&path("old")), serde_json::to_vec(&old).unwrap()).unwrap();

        let cache = store.load();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&path("core")).is_some());
        assert!(!modules.join("garbage.json").exists());
        assert!(!store.entry_path(&path("old")).exists());
    }

    #[test]
    fn test_last_good_source_survives_reload() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.store(&entry("core", "a", Vec::new())).unwrap();

        let cache = store.load();
        let found = cache.find_by_origin("inputs/core.symbols.json").unwrap();
        assert_eq!(found.module_path, path("core"));
        assert!(cache.find_by_origin("inputs/other.symbols.json").is_none());

        let source = cache.last_good_source(&path("core")).unwrap();
        assert_eq!(source.local_symbols[0].id, "Foo");
        assert_eq!(source.origin.as_deref(), Some("inputs/core.symbols.json"));
    }

    #[test]
    fn test_entry_read_is_retried() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path()).with_retry(RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        });
        store.store(&entry("core", "a", Vec::new())).unwrap();

        let mut reads = 0;
        let loaded = store
            .read_entry_with(&store.entry_path(&path("core")), |path| {
                reads += 1;
                if reads == 1 {
                    Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "busy"))
                } else {
                    fs::read_to_string(path)
                }
            })
            .unwrap();

        assert_eq!(reads, 2);
        assert_eq!(loaded.fingerprint, "a");
    }

    #[test]
    fn test_missing_dir_is_empty_cache() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("nothing-here"));
        assert!(store.load().is_empty());
        store.clear().unwrap();
    }
}
