//! Navigation and search indexing for generated documentation.
//!
//! This crate provides:
//! - Symbol records and module paths for already-extracted documentation metadata
//! - Re-export resolution with cycle and dangling-target detection
//! - Deterministic grouping of symbols by kind
//! - Sidebar artifacts per module and a global search index
//! - An incremental cache keyed by content fingerprints
//! - A parallel, cancellable build orchestrator
//! - Input watching for automatic rebuilds

pub mod aggregate;
pub mod cache;
pub mod emit;
pub mod fingerprint;
pub mod group;
pub mod indexer;
pub mod retry;
pub mod search;
pub mod source;
pub mod symbol;
pub mod watcher;

// Re-exports
pub use aggregate::{AggregateOutcome, Aggregator, AggregatorConfig, ModuleSnapshot, ResolveError};
pub use cache::{CacheEntry, CacheStore, ModuleCache, RebuildReason};
pub use emit::{ArtifactFormat, ArtifactStore, EmitError, Emitter, FsArtifactStore, SidebarArtifact};
pub use group::{group_by_kind, ModuleIndex};
pub use indexer::{BuildFailure, BuildReport, BuildWarning, Indexer, IndexerConfig, ModuleState};
pub use retry::RetryPolicy;
pub use search::{GlobalSearchIndex, SearchEntry, SearchHit};
pub use source::{IndexError, InMemoryProvider, JsonDirProvider, LocalSymbol, ModuleProvider, ModuleSource, Reexport};
pub use symbol::{ModulePath, QualifiedName, SymbolKind, SymbolRecord, Visibility};
pub use watcher::{InputWatcher, WatchService, WatcherConfig, WatcherError};
