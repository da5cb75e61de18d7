//! Module input and discovery.
//!
//! The extraction collaborator hands over one [`ModuleSource`] per module:
//! its locally declared symbols and its re-export directives. This module
//! defines that input and the [`ModuleProvider`] seam used to discover it,
//! with a provider that reads `*.symbols.json` files from a directory tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::retry::{retry_blocking, RetryPolicy};
use crate::symbol::{ModulePath, PathError, SymbolKind, SymbolRecord, Visibility};

/// Default suffix of module input files.
pub const DEFAULT_INPUT_SUFFIX: &str = ".symbols.json";

/// Errors that abort a whole run. Only the discovery pass raises these.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Cannot read input root {path:?}: {source}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Module {module} is declared by both {first} and {second}")]
    ModulePathCollision {
        module: ModulePath,
        first: String,
        second: String,
    },

    #[error("Invalid module path: {0}")]
    InvalidModulePath(#[from] PathError),
}

/// A symbol as declared in its own module, before aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSymbol {
    pub id: String,
    pub kind: SymbolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub short_doc: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
}

impl LocalSymbol {
    pub fn new(id: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: None,
            short_doc: String::new(),
            visibility: Visibility::Public,
            source_location: None,
        }
    }

    pub fn with_doc(mut self, short_doc: impl Into<String>) -> Self {
        self.short_doc = short_doc.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Attach this symbol to its owning module.
    pub fn to_record(&self, module: &ModulePath) -> SymbolRecord {
        SymbolRecord {
            id: self.id.clone(),
            kind: self.kind,
            display_name: self.display_name.clone().unwrap_or_else(|| self.id.clone()),
            short_doc: self.short_doc.clone(),
            owning_module_path: module.clone(),
            visibility: self.visibility,
            source_location: self.source_location.clone(),
            reexport_of: None,
        }
    }
}

/// A directive exposing `target` under `alias` in the declaring module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reexport {
    pub alias: String,
    /// Qualified target name, absolute (`a::b::Item`) or relative (`Item`, `self::x::Item`)
    pub target: String,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Reexport {
    pub fn new(alias: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            target: target.into(),
            visibility: Visibility::Public,
        }
    }
}

/// Everything the extractor reports for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSource {
    pub module_path: ModulePath,
    #[serde(default)]
    pub local_symbols: Vec<LocalSymbol>,
    #[serde(default)]
    pub reexports: Vec<Reexport>,
    /// Where this input came from (file path), for diagnostics only
    #[serde(skip)]
    pub origin: Option<String>,
}

impl ModuleSource {
    pub fn new(module_path: ModulePath) -> Self {
        Self {
            module_path,
            local_symbols: Vec::new(),
            reexports: Vec::new(),
            origin: None,
        }
    }

    pub fn with_symbol(mut self, symbol: LocalSymbol) -> Self {
        self.local_symbols.push(symbol);
        self
    }

    pub fn with_reexport(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.reexports.push(Reexport::new(alias, target));
        self
    }

    /// Label used in diagnostics.
    pub fn origin_label(&self) -> String {
        self.origin
            .clone()
            .unwrap_or_else(|| format!("<module {}>", self.module_path))
    }
}

/// An input that could not be read or parsed. Reported, not fatal.
#[derive(Debug, Clone)]
pub struct InputFailure {
    pub origin: String,
    /// Module the input declares, when enough of it could be parsed
    pub module_path: Option<ModulePath>,
    pub reason: String,
}

/// Result of the discovery pass.
#[derive(Debug, Default)]
pub struct Discovery {
    pub modules: Vec<ModuleSource>,
    pub failures: Vec<InputFailure>,
}

/// Source of module inputs.
pub trait ModuleProvider: Send + Sync {
    /// Discover every module of the build.
    ///
    /// Returns an error only when the whole run must stop.
    fn discover(&self) -> Result<Discovery, IndexError>;

    /// Root to watch for changes, if the provider is backed by a directory.
    fn watch_root(&self) -> Option<&Path> {
        None
    }
}

/// Provider over an already materialized set of modules.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    modules: Vec<ModuleSource>,
}

impl InMemoryProvider {
    pub fn new(modules: Vec<ModuleSource>) -> Self {
        Self { modules }
    }
}

impl ModuleProvider for InMemoryProvider {
    fn discover(&self) -> Result<Discovery, IndexError> {
        Ok(Discovery {
            modules: self.modules.clone(),
            failures: Vec::new(),
        })
    }
}

/// Provider that reads one JSON input file per module from a directory tree.
#[derive(Debug, Clone)]
pub struct JsonDirProvider {
    root: PathBuf,
    suffix: String,
    respect_gitignore: bool,
    retry: RetryPolicy,
}

impl JsonDirProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            suffix: DEFAULT_INPUT_SUFFIX.to_string(),
            respect_gitignore: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_gitignore(mut self, respect_gitignore: bool) -> Self {
        self.respect_gitignore = respect_gitignore;
        self
    }

    /// Retry policy for reading input files.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether `path` looks like a module input file.
    pub fn is_input_file(path: &Path, suffix: &str) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|name| name.len() > suffix.len() && name.ends_with(suffix))
            .unwrap_or(false)
    }

    /// Collect input files in a stable order.
    fn collect_files(&self) -> Result<Vec<PathBuf>, IndexError> {
        // Surface permission problems on the root itself as fatal.
        fs::read_dir(&self.root).map_err(|source| IndexError::UnreadableRoot {
            path: self.root.clone(),
            source,
        })?;

        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .require_git(false)
            .build();

        let mut files: Vec<PathBuf> = walker
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.is_file() && Self::is_input_file(path, &self.suffix))
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_module(&self, path: &Path) -> Result<ModuleSource, InputFailure> {
        self.read_module_with(path, |path| fs::read_to_string(path))
    }

    fn read_module_with<F>(&self, path: &Path, mut read: F) -> Result<ModuleSource, InputFailure>
    where
        F: FnMut(&Path) -> io::Result<String>,
    {
        let origin = path.display().to_string();
        let content = retry_blocking(&self.retry, &format!("Reading {}", origin), || read(path))
            .map_err(|(e, attempts)| InputFailure {
                origin: origin.clone(),
                module_path: None,
                reason: format!("cannot read file after {} attempt(s): {}", attempts, e),
            })?;

        let mut module: ModuleSource = serde_json::from_str(&content).map_err(|e| InputFailure {
            origin: origin.clone(),
            module_path: declared_module_path(&content),
            reason: format!("malformed input: {}", e),
        })?;
        module.origin = Some(origin);
        Ok(module)
    }
}

/// The `modulePath` of an input that otherwise fails to parse.
fn declared_module_path(content: &str) -> Option<ModulePath> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    serde_json::from_value(value.get("modulePath")?.clone()).ok()
}

impl ModuleProvider for JsonDirProvider {
    fn discover(&self) -> Result<Discovery, IndexError> {
        let files = self.collect_files()?;
        info!("Found {} module inputs under {:?}", files.len(), self.root);

        let mut discovery = Discovery::default();
        for file in files {
            match self.read_module(&file) {
                Ok(module) => {
                    debug!("Discovered module {} from {:?}", module.module_path, file);
                    discovery.modules.push(module);
                }
                Err(failure) => {
                    debug!("Skipping input {:?}: {}", file, failure.reason);
                    discovery.failures.push(failure);
                }
            }
        }
        Ok(discovery)
    }

    fn watch_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
