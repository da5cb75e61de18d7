//! Index emission: sidebar artifacts per module and the global search index.
//!
//! Artifacts are written through an [`ArtifactStore`]. The filesystem store
//! writes to a temporary file in the destination directory and renames it
//! into place, so a reader never observes a half-written artifact.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::group::ModuleIndex;
use crate::retry::{retry, RetryPolicy};
use crate::search::GlobalSearchIndex;
use crate::symbol::{ModulePath, SymbolKind, SymbolRecord};

/// Per-module JSON artifact.
pub const SIDEBAR_JSON_FILE: &str = "sidebar-items.json";

/// Per-module script artifact for rustdoc-style viewers.
pub const SIDEBAR_JS_FILE: &str = "sidebar-items.js";

/// Global search artifact, at the output root.
pub const SEARCH_INDEX_FILE: &str = "search-index.json";

/// Emission errors. Reported per module; never abort the build.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("Failed to write {path:?} after {attempts} attempt(s): {source}")]
    Io {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize {artifact}: {source}")]
    SerializationEscapeFailure {
        artifact: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-module artifact formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Json,
    Js,
}

impl ArtifactFormat {
    pub const ALL: [ArtifactFormat; 2] = [ArtifactFormat::Json, ArtifactFormat::Js];

    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactFormat::Json => SIDEBAR_JSON_FILE,
            ArtifactFormat::Js => SIDEBAR_JS_FILE,
        }
    }

    /// Parse a format name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(ArtifactFormat::Json),
            "js" | "javascript" => Some(ArtifactFormat::Js),
            _ => None,
        }
    }

    /// Relative path of this artifact for `module`.
    pub fn artifact_path(&self, module: &ModulePath) -> PathBuf {
        module.to_relative_dir().join(self.file_name())
    }
}

/// One sidebar row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarEntry {
    pub id: String,
    pub display_name: String,
    pub short_doc: String,
}

impl From<&SymbolRecord> for SidebarEntry {
    fn from(record: &SymbolRecord) -> Self {
        Self {
            id: record.id.clone(),
            display_name: record.display_name.clone(),
            short_doc: record.short_doc.clone(),
        }
    }
}

/// Contents of `sidebar-items.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarArtifact {
    pub module_path: ModulePath,
    pub kinds: BTreeMap<SymbolKind, Vec<SidebarEntry>>,
    pub child_modules: Vec<ModulePath>,
}

impl From<&ModuleIndex> for SidebarArtifact {
    fn from(index: &ModuleIndex) -> Self {
        let kinds = index
            .symbols_by_kind
            .iter()
            .map(|(kind, records)| (*kind, records.iter().map(SidebarEntry::from).collect()))
            .collect();
        Self {
            module_path: index.module_path.clone(),
            kinds,
            child_modules: index.child_modules.clone(),
        }
    }
}

fn serialization_failure(artifact: impl Into<String>) -> impl FnOnce(serde_json::Error) -> EmitError {
    let artifact = artifact.into();
    move |source| EmitError::SerializationEscapeFailure { artifact, source }
}

/// Render `sidebar-items.json`.
pub fn render_sidebar_json(index: &ModuleIndex) -> Result<Vec<u8>, EmitError> {
    let mut bytes = serde_json::to_vec_pretty(&SidebarArtifact::from(index))
        .map_err(serialization_failure(format!("sidebar of {}", index.module_path)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Render `sidebar-items.js`: `initSidebarItems({"struct":[["Foo","doc"]],...});`.
///
/// Keys are short kind names in alphabetical order. The payload is a JSON
/// object literal that stays inert inside a `<script>` element.
pub fn render_sidebar_js(index: &ModuleIndex) -> Result<Vec<u8>, EmitError> {
    let mut items: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for (kind, records) in &index.symbols_by_kind {
        items.entry(kind.short_name()).or_default().extend(
            records
                .iter()
                .map(|record| (record.id.as_str(), record.short_doc.as_str())),
        );
    }
    let payload = serde_json::to_string(&items)
        .map_err(serialization_failure(format!("script sidebar of {}", index.module_path)))?;
    Ok(format!("initSidebarItems({});", escape_for_script(&payload)).into_bytes())
}

/// Render `search-index.json`.
pub fn render_search_index(index: &GlobalSearchIndex) -> Result<Vec<u8>, EmitError> {
    let mut bytes =
        serde_json::to_vec_pretty(index).map_err(serialization_failure(SEARCH_INDEX_FILE))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Escape sequences that would end or break a script block.
///
/// Input must already be valid JSON; the result is equivalent JSON.
pub fn escape_for_script(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '<' if chars.peek() == Some(&'/') => out.push_str("<\\"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Strip the `initSidebarItems(...);` wrapper.
pub fn sidebar_js_payload(script: &str) -> Option<&str> {
    script
        .trim()
        .strip_prefix("initSidebarItems(")?
        .strip_suffix(");")
}

/// Destination for artifacts, addressed by paths relative to the output root.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Replace the artifact at `path` with `contents`.
    async fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    async fn exists(&self, path: &Path) -> bool;

    /// Delete an artifact. Missing artifacts are not an error.
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Store backed by a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove empty directories from `dir` up to, not including, the root.
    fn prune_empty_dirs(root: &Path, mut dir: PathBuf) {
        while dir.starts_with(root) && dir != root {
            if fs::remove_dir(&dir).is_err() {
                break;
            }
            if !dir.pop() {
                break;
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let target = self.root.join(path);
        let contents = contents.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&target, &contents))
            .await
            .map_err(io::Error::other)?
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(self.root.join(path))
            .await
            .unwrap_or(false)
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        let root = self.root.clone();
        let target = root.join(path);
        tokio::task::spawn_blocking(move || {
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            if let Some(parent) = target.parent() {
                Self::prune_empty_dirs(&root, parent.to_path_buf());
            }
            Ok(())
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Write `contents` to `target` through a temporary sibling and a rename.
pub(crate) fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".navdex-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Renders and writes artifacts with retries.
#[derive(Clone)]
pub struct Emitter {
    store: Arc<dyn ArtifactStore>,
    formats: Vec<ArtifactFormat>,
    retry: RetryPolicy,
}

impl Emitter {
    pub fn new(store: Arc<dyn ArtifactStore>, formats: Vec<ArtifactFormat>, retry: RetryPolicy) -> Self {
        let mut formats = formats;
        formats.sort();
        formats.dedup();
        if formats.is_empty() {
            formats.push(ArtifactFormat::Json);
        }
        Self {
            store,
            formats,
            retry,
        }
    }

    pub fn formats(&self) -> &[ArtifactFormat] {
        &self.formats
    }

    /// Relative paths of every artifact emitted for `module`.
    pub fn artifact_paths(&self, module: &ModulePath) -> Vec<PathBuf> {
        self.formats
            .iter()
            .map(|format| format.artifact_path(module))
            .collect()
    }

    /// Whether every artifact of `module` exists.
    pub async fn artifacts_present(&self, module: &ModulePath) -> bool {
        for path in self.artifact_paths(module) {
            if !self.store.exists(&path).await {
                return false;
            }
        }
        true
    }

    /// Write every configured artifact of one module.
    pub async fn emit_module(&self, index: &ModuleIndex) -> Result<(), EmitError> {
        for format in &self.formats {
            let contents = match format {
                ArtifactFormat::Json => render_sidebar_json(index)?,
                ArtifactFormat::Js => render_sidebar_js(index)?,
            };
            self.write(&format.artifact_path(&index.module_path), &contents)
                .await?;
        }
        debug!("Emitted sidebar for {}", index.module_path);
        Ok(())
    }

    /// Write the global search artifact.
    pub async fn emit_search_index(&self, index: &GlobalSearchIndex) -> Result<(), EmitError> {
        let contents = render_search_index(index)?;
        self.write(Path::new(SEARCH_INDEX_FILE), &contents).await
    }

    /// Delete every artifact format of a module that is no longer discovered.
    pub async fn remove_module(&self, module: &ModulePath) -> io::Result<()> {
        for format in ArtifactFormat::ALL {
            self.store.remove(&format.artifact_path(module)).await?;
        }
        Ok(())
    }

    /// Delete artifacts of `module` in formats that are no longer configured.
    /// Returns how many were removed.
    pub async fn remove_unconfigured(&self, module: &ModulePath) -> io::Result<usize> {
        let mut removed = 0;
        for format in ArtifactFormat::ALL {
            if self.formats.contains(&format) {
                continue;
            }
            let path = format.artifact_path(module);
            if self.store.exists(&path).await {
                self.store.remove(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<(), EmitError> {
        let label = format!("Write of {}", path.display());
        retry(&self.retry, &label, || self.store.write(path, contents))
            .await
            .map_err(|(source, attempts)| EmitError::Io {
                path: path.to_path_buf(),
                attempts,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{ModulePath, SymbolRecord};
    use tempfile::tempdir;

    fn sample_index() -> ModuleIndex {
        let core = ModulePath::parse("core").unwrap();
        ModuleIndex::new(
            core.clone(),
            vec![
                SymbolRecord::new("Foo", SymbolKind::Struct, core.clone()).with_doc("A \"foo\"\n</script>"),
                SymbolRecord::new("parse", SymbolKind::Function, core.clone()).with_doc("line\u{2028}sep"),
                SymbolRecord::new("Color", SymbolKind::Enum, core.clone()),
            ],
            vec![core.child("util").unwrap()],
        )
    }

    #[test]
    fn test_sidebar_json_shape() {
        let bytes = render_sidebar_json(&sample_index()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["modulePath"], serde_json::json!(["core"]));
        assert_eq!(value["childModules"], serde_json::json!([["core", "util"]]));
        assert_eq!(value["kinds"]["Struct"][0]["id"], "Foo");
        assert_eq!(value["kinds"]["Enum"][0]["shortDoc"], "");

        let keys: Vec<&String> = value["kinds"].as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_sidebar_json_round_trips_special_characters() {
        let index = sample_index();
        let bytes = render_sidebar_json(&index).unwrap();
        let parsed: SidebarArtifact = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed, SidebarArtifact::from(&index));
        assert_eq!(parsed.kinds[&SymbolKind::Struct][0].short_doc, "A \"foo\"\n</script>");
    }

    #[test]
    fn test_sidebar_js_is_script_safe() {
        let script = String::from_utf8(render_sidebar_js(&sample_index()).unwrap()).unwrap();

        assert!(script.starts_with("initSidebarItems({\"enum\":"));
        assert!(script.ends_with("});"));
        assert!(!script.contains("</"));
        assert!(!script.contains('\u{2028}'));

        let payload = sidebar_js_payload(&script).unwrap();
        let parsed: BTreeMap<String, Vec<(String, String)>> = serde_json::from_str(payload).unwrap();
        assert_eq!(
            parsed["struct"],
            vec![("Foo".to_string(), "A \"foo\"\n</script>".to_string())]
        );
        assert_eq!(parsed["fn"][0].1, "line\u{2028}sep");
        let keys: Vec<&String> = parsed.keys().collect();
        assert_eq!(keys, vec!["enum", "fn", "struct"]);
    }

    #[test]
    fn test_escape_for_script() {
        assert_eq!(escape_for_script(r#""</a>""#), r#""<\/a>""#);
        assert_eq!(escape_for_script("\"a<b\""), "\"a<b\"");
        assert_eq!(escape_for_script("\"\u{2029}\""), "\"\\u2029\"");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ArtifactFormat::parse("JSON"), Some(ArtifactFormat::Json));
        assert_eq!(ArtifactFormat::parse("js"), Some(ArtifactFormat::Js));
        assert_eq!(ArtifactFormat::parse("html"), None);
        assert_eq!(
            ArtifactFormat::Js.artifact_path(&ModulePath::parse("a::b").unwrap()),
            PathBuf::from("a/b/sidebar-items.js")
        );
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/sidebar-items.json");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("a/b"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_emitter_writes_and_removes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::new(dir.path()));
        let emitter = Emitter::new(
            store,
            vec![ArtifactFormat::Js, ArtifactFormat::Json, ArtifactFormat::Js],
            RetryPolicy::none(),
        );
        assert_eq!(emitter.formats(), &[ArtifactFormat::Json, ArtifactFormat::Js]);

        let index = sample_index();
        emitter.emit_module(&index).await.unwrap();
        assert!(emitter.artifacts_present(&index.module_path).await);
        assert!(dir.path().join("core/sidebar-items.json").exists());
        assert!(dir.path().join("core/sidebar-items.js").exists());

        emitter.remove_module(&index.module_path).await.unwrap();
        assert!(!emitter.artifacts_present(&index.module_path).await);
        assert!(!dir.path().join("core").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_dropped_format_is_removed() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.path()));
        let index = sample_index();

        let both = Emitter::new(
            Arc::clone(&store),
            vec![ArtifactFormat::Json, ArtifactFormat::Js],
            RetryPolicy::none(),
        );
        both.emit_module(&index).await.unwrap();
        assert_eq!(both.remove_unconfigured(&index.module_path).await.unwrap(), 0);

        let json_only = Emitter::new(store, vec![ArtifactFormat::Json], RetryPolicy::none());
        assert_eq!(json_only.remove_unconfigured(&index.module_path).await.unwrap(), 1);
        assert!(!dir.path().join("core/sidebar-items.js").exists());
        assert!(dir.path().join("core/sidebar-items.json").exists());
        assert_eq!(json_only.remove_unconfigured(&index.module_path).await.unwrap(), 0);
    }
}
