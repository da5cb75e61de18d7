//! Symbol record model.
//!
//! This module defines the canonical in-memory representation of one
//! documented item and the path types used to address items across modules.
//!
//! # Example
//!
//! ```
//! use navdex_index::symbol::{ModulePath, QualifiedName, SymbolKind, SymbolRecord};
//!
//! let core = ModulePath::parse("core").unwrap();
//! let record = SymbolRecord::new("Foo", SymbolKind::Struct, core.clone())
//!     .with_doc("A foo.");
//!
//! assert_eq!(record.qualified_name(), QualifiedName::new(core, "Foo"));
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::emit::{SEARCH_INDEX_FILE, SIDEBAR_JSON_FILE, SIDEBAR_JS_FILE};

/// Separator between module path segments and item names.
pub const PATH_SEPARATOR: &str = "::";

/// Kind of documented symbol.
///
/// Known kinds are closed variants. Any other tag is mapped to `Other` so
/// that grouping never has to reject a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymbolKind {
    Struct,
    Enum,
    Trait,
    Module,
    Function,
    Constant,
    TypeAlias,
    Other,
}

impl SymbolKind {
    /// Every kind, in artifact order.
    pub const ALL: [SymbolKind; 8] = [
        SymbolKind::Struct,
        SymbolKind::Enum,
        SymbolKind::Trait,
        SymbolKind::Module,
        SymbolKind::Function,
        SymbolKind::Constant,
        SymbolKind::TypeAlias,
        SymbolKind::Other,
    ];

    /// Canonical name, used as the key in sidebar artifacts.
    pub fn name(&self) -> &'static str {
        match self {
            SymbolKind::Struct => "Struct",
            SymbolKind::Enum => "Enum",
            SymbolKind::Trait => "Trait",
            SymbolKind::Module => "Module",
            SymbolKind::Function => "Function",
            SymbolKind::Constant => "Constant",
            SymbolKind::TypeAlias => "TypeAlias",
            SymbolKind::Other => "Other",
        }
    }

    /// Short rustdoc-style name used by `sidebar-items.js`.
    pub fn short_name(&self) -> &'static str {
        match self {
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Trait => "trait",
            SymbolKind::Module => "mod",
            SymbolKind::Function => "fn",
            SymbolKind::Constant => "constant",
            SymbolKind::TypeAlias => "type",
            SymbolKind::Other => "other",
        }
    }

    /// Parse a kind tag as produced by an extractor.
    ///
    /// Matching is case-insensitive and accepts both canonical and short
    /// names. Unknown tags become [`SymbolKind::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "struct" => SymbolKind::Struct,
            "enum" => SymbolKind::Enum,
            "trait" | "interface" => SymbolKind::Trait,
            "mod" | "module" => SymbolKind::Module,
            "fn" | "function" => SymbolKind::Function,
            "const" | "constant" => SymbolKind::Constant,
            "type" | "typealias" | "type_alias" => SymbolKind::TypeAlias,
            _ => SymbolKind::Other,
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for SymbolKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for SymbolKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(SymbolKind::from_tag(&tag))
    }
}

/// Visibility of a symbol, ordered from most to least visible.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    #[serde(alias = "pub")]
    Public,
    #[serde(alias = "pub(crate)", alias = "crate-internal", alias = "internal")]
    Crate,
    Private,
}

impl Visibility {
    /// Whether a symbol with this visibility is shown when documenting up
    /// to `threshold`.
    pub fn is_within(&self, threshold: Visibility) -> bool {
        *self <= threshold
    }
}

/// Errors raised when building module paths or qualified names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("module path is empty")]
    Empty,

    #[error("invalid module path segment {0:?}")]
    InvalidSegment(String),

    #[error("module path segment {0:?} collides with an output file or directory")]
    ReservedSegment(String),

    #[error("{0:?} does not name an item inside a module")]
    MissingModule(String),
}

/// Ordered, non-empty sequence of module path segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ModulePath(Vec<String>);

impl ModulePath {
    /// Build a path from segments, validating each one.
    pub fn new<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self(segments))
    }

    /// Parse a `a::b::c` path.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        Self::new(path.split(PATH_SEPARATOR))
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Last segment.
    pub fn name(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// Parent module, if this is not a top-level module.
    pub fn parent(&self) -> Option<ModulePath> {
        if self.0.len() < 2 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Append one segment.
    pub fn child(&self, segment: &str) -> Result<ModulePath, PathError> {
        validate_segment(segment)?;
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Self(segments))
    }

    /// Whether `self` is `ancestor` or lives below it.
    pub fn starts_with(&self, ancestor: &ModulePath) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Whether `self` is a direct child of `parent`.
    pub fn is_child_of(&self, parent: &ModulePath) -> bool {
        self.0.len() == parent.0.len() + 1 && self.starts_with(parent)
    }

    /// Relative directory for this module's artifacts.
    pub fn to_relative_dir(&self) -> PathBuf {
        self.0.iter().collect()
    }
}

/// Names used by artifacts inside the output directory.
const RESERVED_SEGMENTS: &[&str] = &[SIDEBAR_JSON_FILE, SIDEBAR_JS_FILE, SEARCH_INDEX_FILE];

fn validate_segment(segment: &str) -> Result<(), PathError> {
    let invalid = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.chars().any(|c| matches!(c, '/' | '\\' | ':') || c.is_control());
    if invalid {
        return Err(PathError::InvalidSegment(segment.to_string()));
    }
    // Hidden names hold the cache and temporary files.
    if segment.starts_with('.') || RESERVED_SEGMENTS.contains(&segment) {
        return Err(PathError::ReservedSegment(segment.to_string()));
    }
    Ok(())
}

impl TryFrom<Vec<String>> for ModulePath {
    type Error = PathError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<ModulePath> for Vec<String> {
    fn from(path: ModulePath) -> Self {
        path.0
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(PATH_SEPARATOR))
    }
}

/// Fully qualified item name: owning module plus item id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedName {
    pub module: ModulePath,
    pub id: String,
}

impl QualifiedName {
    pub fn new(module: ModulePath, id: impl Into<String>) -> Self {
        Self {
            module,
            id: id.into(),
        }
    }

    /// Parse an absolute `a::b::Item` name.
    pub fn parse(name: &str) -> Result<Self, PathError> {
        match name.rsplit_once(PATH_SEPARATOR) {
            Some((module, id)) if !id.is_empty() => Ok(Self::new(ModulePath::parse(module)?, id)),
            _ => Err(PathError::MissingModule(name.to_string())),
        }
    }

    /// Parse a re-export target relative to the module holding the directive.
    ///
    /// A bare `Item` or `self::Item` names an item of `base` itself;
    /// `self::a::Item` names an item of a child of `base`.
    pub fn parse_relative(name: &str, base: &ModulePath) -> Result<Self, PathError> {
        let name = name.trim();
        if let Some(rest) = name.strip_prefix("self::") {
            return match rest.rsplit_once(PATH_SEPARATOR) {
                Some((relative, id)) => {
                    let mut module = base.clone();
                    for segment in relative.split(PATH_SEPARATOR) {
                        module = module.child(segment)?;
                    }
                    Ok(Self::new(module, id))
                }
                None => Ok(Self::new(base.clone(), rest)),
            };
        }
        if name.contains(PATH_SEPARATOR) {
            Self::parse(name)
        } else if name.is_empty() {
            Err(PathError::MissingModule(name.to_string()))
        } else {
            Ok(Self::new(base.clone(), name))
        }
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = PathError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::parse(&name)
    }
}

impl From<QualifiedName> for String {
    fn from(name: QualifiedName) -> Self {
        name.to_string()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.module, PATH_SEPARATOR, self.id)
    }
}

/// One documented item as it appears in a module index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolRecord {
    /// Item id, unique within the owning module
    pub id: String,
    /// Kind of item
    pub kind: SymbolKind,
    /// Name shown in the sidebar
    pub display_name: String,
    /// First-line summary (may be empty)
    #[serde(default)]
    pub short_doc: String,
    /// Module this record is listed under
    pub owning_module_path: ModulePath,
    /// Visibility of the item (or of the re-export directive)
    #[serde(default)]
    pub visibility: Visibility,
    /// Opaque location used only for cross-linking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    /// Originating definition when this record comes from a re-export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reexport_of: Option<QualifiedName>,
}

impl SymbolRecord {
    /// Create a public record with an empty summary.
    pub fn new(id: impl Into<String>, kind: SymbolKind, owning_module_path: ModulePath) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind,
            short_doc: String::new(),
            owning_module_path,
            visibility: Visibility::Public,
            source_location: None,
            reexport_of: None,
        }
    }

    pub fn with_doc(mut self, short_doc: impl Into<String>) -> Self {
        self.short_doc = short_doc.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_source_location(mut self, location: impl Into<String>) -> Self {
        self.source_location = Some(location.into());
        self
    }

    /// Whether this record was produced by resolving a re-export.
    pub fn is_reexport(&self) -> bool {
        self.reexport_of.is_some()
    }

    /// Whether the summary carries any text.
    pub fn has_doc(&self) -> bool {
        !self.short_doc.trim().is_empty()
    }

    /// Name of this record inside its owning module.
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(self.owning_module_path.clone(), self.id.clone())
    }
}
