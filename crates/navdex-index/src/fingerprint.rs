//! Content fingerprints for incremental rebuilds.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::aggregate::AggregatorConfig;
use crate::source::ModuleSource;
use crate::symbol::ModulePath;

#[derive(Serialize)]
struct FingerprintInput<'a> {
    module: &'a ModuleSource,
    children: &'a [ModulePath],
    options: &'a AggregatorConfig,
}

/// SHA-256 (hex) of everything that determines a module's own output.
///
/// Covers the module input as serialized JSON, its child module list, and
/// the aggregation options. Re-export targets in other modules are tracked
/// separately as cache dependencies.
pub fn module_fingerprint(
    module: &ModuleSource,
    children: &[ModulePath],
    options: &AggregatorConfig,
) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(&FingerprintInput {
        module,
        children,
        options,
    })?;
    Ok(compute_hash(&canonical))
}

/// SHA-256 of raw bytes, hex encoded.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
