//! Vendored dependency manifest.
//!
//! A module may ship `vendor/modules.txt`, listing the modules it was built
//! against as `# <path> <version>` lines. The list is already flattened, so
//! one level of lookup covers the whole dependency graph.

use std::path::Path;

use super::error::ExtractionError;
use super::traits::ModuleVersion;

/// Manifest location relative to a module root.
pub const MANIFEST_PATH: &str = "vendor/modules.txt";

/// Parse the dependency lines of a vendor manifest.
///
/// Lines with any other shape (package lists, `## explicit` markers,
/// replacement directives) are ignored.
pub fn parse_manifest(text: &str) -> Vec<ModuleVersion> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["#", path, version] => Some(ModuleVersion::new(*path, *version)),
                _ => None,
            }
        })
        .collect()
}

/// Dependencies declared by the module extracted at `root`.
///
/// A module without a manifest has no dependencies.
pub async fn dependencies(root: &Path) -> Result<Vec<ModuleVersion>, ExtractionError> {
    let manifest = root.join(MANIFEST_PATH);
    match tokio::fs::read_to_string(&manifest).await {
        Ok(text) => Ok(parse_manifest(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ExtractionError::io("could not read vendor manifest", manifest, e)),
    }
}
