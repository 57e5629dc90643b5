//! Error taxonomy for the plugin engine.
//!
//! Each layer owns one error type and wraps the layer below with its own
//! context (descriptor name, module path, version). Callers branch on the
//! [`Error`] variant instead of matching message strings.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the plugin engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Invalid module descriptor or descriptor set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("config: a module must have a name")]
    MissingName,
    #[error("{0}: module names may only contain letters, numbers, '-' and '_'")]
    InvalidName(String),
    #[error("{0}: module must have a path")]
    MissingPath(String),
    #[error("config: module name {0:?} is a duplicate. module names must be unique")]
    DuplicateName(String),
    #[error("config: at least one module is required")]
    Empty,
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("invalid vertical position: {0}")]
    InvalidVertical(String),
    #[error("invalid horizontal position: {0}")]
    InvalidHorizontal(String),
}

/// Failure to resolve or fetch a module from the registry.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("invalid module path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("invalid module version {version:?}: {reason}")]
    InvalidVersion {
        version: String,
        reason: &'static str,
    },
    #[error("invalid proxy url {url:?}: {reason}")]
    InvalidProxy { url: String, reason: String },
    #[error("could not resolve version {version:?} of module {path:?}: {source}")]
    Request {
        path: String,
        version: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("version {version} does not exist for module {path:?} (HTTP {status})")]
    Status {
        path: String,
        version: String,
        status: u16,
    },
    #[error("could not resolve version {version:?} of module {path:?}: malformed metadata: {reason}")]
    Metadata {
        path: String,
        version: String,
        reason: String,
    },
    #[error("could not read module {path:?}@{version}: {source}")]
    Body {
        path: String,
        version: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure in the on-disk archive cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache path {0:?} does not exist")]
    MissingRoot(PathBuf),
    #[error("could not write to cache file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read cache file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while unpacking a module into the module tree.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unexpected file name {name} (expected prefix {prefix})")]
    UnexpectedEntry { name: String, prefix: String },
    #[error("file {name} escapes the module directory")]
    UnsafePath { name: String },
    #[error("file {name} is larger than declared ({declared} bytes)")]
    SizeMismatch { name: String, declared: u64 },
    #[error("could not read module archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not extract dependency {path}@{version} of {parent}: {source}")]
    Dependency {
        parent: String,
        path: String,
        version: String,
        #[source]
        source: Box<Error>,
    },
    #[error("extraction task failed: {0}")]
    Task(String),
}

impl ExtractionError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// A loaded package does not satisfy the plugin contract.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{name}: could not import module {path:?}: {reason}")]
    Import {
        name: String,
        path: String,
        reason: String,
    },
    #[error("{name}: module does not export {export:?}")]
    MissingExport { name: String, export: &'static str },
    #[error("{name}: module {export} must be a func with signature {expected}")]
    Signature {
        name: String,
        export: &'static str,
        expected: &'static str,
    },
    #[error("{name}: could not decode configuration: {reason}")]
    Config { name: String, reason: String },
}

/// A plugin failed while being constructed or released.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{name}: error loading module: {message}")]
    Constructor { name: String, message: String },
    #[error("{name}: nil module returned")]
    NilInstance { name: String },
    #[error("{name}: {export} trapped: {reason}")]
    Trap {
        name: String,
        export: String,
        reason: String,
    },
    #[error("{name}: guest memory access failed: {reason}")]
    Memory { name: String, reason: String },
    #[error("{name}: error closing module: {message}")]
    Close { name: String, message: String },
}

impl Error {
    /// Short label of the error kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Descriptor(_) => "descriptor",
            Self::Resolution(_) => "resolution",
            Self::Cache(_) => "cache",
            Self::Extraction(_) => "extraction",
            Self::Contract(_) => "contract",
            Self::Runtime(_) => "runtime",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_errors_render_module_name() {
        let err = DescriptorError::InvalidName("test@module".into());
        assert_eq!(
            err.to_string(),
            "test@module: module names may only contain letters, numbers, '-' and '_'"
        );
    }

    #[test]
    fn dependency_error_names_parent_and_dependency() {
        let inner = Error::from(ExtractionError::SizeMismatch {
            name: "dep@v1.0.0/a.txt".into(),
            declared: 3,
        });
        let err = ExtractionError::Dependency {
            parent: "root".into(),
            path: "dep".into(),
            version: "v1.0.0".into(),
            source: Box::new(inner),
        };
        let msg = err.to_string();
        assert!(msg.contains("dep@v1.0.0 of root"));
        assert!(msg.contains("larger than declared"));
    }

    #[test]
    fn kind_labels_match_layers() {
        let err = Error::from(RuntimeError::NilInstance { name: "x".into() });
        assert_eq!(err.kind(), "runtime");
        let err = Error::from(CacheError::MissingRoot(PathBuf::from("/nope")));
        assert_eq!(err.kind(), "cache");
    }
}
