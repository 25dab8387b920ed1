//! Source reading, field normalization and canonical record extraction.

use std::fs;
use std::path::{Path, PathBuf};

use lrc_core::RawNode;
use thiserror::Error;

pub mod extract;
pub mod names;
pub mod normalize;

pub use extract::{collect_records, entity_nodes, ExtractStats, Records, SourceExtractor};
pub use names::{NameExtractor, NameRule, NameRules, RuleAction};
pub use normalize::{FieldNormalizer, Normalized};

pub const CRATE_NAME: &str = "lrc-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading export {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing export {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("entity path {0} not present in export")]
    MissingPath(String),
}

/// Produces the raw hierarchical tree of a legacy export.
///
/// Converting the legacy format itself (and repairing its text) happens
/// upstream; readers only hand over a well-formed tree.
pub trait SourceReader: Send + Sync {
    fn describe(&self) -> String;
    fn read(&self) -> Result<RawNode, ExtractError>;
}

/// Reads an export that was already converted into a JSON tree.
#[derive(Debug, Clone)]
pub struct JsonFileReader {
    path: PathBuf,
}

impl JsonFileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceReader for JsonFileReader {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> Result<RawNode, ExtractError> {
        let text = fs::read_to_string(&self.path).map_err(|source| ExtractError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ExtractError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}
