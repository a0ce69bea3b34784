//! Resolution of generated-file locations back to original sources.

pub mod replace;
pub mod store;

use std::path::{Path, PathBuf};
use serde::Serialize;
use url::Url;

use crate::tree::{Position, Range};

pub use replace::{force_crlf, replace_all_locations, sourcemap_stack, try_derive_stack_location};
pub use store::SourceMapStore;

/// A position inside a document identified by URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    /// Zero-width location at `position`.
    pub fn at(uri: impl Into<String>, position: Position) -> Self {
        Self {
            uri: uri.into(),
            range: Range::new(position, position),
        }
    }
}

/// Renders as `uri:LINE:COL` with one-based line and column.
impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.uri,
            self.range.start.line + 1,
            self.range.start.character + 1
        )
    }
}

/// `file://` URI for a path. Relative paths are kept as-is after the scheme.
pub fn file_uri(path: &Path) -> String {
    match Url::from_file_path(path) {
        Ok(url) => url.to_string(),
        Err(()) => format!("file://{}", path.display()),
    }
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}
