use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use sourcemap::SourceMap;
use tokio::sync::OnceCell;
use url::Url;

use crate::tree::{ContentSource, Position};
use super::{uri_to_path, Location};

static INLINE_SOURCEMAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^//# sourceMappingURL=data:application/json;base64,(.+)")
        .expect("Invalid inline source map pattern")
});

type MapSlot = Arc<OnceCell<Option<Arc<SourceMap>>>>;

/// Loads and caches the inline source map of generated files.
///
/// Each URI is fetched at most once; concurrent requests for the same URI
/// wait on the first load. Failed loads are cached as "no map".
pub struct SourceMapStore {
    source: Arc<dyn ContentSource>,
    cache: Mutex<HashMap<String, MapSlot>>,
}

impl SourceMapStore {
    pub fn new(source: Arc<dyn ContentSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Map a one-based `line`/`col` in `generated_uri` to its original
    /// location. The returned location is zero-based.
    pub async fn get_source_location(&self, generated_uri: &str, line: u32, col: u32) -> Option<Location> {
        let map = self.load(generated_uri).await?;
        let dst_line = line.saturating_sub(1);
        let dst_col = col.saturating_sub(1);

        // Greatest lower bound on the same line, then least upper bound
        let glb = map
            .lookup_token(dst_line, dst_col)
            .filter(|t| t.get_dst_line() == dst_line);
        let lub = || {
            map.tokens()
                .find(|t| t.get_dst_line() == dst_line && t.get_dst_col() >= dst_col)
        };

        for token in glb.into_iter().chain(lub()) {
            if token.get_src_line() == u32::MAX {
                continue;
            }
            let Some(source) = token.get_source() else { continue };
            return Some(Location::at(
                resolve_source(generated_uri, source),
                Position::new(token.get_src_line(), token.get_src_col()),
            ));
        }
        None
    }

    async fn load(&self, uri: &str) -> Option<Arc<SourceMap>> {
        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cache.entry(uri.to_string()).or_default())
        };
        slot.get_or_init(|| self.fetch(uri)).await.clone()
    }

    async fn fetch(&self, uri: &str) -> Option<Arc<SourceMap>> {
        let Some(path) = uri_to_path(uri) else {
            tracing::warn!("Error parsing sourcemap for {}: not a file URI", uri);
            return None;
        };
        let contents = match self.source.get_content(&path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Error parsing sourcemap for {}: {}", uri, e);
                return None;
            }
        };

        let encoded = INLINE_SOURCEMAP_RE.captures(&contents)?.get(1)?.as_str().trim();
        let decoded = match STANDARD.decode(encoded) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Error parsing sourcemap for {}: {}", uri, e);
                return None;
            }
        };
        match SourceMap::from_slice(&decoded) {
            Ok(map) => {
                tracing::debug!("Loaded sourcemap for {} ({} tokens)", uri, map.get_token_count());
                Some(Arc::new(map))
            }
            Err(e) => {
                tracing::warn!("Error parsing sourcemap for {}: {}", uri, e);
                None
            }
        }
    }
}

/// Sources are resolved against the generated file's URI.
fn resolve_source(generated_uri: &str, source: &str) -> String {
    Url::parse(generated_uri)
        .and_then(|base| base.join(source))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| source.to_string())
}
