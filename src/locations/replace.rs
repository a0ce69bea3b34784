use std::sync::LazyLock;

use futures::future::join_all;
use regex::{Captures, Regex};

use crate::tree::Range;
use super::{Location, SourceMapStore};

static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(file:/{3}.+):([0-9]+):([0-9]+)").expect("Invalid location pattern")
});

async fn derive_source_location(store: &SourceMapStore, caps: &Captures<'_>) -> Option<Location> {
    let uri = caps.get(1)?.as_str();
    let line: u32 = caps.get(2)?.as_str().parse().ok()?;
    let col: u32 = caps.get(3)?.as_str().parse().ok()?;
    store.get_source_location(uri, line, col).await
}

async fn resolve_all<'t>(store: &SourceMapStore, text: &'t str) -> Vec<(Captures<'t>, Option<Location>)> {
    let matches: Vec<Captures<'t>> = LOCATION_RE.captures_iter(text).collect();
    let resolved = join_all(matches.iter().map(|c| derive_source_location(store, c))).await;
    matches.into_iter().zip(resolved).collect()
}

/// Replace every `file:///...:LINE:COL` reference in `text` with its
/// original location. Unresolved references and the text between them are
/// kept verbatim.
pub async fn replace_all_locations(store: &SourceMapStore, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for (caps, location) in resolve_all(store, text).await {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&text[last..m.start()]);
        match location {
            Some(loc) => out.push_str(&loc.to_string()),
            None => out.push_str(m.as_str()),
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Rewrite a stack trace so resolved frames point at `uri#LLINE:COL`.
pub async fn sourcemap_stack(store: &SourceMapStore, stack: &str) -> String {
    let mut out = stack.to_string();
    for (caps, location) in resolve_all(store, stack).await {
        let (Some(m), Some(loc)) = (caps.get(0), location) else { continue };
        let to = format!(
            "{}#L{}:{}",
            loc.uri,
            loc.range.start.line + 1,
            loc.range.start.character + 1
        );
        out = out.replacen(m.as_str(), &to, 1);
    }
    out
}

/// Pick the stack frame that best identifies where a test failed.
///
/// A frame in the test's own file scores 1, inside the test's declared
/// range 2. Ties go to the frame that appears first.
pub async fn try_derive_stack_location(
    store: &SourceMapStore,
    stack: &str,
    test_uri: Option<&str>,
    test_range: Option<&Range>,
) -> Option<Location> {
    let mut best: Option<(u8, Location)> = None;

    for (_, location) in resolve_all(store, stack).await {
        let Some(location) = location else { continue };
        let mut score = 0;
        if test_uri == Some(location.uri.as_str()) {
            score = 1;
            if test_range.is_some_and(|r| r.contains(&location.range)) {
                score = 2;
            }
        }
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, location));
        }
    }

    best.map(|(_, location)| location)
}

/// Convert bare `\n` line endings to `\r\n`.
pub fn force_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev = None;
    for ch in text.chars() {
        if ch == '\n' && prev != Some('\r') {
            out.push('\r');
        }
        out.push(ch);
        prev = Some(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locations::store::tests::write_generated;
    use crate::tree::{FsContentSource, Position};
    use std::sync::Arc;

    fn store() -> SourceMapStore {
        SourceMapStore::new(Arc::new(FsContentSource))
    }

    #[tokio::test]
    async fn test_replace_keeps_surrounding_text() {
        let dir = tempfile::tempdir().unwrap();
        let uri = write_generated(dir.path(), "foo.js", "file:///src/foo.ts");
        let text = format!("Error: boom\n    at run ({}:10:5)\n", uri);

        let replaced = replace_all_locations(&store(), &text).await;
        assert_eq!(replaced, "Error: boom\n    at run (file:///src/foo.ts:4:3)\n");
    }

    #[tokio::test]
    async fn test_unresolved_matches_unchanged() {
        let text = "at x (file:///nowhere/gen.js:1:2) and plain text";
        assert_eq!(replace_all_locations(&store(), text).await, text);
        assert_eq!(replace_all_locations(&store(), "no refs").await, "no refs");
    }

    #[tokio::test]
    async fn test_sourcemap_stack_uses_fragment_form() {
        let dir = tempfile::tempdir().unwrap();
        let uri = write_generated(dir.path(), "foo.js", "file:///src/foo.ts");
        let stack = format!("AssertionError\n    at {}:10:5\n", uri);

        let out = sourcemap_stack(&store(), &stack).await;
        assert_eq!(out, "AssertionError\n    at file:///src/foo.ts#L4:3\n");
    }

    #[tokio::test]
    async fn test_stack_location_scoring() {
        let dir = tempfile::tempdir().unwrap();
        let other = write_generated(dir.path(), "other.js", "file:///src/other.ts");
        let own = write_generated(dir.path(), "own.js", "file:///src/own.ts");
        let stack = format!("Error\n    at {}:10:5\n    at {}:10:5\n", other, own);
        let store = store();

        // Same file outranks an earlier frame elsewhere
        let loc = try_derive_stack_location(&store, &stack, Some("file:///src/own.ts"), None)
            .await
            .unwrap();
        assert_eq!(loc.uri, "file:///src/own.ts");

        // No file match: earliest resolved frame wins
        let loc = try_derive_stack_location(&store, &stack, Some("file:///src/x.ts"), None)
            .await
            .unwrap();
        assert_eq!(loc.uri, "file:///src/other.ts");

        let range = Range::new(Position::new(0, 0), Position::new(10, 0));
        let loc = try_derive_stack_location(&store, &stack, Some("file:///src/own.ts"), Some(&range))
            .await
            .unwrap();
        assert_eq!(loc.range.start, Position::new(3, 2));
    }

    #[tokio::test]
    async fn test_stack_without_frames_is_none() {
        assert!(try_derive_stack_location(&store(), "Error: x", None, None).await.is_none());
    }

    #[test]
    fn test_force_crlf() {
        assert_eq!(force_crlf("a\nb\r\nc\n"), "a\r\nb\r\nc\r\n");
        assert_eq!(force_crlf(""), "");
    }
}
