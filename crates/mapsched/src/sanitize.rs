//! Helpers for turning untrusted user input into safe filename fragments
//! and for keeping tracing span attributes free of full paths.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static RE_DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9-]+").unwrap());

/// Reduces a map title to a filename-safe ASCII fragment.
///
/// Surrounding whitespace is trimmed, inner whitespace runs collapse to a
/// single `-`, then everything outside `[A-Za-z0-9-]` is dropped.
///
/// - `"Paris"` → `"Paris"`
/// - `"  Le   Mans "` → `"Le-Mans"`
/// - `"Saint-Étienne (42)"` → `"Saint-tienne-42"`
pub fn computize_title(title: &str) -> String {
    let collapsed = RE_WHITESPACE.replace_all(title.trim(), "-");
    RE_DISALLOWED.replace_all(&collapsed, "").into_owned()
}

/// Returns only the filename component of a path (no directory).
///
/// Used for span fields so logs never carry the output directory layout.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}
