//! Path normalization and `*`/`**` glob compilation (§4.1).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// A pattern is any string containing `*`.
pub fn is_pattern(path: &str) -> bool {
    path.contains('*')
}

/// Collapses repeated `/`, resolves `.`/`..` segments, and strips a trailing
/// `/` (except for the root itself). Rejects inputs that aren't absolute.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::invalid_argument(format!("path must be absolute: {path:?}")));
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", stack.join("/")))
    }
}

/// Splits a normalized absolute path into its parent path (`None` for the
/// root) and its final segment name, for resolving a [`FileEntry`]'s
/// `parentId` (§3).
///
/// [`FileEntry`]: crate::metadata::FileEntry
pub fn split(path: &str) -> (Option<String>, String) {
    if path == "/" {
        return (None, String::new());
    }
    match path.rfind('/') {
        Some(0) => (Some("/".to_string()), path[1..].to_string()),
        Some(idx) => (Some(path[..idx].to_string()), path[idx + 1..].to_string()),
        None => (Some("/".to_string()), path.to_string()),
    }
}

/// Global cache of compiled glob patterns, shared process-wide so repeated
/// subscriptions to the same pattern string never recompile (§4.1, §9 — this
/// is the one piece of pattern state treated as "module state" per the whole
/// process rather than per coordinator, since a compiled regex carries no
/// per-filesystem identity).
static PATTERN_CACHE: Lazy<dashmap::DashMap<String, Regex>> = Lazy::new(dashmap::DashMap::new);

/// A compiled, anchored glob matcher, cached by its source pattern string.
#[derive(Clone)]
pub struct Pattern {
    source: String,
}

impl Pattern {
    /// Compiles (or reuses a cached compilation of) `pattern`.
    pub fn compile(pattern: &str) -> Result<Self> {
        if !PATTERN_CACHE.contains_key(pattern) {
            let regex = compile_regex(pattern)?;
            PATTERN_CACHE.insert(pattern.to_string(), regex);
        }
        Ok(Self { source: pattern.to_string() })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match PATTERN_CACHE.get(&self.source) {
            Some(regex) => regex.is_match(candidate),
            None => false,
        }
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

/// Translates a glob into an anchored regex, per §4.1:
/// - `**/` → zero or more path segments with a trailing slash.
/// - trailing `/**` → this path or any descendant.
/// - standalone `**` → any characters.
/// - single `*` → any characters except `/`.
fn compile_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let mut i = 0;

    // trailing "/**" means "this path or any descendant" — handle it as a
    // suffix rule so the loop below doesn't need to special-case the tail.
    let (body, trailing_any_descendant) = match pattern.strip_suffix("/**") {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };

    let chars: Vec<char> = body.chars().collect();
    let len = chars.len();
    while i < len {
        if chars[i] == '*' && i + 1 < len && chars[i + 1] == '*' {
            if i + 2 < len && chars[i + 2] == '/' {
                // "**/" → zero or more segments followed by a slash
                out.push_str("(?:.*/)?");
                i += 3;
            } else {
                // standalone "**" → any characters
                out.push_str(".*");
                i += 2;
            }
        } else if chars[i] == '*' {
            out.push_str("[^/]*");
            i += 1;
        } else {
            out.push_str(&regex::escape(&chars[i].to_string()));
            i += 1;
        }
    }

    if trailing_any_descendant {
        out.push_str("(?:/.*)?");
    }
    out.push('$');

    Regex::new(&out)
        .map_err(|e| Error::invalid_argument(format!("invalid pattern {pattern:?}: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_dot_segments() {
        assert_eq!(normalize("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("/a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/..").unwrap(), "/");
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(normalize("a/b").is_err());
    }

    #[test]
    fn splits_path_into_parent_and_name() {
        assert_eq!(split("/"), (None, String::new()));
        assert_eq!(split("/a"), (Some("/".to_string()), "a".to_string()));
        assert_eq!(split("/a/b"), (Some("/a".to_string()), "b".to_string()));
    }

    #[test]
    fn double_star_suffix_matches_self_and_descendants() {
        let p = Pattern::compile("/a/**").unwrap();
        assert!(p.matches("/a"));
        assert!(p.matches("/a/b"));
        assert!(p.matches("/a/b/c"));
        assert!(!p.matches("/ab"));
    }

    #[test]
    fn single_star_matches_only_immediate_children() {
        let p = Pattern::compile("/a/*").unwrap();
        assert!(p.matches("/a/b"));
        assert!(!p.matches("/a/b/c"));
        assert!(!p.matches("/a"));
    }
}
