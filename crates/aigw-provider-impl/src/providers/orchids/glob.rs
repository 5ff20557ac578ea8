//! Restricted glob compilation and the bounded content search used by the
//! fs-operation loop.
//!
//! Only `*`, `**` and `?` are recognized.  Patterns match forward-slashed
//! paths relative to the working directory; `node_modules` and `.git` trees
//! are never visited.

use std::path::{Path, PathBuf};

use regex::Regex;

pub const RIPGREP_MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
pub const RIPGREP_MAX_RESULTS: usize = 200;
pub const RIPGREP_MAX_FILES: usize = 2000;

const SKIP_DIRS: &[&str] = &["node_modules", ".git"];

/// Compile a restricted glob into an anchored regex over `/`-separated
/// relative paths.
///
/// `**` matches any number of path segments including zero; `*` stays inside
/// one segment; `?` matches exactly one non-`/` character.
pub fn compile_glob(pattern: &str) -> Result<Regex, String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following separator so `**/` also covers the
                    // zero-segment case.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:[^/]+/)*");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '/' => out.push('/'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| format!("invalid glob {pattern:?}: {err}"))
}

fn skip_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

fn relative_slashed(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let joined = rel
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Some(joined)
}

/// Walk `root` collecting files whose relative path matches the glob.
pub fn glob_files(root: &Path, pattern: &str, limit: usize) -> Result<Vec<String>, String> {
    let matcher = compile_glob(pattern)?;
    let mut matches = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !skip_dir(&name) {
                    stack.push(path);
                }
                continue;
            }
            if let Some(rel) = relative_slashed(root, &path)
                && matcher.is_match(&rel)
            {
                matches.push(rel);
                if matches.len() >= limit {
                    matches.sort();
                    return Ok(matches);
                }
            }
        }
    }
    matches.sort();
    Ok(matches)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SearchHit {
    pub file: String,
    pub line: usize,
    pub text: String,
}

/// Regex content search with hard caps: file size, visited-file count and
/// total result count.
pub fn ripgrep(
    root: &Path,
    pattern: &str,
    file_glob: Option<&str>,
) -> Result<Vec<SearchHit>, String> {
    let matcher = Regex::new(pattern).map_err(|err| format!("invalid pattern: {err}"))?;
    let file_matcher = match file_glob {
        Some(glob) => Some(compile_glob(glob)?),
        None => None,
    };

    let mut hits = Vec::new();
    let mut visited = 0usize;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !skip_dir(&name) {
                    stack.push(path);
                }
            } else {
                files.push(path);
            }
        }
        files.sort();
        for path in files {
            if visited >= RIPGREP_MAX_FILES {
                return Ok(hits);
            }
            visited += 1;
            let Some(rel) = relative_slashed(root, &path) else {
                continue;
            };
            if let Some(file_matcher) = &file_matcher
                && !file_matcher.is_match(&rel)
            {
                continue;
            }
            let size = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            if size > RIPGREP_MAX_FILE_BYTES {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                if matcher.is_match(line) {
                    hits.push(SearchHit {
                        file: rel.clone(),
                        line: index + 1,
                        text: line.chars().take(500).collect(),
                    });
                    if hits.len() >= RIPGREP_MAX_RESULTS {
                        return Ok(hits);
                    }
                }
            }
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        compile_glob(pattern).unwrap().is_match(path)
    }

    #[test]
    fn double_star_crosses_any_number_of_segments() {
        assert!(matches("**/*.rs", "src/lib.rs"));
        assert!(matches("**/*.rs", "a/b/c/d.rs"));
        // Zero segments.
        assert!(matches("**/*.rs", "main.rs"));
        assert!(!matches("**/*.rs", "main.ts"));
    }

    #[test]
    fn single_star_stays_in_one_segment() {
        assert!(matches("src/*.rs", "src/lib.rs"));
        assert!(!matches("src/*.rs", "src/nested/lib.rs"));
    }

    #[test]
    fn question_mark_matches_one_non_separator() {
        assert!(matches("file?.txt", "file1.txt"));
        assert!(!matches("file?.txt", "file10.txt"));
        assert!(!matches("a?b", "a/b"));
    }

    #[test]
    fn glob_walk_skips_node_modules_and_git() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("src/a.js"), "x").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/b.js"), "x").unwrap();

        let found = glob_files(dir.path(), "**/*.js", 100).unwrap();
        assert_eq!(found, vec!["src/a.js".to_string()]);
    }

    #[test]
    fn ripgrep_caps_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::new();
        for _ in 0..(RIPGREP_MAX_RESULTS + 50) {
            content.push_str("needle here\n");
        }
        std::fs::write(dir.path().join("big.txt"), content).unwrap();
        let hits = ripgrep(dir.path(), "needle", None).unwrap();
        assert_eq!(hits.len(), RIPGREP_MAX_RESULTS);
        assert_eq!(hits[0].line, 1);
    }
}
