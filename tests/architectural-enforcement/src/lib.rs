//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the chat session workspace:
//! - No blocking sleeps in production code
//! - Network crates stay behind the API and transport layers
//! - No panicking shortcuts in library code
//!
//! The helpers here scan source files; the rules live under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A rule violation found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File path relative to the workspace root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Source directory of the session core library
pub fn core_src() -> PathBuf {
    workspace_root().join("session").join("core").join("src")
}

/// All `.rs` files under `dir`
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|ext| ext == "rs"))
        .collect();
    files.sort();
    files
}

/// Production lines of a file: everything before the first `#[cfg(test)]`,
/// with comment lines dropped
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line.to_string()))
        .collect()
}

/// Lines in production code under `dir` containing any of `needles`,
/// skipping files whose path relative to `dir` starts with an allowed prefix
pub fn find_violations(dir: &Path, needles: &[&str], allowed: &[&str]) -> Vec<Violation> {
    let root = workspace_root();
    let mut violations = Vec::new();
    for file in rust_files(dir) {
        let relative = file.strip_prefix(dir).unwrap_or(&file);
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if allowed.iter().any(|prefix| relative_str.starts_with(prefix)) {
            continue;
        }
        for (line, text) in production_lines(&file) {
            if needles.iter().any(|needle| text.contains(needle)) {
                violations.push(Violation {
                    path: file.strip_prefix(&root).unwrap_or(&file).to_path_buf(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Panic with a readable list when `violations` is non-empty
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    let list: Vec<String> = violations.iter().map(ToString::to_string).collect();
    panic!(
        "{rule}: {} violation(s)\n  {}",
        violations.len(),
        list.join("\n  ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_sources_found() {
        let files = rust_files(&core_src());
        assert!(files.iter().any(|p| p.ends_with("controller.rs")));
    }

    #[test]
    fn test_production_lines_stop_at_tests() {
        let dir = std::env::temp_dir().join(format!("arch-enforce-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.rs");
        fs::write(&file, "fn a() {}\n// note\n#[cfg(test)]\nfn b() {}\n").unwrap();
        let lines = production_lines(&file);
        assert_eq!(lines, vec![(1, "fn a() {}".to_string())]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
