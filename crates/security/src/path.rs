//! Path validation: filesystem sandboxing to the workspace root.
//!
//! File tools resolve every user-supplied path through [`Workspace::resolve`],
//! which canonicalizes it and rejects anything outside the root.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace root '{root}'")]
    OutsideWorkspace { path: String, root: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// The single directory tree file tools may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Canonicalize `root`; it must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathValidationError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|e| PathValidationError::CanonicalizeFailed {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (absolute, or relative to the root) to a canonical
    /// path inside the workspace.
    ///
    /// Symlinks are resolved for the longest existing prefix; components
    /// that do not exist yet (e.g., for writes) are appended verbatim and may
    /// not contain `..`.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathValidationError> {
        let input = Path::new(path);
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };

        let canonical = canonicalize_lenient(&joined).map_err(|reason| match reason {
            Lenient::Traversal => PathValidationError::PathTraversal { path: path.into() },
            Lenient::Io(reason) => PathValidationError::CanonicalizeFailed {
                path: path.into(),
                reason,
            },
        })?;

        if !canonical.starts_with(&self.root) {
            return Err(PathValidationError::OutsideWorkspace {
                path: path.into(),
                root: self.root.display().to_string(),
            });
        }
        Ok(canonical)
    }

    /// Whether `path` resolves inside the workspace.
    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    /// Display `path` relative to the root when possible.
    pub fn relative<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy(),
            _ => path.to_string_lossy(),
        }
    }
}

enum Lenient {
    Traversal,
    Io(String),
}

/// Canonicalize the longest existing ancestor and re-attach the rest.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf, Lenient> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name() else {
            break;
        };
        missing.push(name.to_os_string());
        if !existing.pop() {
            break;
        }
    }
    let mut canonical = existing
        .canonicalize()
        .map_err(|e| Lenient::Io(e.to_string()))?;

    // `file_name()` never yields `..`, so any parent hop was resolved above.
    for name in missing.iter().rev() {
        match Path::new(name).components().next() {
            Some(Component::Normal(_)) => canonical.push(name),
            _ => return Err(Lenient::Traversal),
        }
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn existing_file_resolves() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve(&ws.root().join("src/main.rs").display().to_string()).unwrap();
        assert!(resolved.ends_with("src/main.rs"));
    }

    #[test]
    fn relative_paths_join_root() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("src/main.rs").unwrap();
        assert!(resolved.starts_with(ws.root()));
    }

    #[test]
    fn new_file_in_new_directory_resolves() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("docs/guide/intro.md").unwrap();
        assert_eq!(resolved, ws.root().join("docs/guide/intro.md"));
    }

    #[test]
    fn outside_root_rejected() {
        let (_dir, ws) = workspace();
        match ws.resolve("/etc/passwd").unwrap_err() {
            PathValidationError::OutsideWorkspace { .. } => {}
            other => panic!("Expected OutsideWorkspace, got: {other}"),
        }
    }

    #[test]
    fn traversal_through_existing_dirs_is_caught_by_prefix() {
        let (_dir, ws) = workspace();
        assert!(ws.resolve("src/../../escape.txt").is_err());
    }

    #[test]
    fn traversal_in_missing_suffix_rejected() {
        let (_dir, ws) = workspace();
        assert!(ws.resolve("newdir/../../../etc/passwd").is_err());
    }

    #[test]
    fn sibling_with_shared_prefix_rejected() {
        let parent = tempfile::tempdir().unwrap();
        fs::create_dir_all(parent.path().join("work")).unwrap();
        fs::create_dir_all(parent.path().join("work-other")).unwrap();
        let ws = Workspace::new(parent.path().join("work")).unwrap();
        let sibling = parent.path().join("work-other/file.txt");
        assert!(ws.resolve(&sibling.display().to_string()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_rejected() {
        let (_dir, ws) = workspace();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.root().join("link")).unwrap();
        assert!(ws.resolve("link/secret").is_err());
    }

    #[test]
    fn relative_display() {
        let (_dir, ws) = workspace();
        let full = ws.root().join("src/main.rs");
        assert_eq!(ws.relative(&full), "src/main.rs");
    }
}
