//! Path confinement for scaffold writes.
//!
//! Every filesystem operation in this crate takes a [`GuardedPath`], and the
//! only way to obtain one is [`PathGuard::resolve`]. Resolution walks the
//! requested path one component at a time, following every symlink it meets
//! (including dangling ones), so a link planted mid-path that points outside
//! the root is caught even when the final file does not exist yet.
//!
//! ## Security
//! Components that do not exist yet are appended lexically: they cannot be
//! symlinks, so `..` after them is resolved against an already-canonical
//! prefix. Callers re-validate with [`PathGuard::revalidate`] after creating
//! intermediate directories to close the window between check and use.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{GuardError, GuardResult};

/// Upper bound on symlinks followed while resolving a single path (matches
/// the Linux `MAXSYMLINKS` limit).
const MAX_SYMLINK_HOPS: usize = 40;

/// Percent-encoded sequences that decode to traversal or separators.
const ENCODED_TRAVERSAL_PATTERNS: &[&str] = &["%2e%2e", "%2f", "%5c", "%00"];

/// Extensions refused by [`guard_file_extension`] unless a custom denylist is given.
pub const DEFAULT_DENIED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "bat", "cmd", "ps1", "sh", "com", "scr", "msi", "vbs", "jar",
];

/// The canonical directory every guarded operation is confined beneath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    path: PathBuf,
}

impl Root {
    /// Canonicalize `path` and establish it as the root for a bootstrap run.
    ///
    /// Rejects the empty path and the filesystem root, and requires the
    /// directory to exist.
    pub fn new(path: impl AsRef<Path>) -> GuardResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || path == Path::new("/") {
            return Err(GuardError::Config(format!(
                "'{}' is not a valid scaffold root",
                path.display()
            )));
        }

        let canonical = std::fs::canonicalize(path).map_err(|e| GuardError::io(path, e))?;
        if canonical == Path::new("/") {
            return Err(GuardError::Config(format!(
                "Root '/' is not a valid scaffold root (resolved from '{}')",
                path.display()
            )));
        }
        if !canonical.is_dir() {
            return Err(GuardError::PathConflict {
                path: canonical,
                reason: "scaffold root is not a directory".to_string(),
            });
        }

        Ok(Self { path: canonical })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A path proven to resolve inside a [`Root`], after following all symlinks.
///
/// There is no public constructor; values only come out of [`PathGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedPath {
    requested: String,
    resolved: PathBuf,
    root: PathBuf,
}

impl GuardedPath {
    /// The path as the caller originally asked for it.
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// The canonical resolved location.
    pub fn as_path(&self) -> &Path {
        &self.resolved
    }

    /// The root this path was validated against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The resolved location relative to the root (empty for the root itself).
    pub fn relative(&self) -> &Path {
        self.resolved.strip_prefix(&self.root).unwrap_or(Path::new(""))
    }

    pub fn is_root(&self) -> bool {
        self.resolved == self.root
    }

    /// The containing directory, if it is still inside the root.
    ///
    /// The parent of a confined path is either the root or another confined
    /// path, so no filesystem access is needed here.
    pub fn parent(&self) -> Option<GuardedPath> {
        let parent = self.resolved.parent()?;
        if !parent.starts_with(&self.root) {
            return None;
        }
        Some(GuardedPath {
            requested: self.requested.clone(),
            resolved: parent.to_path_buf(),
            root: self.root.clone(),
        })
    }

    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.resolved.file_name()
    }
}

impl AsRef<Path> for GuardedPath {
    fn as_ref(&self) -> &Path {
        &self.resolved
    }
}

impl std::fmt::Display for GuardedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resolved.display())
    }
}

/// Validates requested paths against a single [`Root`].
///
/// Resolution has no side effects, so it is safe to call before every
/// filesystem operation and from any number of threads.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: Root,
    allow_root: bool,
}

impl PathGuard {
    pub fn new(root: Root) -> Self {
        Self {
            root,
            allow_root: false,
        }
    }

    /// Permit paths that resolve to the root directory itself.
    pub fn with_allow_root(mut self, allow: bool) -> Self {
        self.allow_root = allow;
        self
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    /// Resolve `requested` against the root.
    ///
    /// Relative paths are joined onto the root; absolute paths must already
    /// lie beneath it. Fails with [`GuardError::PathEscape`] if the fully
    /// resolved location is not a strict descendant of the root.
    pub fn resolve(&self, requested: &str) -> GuardResult<GuardedPath> {
        check_requested(requested)?;

        let root = self.root.path();
        let candidate = Path::new(requested);
        let full = if candidate.is_absolute() {
            if !normalize_path_lexically(candidate).starts_with(root) {
                tracing::debug!(requested, "absolute path outside scaffold root");
                return Err(self.escape(requested));
            }
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };

        let resolved = resolve_following_symlinks(&full).map_err(|e| GuardError::io(&full, e))?;
        self.confine(requested, resolved)
    }

    /// Re-run resolution for an existing [`GuardedPath`].
    ///
    /// Used after creating directories: a component that did not exist at
    /// first validation may have been replaced by a symlink since.
    pub fn revalidate(&self, path: &GuardedPath) -> GuardResult<GuardedPath> {
        let resolved = resolve_following_symlinks(path.as_path())
            .map_err(|e| GuardError::io(path.as_path(), e))?;
        self.confine(&path.requested, resolved)
    }

    fn confine(&self, requested: &str, resolved: PathBuf) -> GuardResult<GuardedPath> {
        let root = self.root.path();
        let inside = resolved.starts_with(root) && (self.allow_root || resolved != root);
        if !inside {
            tracing::debug!(
                requested,
                resolved = %resolved.display(),
                "resolved path escapes scaffold root"
            );
            return Err(self.escape(requested));
        }

        Ok(GuardedPath {
            requested: requested.to_string(),
            resolved,
            root: root.to_path_buf(),
        })
    }

    fn escape(&self, requested: &str) -> GuardError {
        GuardError::PathEscape {
            requested: requested.to_string(),
            root: self.root.path().to_path_buf(),
        }
    }
}

fn check_requested(requested: &str) -> GuardResult<()> {
    let invalid = |reason: &str| GuardError::InvalidPath {
        requested: requested.to_string(),
        reason: reason.to_string(),
    };

    if requested.is_empty() {
        return Err(invalid("path is empty"));
    }
    if requested.contains('\0') {
        return Err(invalid("path contains a NUL byte"));
    }
    let lower = requested.to_ascii_lowercase();
    if ENCODED_TRAVERSAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Err(invalid("path contains percent-encoded traversal"));
    }
    Ok(())
}

/// Resolve an absolute path, following every symlink component.
///
/// Components that do not exist are appended as-is; an error is only
/// returned for conditions other than "not found" / "not a directory", or
/// when the symlink hop limit is exceeded.
fn resolve_following_symlinks(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<OsString> = VecDeque::new();
    let mut hops = 0usize;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            other => pending.push_back(other.as_os_str().to_os_string()),
        }
    }

    while let Some(part) = pending.pop_front() {
        if part == "." {
            continue;
        }
        if part == ".." {
            resolved.pop();
            continue;
        }

        let next = resolved.join(&part);
        match std::fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::other(format!(
                        "too many levels of symbolic links resolving '{}'",
                        path.display()
                    )));
                }
                let target = std::fs::read_link(&next)?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut expanded: Vec<OsString> = Vec::new();
                for component in target.components() {
                    match component {
                        Component::Prefix(_) | Component::RootDir => {
                            resolved.push(component.as_os_str())
                        }
                        other => expanded.push(other.as_os_str().to_os_string()),
                    }
                }
                for part in expanded.into_iter().rev() {
                    pending.push_front(part);
                }
            }
            Ok(_) => resolved = next,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                resolved = next
            }
            Err(e) => return Err(e),
        }
    }

    if resolved.as_os_str().is_empty() {
        resolved.push("/");
    }
    Ok(resolved)
}

/// Normalize a path lexically (without filesystem access).
pub fn normalize_path_lexically(path: &Path) -> PathBuf {
    let mut stack = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if stack
                    .last()
                    .is_some_and(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                {
                    stack.pop();
                }
            }
            c => stack.push(c),
        }
    }

    stack.iter().collect()
}

/// Check a file name's extension against an allowlist and a denylist.
///
/// `denied` defaults to [`DEFAULT_DENIED_EXTENSIONS`]. Extensions are
/// compared case-insensitively and may be given with or without a leading dot.
pub fn guard_file_extension(
    path: &Path,
    allowed: Option<&[&str]>,
    denied: Option<&[&str]>,
) -> GuardResult<()> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let matches = |list: &[&str]| {
        list.iter()
            .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    };
    let reject = |reason: String| GuardError::InvalidPath {
        requested: path.display().to_string(),
        reason,
    };

    if matches(denied.unwrap_or(DEFAULT_DENIED_EXTENSIONS)) {
        return Err(reject(format!("extension '.{ext}' is not allowed")));
    }
    if let Some(allowed) = allowed
        && !matches(allowed)
    {
        return Err(reject(format!(
            "extension '.{ext}' is not in the allowed list"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard_for(temp: &TempDir) -> PathGuard {
        PathGuard::new(Root::new(temp.path()).unwrap())
    }

    #[test]
    fn test_relative_path_inside_root() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        let guarded = guard.resolve("config/app.toml").unwrap();
        let root = std::fs::canonicalize(temp.path()).unwrap();
        assert_eq!(guarded.as_path(), root.join("config/app.toml"));
        assert_eq!(guarded.relative(), Path::new("config/app.toml"));
        assert_eq!(guarded.requested(), "config/app.toml");
    }

    #[test]
    fn test_dot_segments_inside_root_are_collapsed() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        let guarded = guard.resolve("./a/b/../c.txt").unwrap();
        assert_eq!(guarded.relative(), Path::new("a/c.txt"));
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        for attempt in ["../etc/passwd", "foo/../../../etc/passwd", "a/b/../../.."] {
            let err = guard.resolve(attempt).unwrap_err();
            assert!(
                matches!(err, GuardError::PathEscape { .. }),
                "{attempt} should escape, got {err:?}"
            );
        }
    }

    #[test]
    fn test_root_itself_requires_opt_in() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        assert!(matches!(
            guard.resolve(".").unwrap_err(),
            GuardError::PathEscape { .. }
        ));

        let guard = guard.with_allow_root(true);
        assert!(guard.resolve(".").unwrap().is_root());
    }

    #[test]
    fn test_empty_and_nul_rejected() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        assert!(matches!(
            guard.resolve("").unwrap_err(),
            GuardError::InvalidPath { .. }
        ));
        assert!(matches!(
            guard.resolve("a\0b").unwrap_err(),
            GuardError::InvalidPath { .. }
        ));
    }

    #[test]
    fn test_url_encoded_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        let err = guard.resolve("%2e%2e/etc/passwd").unwrap_err();
        assert!(matches!(err, GuardError::InvalidPath { .. }));
        assert!(guard.resolve("%2E%2E%2Fetc").is_err());
    }

    #[test]
    fn test_absolute_path_outside_root_rejected() {
        let temp = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        let err = guard
            .resolve(other.path().to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, GuardError::PathEscape { .. }));
    }

    #[test]
    fn test_absolute_path_inside_root_accepted() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        let inside = guard.root().path().join("src/main.rs");
        let guarded = guard.resolve(inside.to_str().unwrap()).unwrap();
        assert_eq!(guarded.as_path(), inside);
    }

    #[cfg(unix)]
    #[test]
    fn test_intermediate_symlink_escape_blocked() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        let guard = guard_for(&temp);
        let err = guard.resolve("escape/anything.txt").unwrap_err();
        assert!(matches!(err, GuardError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_escape_blocked() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("not-yet-created.txt");
        std::os::unix::fs::symlink(&target, temp.path().join("dangling")).unwrap();

        let guard = guard_for(&temp);
        assert!(matches!(
            guard.resolve("dangling").unwrap_err(),
            GuardError::PathEscape { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_within_root_followed() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", temp.path().join("alias")).unwrap();

        let guard = guard_for(&temp);
        let guarded = guard.resolve("alias/file.txt").unwrap();
        assert_eq!(guarded.relative(), Path::new("real/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_parent_after_symlink_uses_link_target() {
        // `link/..` is the parent of the link's target, not the link's directory.
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::create_dir(outside.path().join("deep")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("deep"), temp.path().join("hop")).unwrap();

        let guard = guard_for(&temp);
        assert!(guard.resolve("hop/../x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_revalidate_detects_planted_symlink() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let guard = guard_for(&temp);

        let guarded = guard.resolve("later/file.txt").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("later")).unwrap();

        assert!(matches!(
            guard.revalidate(&guarded).unwrap_err(),
            GuardError::PathEscape { .. }
        ));
    }

    #[test]
    fn test_parent_of_guarded_path() {
        let temp = TempDir::new().unwrap();
        let guard = guard_for(&temp);
        let guarded = guard.resolve("a/b.txt").unwrap();
        let parent = guarded.parent().unwrap();
        assert_eq!(parent.relative(), Path::new("a"));
        assert!(parent.parent().unwrap().is_root());
    }

    #[test]
    fn test_root_rejects_filesystem_root() {
        assert!(Root::new("/").is_err());
        assert!(Root::new("").is_err());
    }

    #[test]
    fn test_normalize_path_lexically() {
        assert_eq!(
            normalize_path_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(
            normalize_path_lexically(Path::new("/a/../..")),
            PathBuf::from("/")
        );
    }

    #[test]
    fn test_file_extension_guard() {
        assert!(guard_file_extension(Path::new("script.py"), Some(&["py", "txt"]), None).is_ok());
        assert!(guard_file_extension(Path::new("file.txt"), Some(&[".txt"]), None).is_ok());
        assert!(guard_file_extension(Path::new("evil.exe"), None, None).is_err());
        assert!(guard_file_extension(Path::new("EVIL.EXE"), None, None).is_err());
        assert!(
            guard_file_extension(Path::new("config.yaml"), None, Some(&["yaml", "yml"])).is_err()
        );
        assert!(guard_file_extension(Path::new("notes.md"), Some(&["py"]), None).is_err());
    }
}
