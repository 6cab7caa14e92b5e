//! # Safe Filesystem Operations
//!
//! Crash-safe writes and directory creation beneath a single scaffold root.
//!
//! Every operation takes a [`GuardedPath`] and re-runs validation against the
//! filesystem immediately before acting, so a symlink planted after the path
//! was first validated is still caught.
//!
//! ## Atomic writes
//!
//! Content is written to a temporary file in the destination's own directory,
//! synced, then renamed over the destination. The destination is therefore
//! either untouched or fully replaced. A temporary file that is never
//! renamed is removed when its handle drops, on every exit path.
//!
//! Blocking filesystem work runs on tokio's blocking pool. If the caller
//! abandons the future, the blocking write still runs to completion or
//! failure and cleans up after itself.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::error::{GuardError, GuardResult};
use crate::events::{self, EventSink, GuardEvent};
use crate::path_guard::{GuardedPath, PathGuard};

/// Mode applied to written files when the intent does not specify one.
#[cfg(unix)]
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Bytes of the destination name kept in a temporary file's name. The rest
/// of the name (dots, random part, suffix) must still fit in `NAME_MAX`.
const TEMP_NAME_STEM_MAX: usize = 200;

/// A single atomic write request. Consumed by [`SafeFileSystem::write_atomic`].
#[derive(Debug, Clone)]
pub struct AtomicWriteIntent {
    pub destination: GuardedPath,
    pub content: Vec<u8>,
    /// Unix permission bits for the written file.
    pub mode: Option<u32>,
    /// Fail with [`GuardError::AlreadyExists`] instead of replacing.
    pub exclusive: bool,
}

impl AtomicWriteIntent {
    pub fn new(destination: GuardedPath, content: impl Into<Vec<u8>>) -> Self {
        Self {
            destination,
            content: content.into(),
            mode: None,
            exclusive: false,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Per-item outcome of [`SafeFileSystem::materialize`].
#[derive(Debug)]
pub struct MaterializeOutcome {
    pub requested: String,
    pub result: GuardResult<GuardedPath>,
}

impl MaterializeOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Filesystem operations confined to a [`PathGuard`]'s root.
#[derive(Clone)]
pub struct SafeFileSystem {
    guard: PathGuard,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SafeFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeFileSystem")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl SafeFileSystem {
    pub fn new(guard: PathGuard) -> Self {
        Self {
            guard,
            sink: events::tracing_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Write `intent.content` to `intent.destination` atomically.
    ///
    /// Missing parent directories are created. Fails with
    /// [`GuardError::PathEscape`] if the destination no longer resolves
    /// inside the root, [`GuardError::AlreadyExists`] for an exclusive write
    /// to an existing file, and [`GuardError::IoFailure`] otherwise.
    pub async fn write_atomic(&self, intent: AtomicWriteIntent) -> GuardResult<()> {
        let guard = self.guard.clone();
        let destination = intent.destination.as_path().to_path_buf();
        blocking(&destination, move || {
            stage_write(&guard, &intent)?.commit(&guard)
        })
        .await
    }

    /// Create `dir` and any missing ancestors below the root.
    ///
    /// Existing directories are fine. A file anywhere along the way is a
    /// [`GuardError::PathConflict`]. `mode` applies to newly created
    /// directories only.
    pub async fn ensure_dir(
        &self,
        dir: &GuardedPath,
        mode: Option<u32>,
    ) -> GuardResult<GuardedPath> {
        let guard = self.guard.clone();
        let dir = dir.clone();
        let path = dir.as_path().to_path_buf();
        blocking(&path, move || ensure_dir_blocking(&guard, &dir, mode)).await
    }

    /// Read a regular file of at most `max_bytes`.
    pub async fn read(&self, path: &GuardedPath, max_bytes: u64) -> GuardResult<Vec<u8>> {
        let guard = self.guard.clone();
        let path = path.clone();
        let location = path.as_path().to_path_buf();
        blocking(&location, move || read_blocking(&guard, &path, max_bytes)).await
    }

    /// Remove a regular file. Returns whether a file was removed.
    ///
    /// With `missing_ok`, a missing file is `Ok(false)` instead of an error.
    /// Directories are refused with [`GuardError::PathConflict`].
    pub async fn remove(&self, path: &GuardedPath, missing_ok: bool) -> GuardResult<bool> {
        let guard = self.guard.clone();
        let path = path.clone();
        let location = path.as_path().to_path_buf();
        blocking(&location, move || remove_blocking(&guard, &path, missing_ok)).await
    }

    /// Resolve and write each `(relative path, content)` pair.
    ///
    /// Items are processed in order and independently: a failure is recorded
    /// in that item's outcome and the batch continues.
    pub async fn materialize<P, C>(&self, items: &[(P, C)]) -> Vec<MaterializeOutcome>
    where
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        for (requested, content) in items {
            let requested = requested.as_ref();
            let result = match self.guard.resolve(requested) {
                Ok(destination) => {
                    let intent = AtomicWriteIntent::new(destination.clone(), content.as_ref());
                    self.write_atomic(intent).await.map(|()| destination)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                if let Some(event) = GuardEvent::rejection(e) {
                    events::report(self.sink.as_ref(), event).await;
                } else {
                    tracing::warn!(requested, error = %e, "failed to materialize file");
                }
            }
            outcomes.push(MaterializeOutcome {
                requested: requested.to_string(),
                result,
            });
        }
        outcomes
    }
}

async fn blocking<T, F>(path: &Path, f: F) -> GuardResult<T>
where
    F: FnOnce() -> GuardResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GuardError::io(path, io::Error::other(e)))?
}

/// A temporary file holding the full content, not yet renamed into place.
///
/// Dropping it without [`StagedWrite::commit`] removes the temporary file and
/// leaves the destination untouched.
pub(crate) struct StagedWrite {
    temp: NamedTempFile,
    destination: GuardedPath,
    parent: GuardedPath,
    exclusive: bool,
}

impl StagedWrite {
    pub(crate) fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub(crate) fn commit(self, guard: &PathGuard) -> GuardResult<()> {
        // The destination may have been swapped for a symlink while staging.
        let destination = guard.revalidate(&self.destination)?;
        let target = destination.as_path();

        if self.exclusive {
            self.temp.persist_noclobber(target).map_err(|e| {
                if e.error.kind() == io::ErrorKind::AlreadyExists {
                    GuardError::AlreadyExists {
                        path: target.to_path_buf(),
                    }
                } else {
                    GuardError::io(target, e.error)
                }
            })?;
        } else {
            self.temp
                .persist(target)
                .map_err(|e| GuardError::io(target, e.error))?;
        }

        sync_dir(self.parent.as_path());
        tracing::debug!(path = %target.display(), "atomic write committed");
        Ok(())
    }
}

pub(crate) fn stage_write(
    guard: &PathGuard,
    intent: &AtomicWriteIntent,
) -> GuardResult<StagedWrite> {
    let destination = guard.revalidate(&intent.destination)?;
    let parent = destination.parent().ok_or_else(|| GuardError::PathConflict {
        path: destination.as_path().to_path_buf(),
        reason: "destination has no parent directory".to_string(),
    })?;
    let parent = ensure_dir_blocking(guard, &parent, None)?;

    let target = destination.as_path();
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {
            return Err(GuardError::PathConflict {
                path: target.to_path_buf(),
                reason: "destination is a directory".to_string(),
            });
        }
        Ok(_) if intent.exclusive => {
            return Err(GuardError::AlreadyExists {
                path: target.to_path_buf(),
            });
        }
        _ => {}
    }

    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!(".{}.", truncate_on_char_boundary(&name, TEMP_NAME_STEM_MAX));
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent.as_path())
        .map_err(|e| GuardError::io(parent.as_path(), e))?;

    let temp_path = temp.path().to_path_buf();
    let io_err = |e| GuardError::io(&temp_path, e);
    temp.write_all(&intent.content).map_err(io_err)?;
    temp.flush().map_err(io_err)?;
    set_file_mode(temp.as_file(), intent.mode).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;

    Ok(StagedWrite {
        temp,
        destination,
        parent,
        exclusive: intent.exclusive,
    })
}

/// Longest slice of `s` that fits in `max` bytes without splitting a char.
fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(unix)]
fn set_file_mode(file: &File, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode.unwrap_or(DEFAULT_FILE_MODE)))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &File, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Persist the rename itself. Best effort: not every platform can open a
/// directory for syncing.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), "directory sync failed: {e}");
    }
    #[cfg(not(unix))]
    let _ = dir;
}

fn ensure_dir_blocking(
    guard: &PathGuard,
    dir: &GuardedPath,
    mode: Option<u32>,
) -> GuardResult<GuardedPath> {
    if dir.is_root() {
        return Ok(dir.clone());
    }
    let dir = guard.revalidate(dir)?;
    let mut current = dir.root().to_path_buf();

    for component in dir.relative().components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() && current.is_dir() => {}
            Ok(_) => {
                return Err(GuardError::PathConflict {
                    path: current,
                    reason: "an existing file is in the way".to_string(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::create_dir(&current) {
                Ok(()) => {
                    if let Some(mode) = mode {
                        set_dir_mode(&current, mode).map_err(|e| GuardError::io(&current, e))?;
                    }
                    tracing::debug!(dir = %current.display(), "created directory");
                }
                // Lost a race with a concurrent creator.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && current.is_dir() => {}
                Err(e) => return Err(GuardError::io(&current, e)),
            },
            Err(e) => return Err(GuardError::io(&current, e)),
        }
    }

    guard.revalidate(&dir)
}

fn read_blocking(guard: &PathGuard, path: &GuardedPath, max_bytes: u64) -> GuardResult<Vec<u8>> {
    let path = guard.revalidate(path)?;
    let location = path.as_path();
    let file = File::open(location).map_err(|e| GuardError::io(location, e))?;
    let meta = file.metadata().map_err(|e| GuardError::io(location, e))?;
    if !meta.is_file() {
        return Err(GuardError::PathConflict {
            path: location.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }

    let too_large = || {
        GuardError::io(
            location,
            io::Error::new(
                io::ErrorKind::FileTooLarge,
                format!("file exceeds the {max_bytes} byte read limit"),
            ),
        )
    };
    if meta.len() > max_bytes {
        return Err(too_large());
    }

    let mut buf = Vec::with_capacity(meta.len() as usize);
    file.take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| GuardError::io(location, e))?;
    // The file may have grown since the size check.
    if buf.len() as u64 > max_bytes {
        return Err(too_large());
    }
    Ok(buf)
}

fn remove_blocking(guard: &PathGuard, path: &GuardedPath, missing_ok: bool) -> GuardResult<bool> {
    let path = guard.revalidate(path)?;
    let location = path.as_path();
    match fs::symlink_metadata(location) {
        Ok(meta) if meta.is_dir() => Err(GuardError::PathConflict {
            path: location.to_path_buf(),
            reason: "refusing to remove a directory".to_string(),
        }),
        Ok(_) => fs::remove_file(location)
            .map(|()| true)
            .map_err(|e| GuardError::io(location, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound && missing_ok => Ok(false),
        Err(e) => Err(GuardError::io(location, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_guard::Root;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SafeFileSystem) {
        let temp = TempDir::new().unwrap();
        let guard = PathGuard::new(Root::new(temp.path()).unwrap());
        (temp, SafeFileSystem::new(guard))
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_leaves_no_temp() {
        let (temp, sfs) = setup();
        let dest = sfs.guard().resolve("config/app.toml").unwrap();
        sfs.write_atomic(AtomicWriteIntent::new(dest.clone(), "x=1"))
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(dest.as_path()).unwrap(), "x=1");
        assert_eq!(entries(&temp.path().join("config")), ["app.toml"]);
    }

    #[tokio::test]
    async fn test_write_long_file_names() {
        let (temp, sfs) = setup();
        for name in ["a".repeat(250), "é".repeat(125)] {
            fs::write(temp.path().join(&name), "direct").unwrap();

            let dest = sfs.guard().resolve(&name).unwrap();
            sfs.write_atomic(AtomicWriteIntent::new(dest.clone(), "atomic"))
                .await
                .unwrap();
            assert_eq!(fs::read_to_string(dest.as_path()).unwrap(), "atomic");
        }
        assert_eq!(entries(temp.path()).len(), 2);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_on_char_boundary("short", 200), "short");
        assert_eq!(truncate_on_char_boundary("abcdef", 4), "abcd");
        // 'é' is two bytes; never cut one in half.
        assert_eq!(truncate_on_char_boundary("éé", 3), "é");
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let (temp, sfs) = setup();
        let dest = sfs.guard().resolve("README.md").unwrap();
        for _ in 0..2 {
            sfs.write_atomic(AtomicWriteIntent::new(dest.clone(), "# demo\n"))
                .await
                .unwrap();
        }
        assert_eq!(fs::read_to_string(dest.as_path()).unwrap(), "# demo\n");
        assert_eq!(entries(temp.path()), ["README.md"]);
    }

    #[tokio::test]
    async fn test_exclusive_write_refuses_existing() {
        let (_temp, sfs) = setup();
        let dest = sfs.guard().resolve("pyproject.toml").unwrap();
        sfs.write_atomic(AtomicWriteIntent::new(dest.clone(), "old"))
            .await
            .unwrap();

        let err = sfs
            .write_atomic(AtomicWriteIntent::new(dest.clone(), "new").exclusive())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::AlreadyExists { .. }));
        assert_eq!(fs::read_to_string(dest.as_path()).unwrap(), "old");
    }

    #[test]
    fn test_interrupted_write_leaves_previous_content() {
        let (temp, sfs) = setup();
        let guard = sfs.guard();
        let dest = guard.resolve("src/main.py").unwrap();
        stage_write(guard, &AtomicWriteIntent::new(dest.clone(), "print('v1')"))
            .unwrap()
            .commit(guard)
            .unwrap();

        let staged =
            stage_write(guard, &AtomicWriteIntent::new(dest.clone(), "print('v2')")).unwrap();
        let temp_path = staged.temp_path().to_path_buf();
        assert!(temp_path.exists());
        assert_eq!(temp_path.parent(), dest.as_path().parent());
        drop(staged);

        assert!(!temp_path.exists());
        assert_eq!(fs::read_to_string(dest.as_path()).unwrap(), "print('v1')");
        assert_eq!(entries(&temp.path().join("src")), ["main.py"]);
    }

    #[test]
    fn test_interrupted_first_write_leaves_nothing() {
        let (temp, sfs) = setup();
        let guard = sfs.guard();
        let dest = guard.resolve("new.txt").unwrap();
        drop(stage_write(guard, &AtomicWriteIntent::new(dest.clone(), "partial")).unwrap());
        assert!(!dest.as_path().exists());
        assert!(entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_write_onto_directory_conflicts() {
        let (temp, sfs) = setup();
        fs::create_dir(temp.path().join("docs")).unwrap();
        let dest = sfs.guard().resolve("docs").unwrap();
        let err = sfs
            .write_atomic(AtomicWriteIntent::new(dest, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::PathConflict { .. }));
    }

    #[tokio::test]
    async fn test_ensure_dir_idempotent() {
        let (temp, sfs) = setup();
        let dir = sfs.guard().resolve("a/b/c").unwrap();
        sfs.ensure_dir(&dir, None).await.unwrap();
        sfs.ensure_dir(&dir, None).await.unwrap();
        assert!(temp.path().join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn test_ensure_dir_through_file_conflicts() {
        let (temp, sfs) = setup();
        fs::write(temp.path().join("a"), "file").unwrap();
        let dir = sfs.guard().resolve("a/b").unwrap();
        let err = sfs.ensure_dir(&dir, None).await.unwrap_err();
        match err {
            GuardError::PathConflict { path, .. } => assert!(path.ends_with("a")),
            other => panic!("expected PathConflict, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_modes_applied() {
        use std::os::unix::fs::PermissionsExt;
        let (_temp, sfs) = setup();

        let dir = sfs.guard().resolve("private").unwrap();
        sfs.ensure_dir(&dir, Some(0o700)).await.unwrap();
        let dir_mode = fs::metadata(dir.as_path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let script = sfs.guard().resolve("private/run.py").unwrap();
        sfs.write_atomic(AtomicWriteIntent::new(script.clone(), "").mode(0o755))
            .await
            .unwrap();
        let file_mode = fs::metadata(script.as_path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o755);

        let plain = sfs.guard().resolve("plain.txt").unwrap();
        sfs.write_atomic(AtomicWriteIntent::new(plain.clone(), "x"))
            .await
            .unwrap();
        let plain_mode = fs::metadata(plain.as_path()).unwrap().permissions().mode();
        assert_eq!(plain_mode & 0o777, DEFAULT_FILE_MODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_refuses_symlink_planted_after_validation() {
        let (temp, sfs) = setup();
        let outside = TempDir::new().unwrap();
        let dest = sfs.guard().resolve("out/file.txt").unwrap();

        std::os::unix::fs::symlink(outside.path(), temp.path().join("out")).unwrap();
        let err = sfs
            .write_atomic(AtomicWriteIntent::new(dest, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::PathEscape { .. }));
        assert!(entries(outside.path()).is_empty());
    }

    #[tokio::test]
    async fn test_read_limits() {
        let (temp, sfs) = setup();
        fs::write(temp.path().join("small.txt"), "hello").unwrap();
        let small = sfs.guard().resolve("small.txt").unwrap();
        assert_eq!(sfs.read(&small, 5).await.unwrap(), b"hello");

        let err = sfs.read(&small, 4).await.unwrap_err();
        match err {
            GuardError::IoFailure { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::FileTooLarge)
            }
            other => panic!("expected IoFailure, got {other:?}"),
        }

        fs::create_dir(temp.path().join("dir")).unwrap();
        let dir = sfs.guard().resolve("dir").unwrap();
        assert!(matches!(
            sfs.read(&dir, 1024).await.unwrap_err(),
            GuardError::PathConflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let (temp, sfs) = setup();
        fs::write(temp.path().join("old.txt"), "x").unwrap();
        let old = sfs.guard().resolve("old.txt").unwrap();

        assert!(sfs.remove(&old, false).await.unwrap());
        assert!(!sfs.remove(&old, true).await.unwrap());
        assert!(matches!(
            sfs.remove(&old, false).await.unwrap_err(),
            GuardError::IoFailure { .. }
        ));

        fs::create_dir(temp.path().join("keep")).unwrap();
        let keep = sfs.guard().resolve("keep").unwrap();
        assert!(matches!(
            sfs.remove(&keep, false).await.unwrap_err(),
            GuardError::PathConflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_materialize_reports_per_item() {
        let (temp, sfs) = setup();
        let (sink, mut rx) = events::channel_sink();
        let sfs = sfs.with_event_sink(sink);

        let outcomes = sfs
            .materialize(&[
                ("src/app/__init__.py", "".as_bytes()),
                ("../../etc/passwd", b"root".as_slice()),
                ("tests/test_app.py", b"def test(): pass\n".as_slice()),
            ])
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(GuardError::PathEscape { .. })
        ));
        assert!(outcomes[2].is_ok());
        assert!(temp.path().join("tests/test_app.py").is_file());

        match rx.try_recv().unwrap() {
            GuardEvent::PathRejected { requested, .. } => assert_eq!(requested, "../../etc/passwd"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
