//! Interrupt-safe scratch state.
//!
//! Every operation that creates temporary on-disk state holds a [`ScratchGuard`]. The guard
//! removes its path when dropped (normal return, `?` early return, panic unwinding) and is
//! also listed in a process-wide registry that the SIGINT/SIGTERM handler drains before the
//! process exits with status 130. Combined with rename-on-success this keeps canonical paths
//! either absent or complete.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, OnceLock};

use crate::error::{Error, Result};

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Default)]
struct Registry {
    scratch: BTreeMap<u64, PathBuf>,
    child_pgroups: BTreeSet<u32>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::default()));
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the SIGINT/SIGTERM handler once per process.
pub fn install() -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
        cleanup_all();
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .map_err(|e| Error::msg(format!("failed to install signal handler: {e}")))?;
    let _ = INSTALLED.set(());
    Ok(())
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Removes every registered scratch path and terminates registered child process groups.
pub fn cleanup_all() {
    drain(&REGISTRY);
}

fn drain(reg: &Mutex<Registry>) {
    let (paths, pgroups) = match reg.lock() {
        Ok(mut g) => (
            std::mem::take(&mut g.scratch),
            std::mem::take(&mut g.child_pgroups),
        ),
        Err(_) => return,
    };
    for pgid in pgroups {
        kill_pgroup(pgid);
    }
    for (_, p) in paths {
        remove_any(&p);
    }
}

pub(crate) fn register_child_pgroup(pgid: u32) {
    if let Ok(mut g) = REGISTRY.lock() {
        g.child_pgroups.insert(pgid);
    }
}

pub(crate) fn unregister_child_pgroup(pgid: u32) {
    if let Ok(mut g) = REGISTRY.lock() {
        g.child_pgroups.remove(&pgid);
    }
}

pub(crate) fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGTERM) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

fn remove_any(p: &Path) {
    match fs::symlink_metadata(p) {
        Ok(m) if m.is_dir() => {
            let _ = fs::remove_dir_all(p);
        }
        Ok(_) => {
            let _ = fs::remove_file(p);
        }
        Err(_) => {}
    }
}

/// A temporary file or directory that is deleted unless [`ScratchGuard::disarm`] is called.
#[derive(Debug)]
pub struct ScratchGuard {
    id: u64,
    path: PathBuf,
    armed: bool,
}

impl ScratchGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut g) = REGISTRY.lock() {
            g.scratch.insert(id, path.clone());
        }
        Self {
            id,
            path,
            armed: true,
        }
    }

    /// Creates a fresh directory next to `anchor` named `.<anchor-name>.<tag>.<pid>.<n>`.
    pub fn sibling_dir(anchor: &Path, tag: &str) -> Result<Self> {
        let path = scratch_sibling(anchor, tag)?;
        let guard = Self::new(&path);
        fs::create_dir_all(&path)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))?;
        Ok(guard)
    }

    /// Reserves (but does not create) a file path next to `anchor`.
    pub fn sibling_file(anchor: &Path, tag: &str) -> Result<Self> {
        Ok(Self::new(scratch_sibling(anchor, tag)?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the path; used once its contents have been renamed into place.
    pub fn disarm(mut self) -> PathBuf {
        self.armed = false;
        self.unregister();
        std::mem::take(&mut self.path)
    }

    fn unregister(&self) {
        if let Ok(mut g) = REGISTRY.lock() {
            g.scratch.remove(&self.id);
        }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.unregister();
        if self.armed {
            remove_any(&self.path);
        }
    }
}

fn scratch_sibling(anchor: &Path, tag: &str) -> Result<PathBuf> {
    let parent = anchor
        .parent()
        .ok_or_else(|| Error::msg(format!("no parent directory for {}", anchor.display())))?;
    let name = anchor
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::msg(format!("invalid path {}", anchor.display())))?;
    let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(".{name}.{tag}.{}.{n}", std::process::id())))
}

/// Moves `src` onto `dst` with a single rename; `dst` must live on the same filesystem.
pub fn commit_rename(src: &Path, dst: &Path) -> Result<()> {
    fs::rename(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_on_drop_and_disarm_keeps() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let anchor = tmp.path().join("gcc-13.2.0");

        let dropped = {
            let g = ScratchGuard::sibling_dir(&anchor, "unpack").expect("guard");
            fs::write(g.path().join("partial"), b"x").expect("write");
            g.path().to_path_buf()
        };
        assert!(!dropped.exists());

        let g = ScratchGuard::sibling_dir(&anchor, "unpack").expect("guard");
        let kept = g.disarm();
        assert!(kept.is_dir());
    }

    #[test]
    fn drain_removes_files_and_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join(".foo.tar.gz.part.1.1");
        let dir = tmp.path().join(".gcc.unpack.1.2");
        fs::write(&file, b"half a download").expect("write");
        fs::create_dir_all(dir.join("gcc-13.2.0")).expect("dir");

        let reg = Mutex::new(Registry::default());
        {
            let mut g = reg.lock().expect("lock");
            g.scratch.insert(1, file.clone());
            g.scratch.insert(2, dir.clone());
        }
        drain(&reg);

        assert!(!file.exists());
        assert!(!dir.exists());
        assert!(reg.lock().expect("lock").scratch.is_empty());
    }

    #[test]
    fn scratch_names_are_hidden_siblings() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let g = ScratchGuard::sibling_file(&tmp.path().join("musl-1.2.4.tar.gz"), "part")
            .expect("guard");
        let name = g.path().file_name().and_then(|s| s.to_str()).expect("name");
        assert!(name.starts_with(".musl-1.2.4.tar.gz.part."), "{name}");
        assert_eq!(g.path().parent(), Some(tmp.path()));
    }
}
