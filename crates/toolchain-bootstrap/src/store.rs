//! Content Store: a flat directory of immutable artifacts keyed by filename, each with a
//! `<name>.sha256` signature next to it.
//!
//! Nothing becomes visible under a canonical name until it is complete: writers fill a hidden
//! sibling temp file (tracked by a [`ScratchGuard`]) and rename it into place.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::interrupt::{self, ScratchGuard};
use crate::verify::{self, DigestPolicy};

pub const SIGNATURE_EXT: &str = "sha256";

#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    /// A handle on `dir` that does not touch the filesystem.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::msg(format!("failed to create content store {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical location of `name`, whether or not it exists yet.
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.path_of(name).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Result<PathBuf> {
        let p = self.path_of(name)?;
        if p.is_file() {
            Ok(p)
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    pub fn put(&self, name: &str, mut src: impl Read) -> Result<PathBuf> {
        self.put_with(name, |file| {
            io::copy(&mut src, file)
                .map(|_| ())
                .map_err(|e| Error::msg(format!("failed to write {name}: {e}")))
        })
    }

    /// Runs `write` against a fresh temp file in the store and renames it to `name` on success.
    /// An artifact already present under `name` is kept as is.
    pub fn put_with<F>(&self, name: &str, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut File) -> Result<()>,
    {
        let dest = self.path_of(name)?;
        if dest.is_file() {
            debug!(artifact = name, "already in content store");
            return Ok(dest);
        }
        let tmp = ScratchGuard::sibling_file(&dest, "part")?;
        let mut file = File::create(tmp.path())
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", tmp.path().display())))?;
        write(&mut file)?;
        file.flush()
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::msg(format!("failed to flush {}: {e}", tmp.path().display())))?;
        drop(file);
        interrupt::commit_rename(tmp.path(), &dest)?;
        tmp.disarm();
        Ok(dest)
    }

    /// Moves a leftover copy from an earlier partial run into the store.
    ///
    /// The leftover is only trusted when `expected` is given and it verifies; otherwise it is
    /// deleted and `None` is returned so the caller fetches afresh.
    pub fn adopt(
        &self,
        name: &str,
        leftover: &Path,
        expected: Option<&str>,
        policy: DigestPolicy,
    ) -> Result<Option<PathBuf>> {
        if !leftover.is_file() {
            return Ok(None);
        }
        let Some(expected) = expected else {
            info!(path = %leftover.display(), "discarding unverifiable leftover download");
            remove_file_if_exists(leftover)?;
            return Ok(None);
        };
        if let Err(e) = verify::verify(leftover, Some(expected), policy) {
            warn!(path = %leftover.display(), error = %e, "leftover download rejected");
            remove_file_if_exists(leftover)?;
            return Ok(None);
        }

        let dest = self.path_of(name)?;
        if dest.is_file() {
            remove_file_if_exists(leftover)?;
            return Ok(Some(dest));
        }
        if fs::rename(leftover, &dest).is_err() {
            // Different filesystem: copy through a temp file instead.
            let src = File::open(leftover)
                .map_err(|e| Error::msg(format!("failed to open {}: {e}", leftover.display())))?;
            self.put(name, src)?;
            remove_file_if_exists(leftover)?;
        }
        info!(artifact = name, "adopted leftover download");
        Ok(Some(dest))
    }

    /// Artifact filenames in sorted order, excluding signatures and temp files.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let rd = fs::read_dir(&self.dir)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", self.dir.display())))?;
        for entry in rd.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(&format!(".{SIGNATURE_EXT}")) {
                continue;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(Error::msg(format!("invalid artifact name '{name}'")));
    }
    Ok(())
}

fn remove_file_if_exists(p: &Path) -> Result<()> {
    match fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", p.display()))),
    }
}

pub fn signature_path(artifact: &Path) -> PathBuf {
    let mut s = artifact.as_os_str().to_os_string();
    s.push(".");
    s.push(SIGNATURE_EXT);
    PathBuf::from(s)
}

/// Reads the digest recorded for `artifact`, if any.
pub fn read_signature(artifact: &Path) -> Result<Option<String>> {
    let p = signature_path(artifact);
    let raw = match fs::read_to_string(&p) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::msg(format!("failed to read {}: {e}", p.display()))),
    };
    let first = raw.split_whitespace().next().unwrap_or_default();
    let digest = verify::normalize_digest(first)
        .map_err(|_| Error::msg(format!("malformed signature file {}", p.display())))?;
    Ok(Some(digest))
}

/// Writes `<digest>  <filename>` next to `artifact`. Returns `false` (and leaves the file alone)
/// when a signature already exists.
pub fn write_signature(artifact: &Path, digest: &str) -> Result<bool> {
    let p = signature_path(artifact);
    if p.exists() {
        return Ok(false);
    }
    let digest = verify::normalize_digest(digest)?;
    let filename = artifact
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::msg(format!("invalid artifact path {}", artifact.display())))?;
    let tmp = ScratchGuard::sibling_file(&p, "tmp")?;
    fs::write(tmp.path(), format!("{digest}  {filename}\n"))
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", tmp.path().display())))?;
    interrupt::commit_rename(tmp.path(), &p)?;
    tmp.disarm();
    Ok(true)
}
