//! Build Session: when the first stage of a run really executed, and which revision of the
//! orchestrator checkout drove it.
//!
//! The session is opened lazily and mirrored to a hidden `.build-session` marker at the root of
//! the Staging Tree. An interrupted run leaves the marker behind; the next run recovers the
//! original start time from it. The marker is removed only after provenance has been written
//! and the result published.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::interrupt::{self, ScratchGuard};

pub const SESSION_MARKER: &str = ".build-session";
pub const VERSION_FILE: &str = "VERSION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSession {
    pub started_at: DateTime<Utc>,
    pub revision: Option<String>,
    pub dirty: bool,
    #[serde(skip)]
    pub recovered: bool,
}

pub struct SessionTracker {
    marker: PathBuf,
    source_dir: PathBuf,
    current: Option<BuildSession>,
}

impl SessionTracker {
    pub fn new(prefix: &Path, source_dir: &Path) -> Self {
        Self {
            marker: prefix.join(SESSION_MARKER),
            source_dir: source_dir.to_path_buf(),
            current: None,
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn current(&self) -> Option<&BuildSession> {
        self.current.as_ref()
    }

    /// True once a session was begun in this process or one is left over from an earlier run.
    pub fn is_open(&self) -> bool {
        self.current.is_some() || self.marker.is_file()
    }

    /// Opens the session on first call; later calls return the same session.
    pub fn begin(&mut self) -> Result<&BuildSession> {
        if self.current.is_none() {
            let session = match self.read_marker()? {
                Some(s) => {
                    info!(started_at = %s.started_at, "recovered interrupted build session");
                    s
                }
                None => {
                    let (revision, dirty) = probe_revision(&self.source_dir);
                    let s = BuildSession {
                        started_at: Utc::now(),
                        revision,
                        dirty,
                        recovered: false,
                    };
                    self.write_marker(&s)?;
                    debug!(marker = %self.marker.display(), "build session opened");
                    s
                }
            };
            self.current = Some(session);
        }
        self.current
            .as_ref()
            .ok_or_else(|| Error::msg("build session unavailable"))
    }

    fn read_marker(&self) -> Result<Option<BuildSession>> {
        let raw = match fs::read_to_string(&self.marker) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to read {}: {e}",
                    self.marker.display()
                )));
            }
        };
        let mut s: BuildSession = serde_json::from_str(&raw).map_err(|e| {
            Error::msg(format!(
                "failed to parse build session marker {}: {e}",
                self.marker.display()
            ))
        })?;
        s.recovered = true;
        Ok(Some(s))
    }

    fn write_marker(&self, s: &BuildSession) -> Result<()> {
        let body = serde_json::to_string_pretty(s)
            .map_err(|e| Error::msg(format!("failed to encode build session: {e}")))?;
        write_atomic(&self.marker, &body)
    }

    /// Writes the `VERSION` provenance file at the root of the Staging Tree.
    pub fn finish(&mut self, ctx: &BuildContext, stages: &[String]) -> Result<PathBuf> {
        let session = self.begin()?.clone();
        let finished_at = Utc::now();
        let mut body = String::new();
        body.push_str(&format!("name={}\n", ctx.name));
        body.push_str(&format!("target={}\n", ctx.target));
        body.push_str(&format!("build_started={}\n", session.started_at.to_rfc3339()));
        body.push_str(&format!("build_finished={}\n", finished_at.to_rfc3339()));
        body.push_str(&format!(
            "source_revision={}\n",
            session.revision.as_deref().unwrap_or("unknown")
        ));
        body.push_str(&format!("source_dirty={}\n", session.dirty));
        body.push_str(&format!("stages={}\n", stages.join(",")));

        let path = ctx.prefix().join(VERSION_FILE);
        write_atomic(&path, &body)?;
        info!(path = %path.display(), "wrote provenance");
        Ok(path)
    }

    /// Ends the session for good by removing the marker.
    pub fn close(&mut self) -> Result<()> {
        self.current = None;
        match fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!(
                "failed to remove {}: {e}",
                self.marker.display()
            ))),
        }
    }
}

fn write_atomic(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let tmp = ScratchGuard::sibling_file(path, "tmp")?;
    fs::write(tmp.path(), body)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", tmp.path().display())))?;
    interrupt::commit_rename(tmp.path(), path)?;
    tmp.disarm();
    Ok(())
}

/// HEAD commit and dirty state of `dir`; `(None, false)` when it is not a git checkout.
pub fn probe_revision(dir: &Path) -> (Option<String>, bool) {
    let git = |args: &[&str]| -> Option<String> {
        let out = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    };
    let Some(rev) = git(&["rev-parse", "HEAD"]).filter(|r| !r.is_empty()) else {
        return (None, false);
    };
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    (Some(rev), dirty)
}
