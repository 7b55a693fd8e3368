use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::interrupt::{self, ScratchGuard};

const MARKER_PREFIX: &str = ".done-";

/// (package, version, sub-step), e.g. `gcc-13.2.0-bootstrap`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageKey {
    pub package: String,
    pub version: String,
    pub step: String,
}

impl StageKey {
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        step: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            package: package.into(),
            version: version.into(),
            step: step.into(),
        };
        for (field, value) in [
            ("package", &key.package),
            ("version", &key.version),
            ("step", &key.step),
        ] {
            check_component(field, value)?;
        }
        Ok(key)
    }

    pub fn from_config(cfg: &StageConfig) -> Result<Self> {
        Self::new(cfg.package.trim(), cfg.version.trim(), cfg.step.trim())
    }

    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.package, self.version, self.step)
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.package, self.version, self.step)
    }
}

pub(crate) fn check_component(field: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'));
    if !ok {
        return Err(Error::config(format!(
            "invalid stage {field} '{value}' (allowed: a-zA-Z0-9 . _ - +)"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Done,
    /// The first `done` of `total` phases have markers.
    Partial {
        done: usize,
        total: usize,
    },
    Pending,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Done => f.write_str("done"),
            StageState::Partial { done, total } => write!(f, "partial ({done}/{total} phases)"),
            StageState::Pending => f.write_str("pending"),
        }
    }
}

/// On-disk directories of one stage below the build dir.
#[derive(Debug, Clone)]
pub struct StageLayout {
    pub dir: PathBuf,
    /// Working tree (unpacked + patched source).
    pub src: PathBuf,
    /// Out-of-tree build directory.
    pub build: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StageTracker {
    build_dir: PathBuf,
}

impl StageTracker {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
        }
    }

    pub fn layout(&self, key: &StageKey) -> StageLayout {
        let dir = self.build_dir.join(key.id());
        StageLayout {
            src: dir.join("src"),
            build: dir.join("build"),
            dir,
        }
    }

    pub fn marker_path(&self, key: &StageKey, phase: &str) -> PathBuf {
        self.layout(key).dir.join(format!("{MARKER_PREFIX}{phase}"))
    }

    pub fn is_phase_done(&self, key: &StageKey, phase: &str) -> bool {
        self.marker_path(key, phase).is_file()
    }

    /// Phases complete in order; a marker after the first missing one does not count.
    pub fn state(&self, key: &StageKey, phases: &[String]) -> StageState {
        let done = phases
            .iter()
            .take_while(|p| self.is_phase_done(key, p))
            .count();
        if done == phases.len() {
            StageState::Done
        } else if done == 0 {
            StageState::Pending
        } else {
            StageState::Partial {
                done,
                total: phases.len(),
            }
        }
    }

    pub fn mark_done(&self, key: &StageKey, phase: &str) -> Result<()> {
        let path = self.marker_path(key, phase);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let tmp = ScratchGuard::sibling_file(&path, "tmp")?;
        fs::write(
            tmp.path(),
            format!(
                "stage={}\nphase={phase}\ncompleted_at={}\n",
                key.id(),
                chrono::Utc::now().to_rfc3339()
            ),
        )
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", tmp.path().display())))?;
        interrupt::commit_rename(tmp.path(), &path)?;
        tmp.disarm();
        Ok(())
    }

    /// Removes the working tree, build directory and every marker so the stage starts fresh.
    pub fn reset(&self, key: &StageKey) -> Result<()> {
        let layout = self.layout(key);
        for dir in [&layout.src, &layout.build] {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dir.display())))?;
            }
        }
        remove_markers(&layout.dir)
    }
}

fn remove_markers(dir: &Path) -> Result<()> {
    let Ok(rd) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in rd.flatten() {
        if entry.file_name().to_string_lossy().starts_with(MARKER_PREFIX) {
            fs::remove_file(entry.path()).map_err(|e| {
                Error::msg(format!("failed to remove {}: {e}", entry.path().display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phases(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn phases_form_a_sub_state_machine() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tracker = StageTracker::new(tmp.path());
        let key = StageKey::new("gcc", "13.2.0", "final").expect("key");
        let ph = phases(&["compiler", "libgcc"]);

        assert_eq!(tracker.state(&key, &ph), StageState::Pending);
        tracker.mark_done(&key, "compiler").expect("mark");
        assert_eq!(
            tracker.state(&key, &ph),
            StageState::Partial { done: 1, total: 2 }
        );
        tracker.mark_done(&key, "libgcc").expect("mark");
        assert_eq!(tracker.state(&key, &ph), StageState::Done);
        assert_eq!(tracker.state(&key, &ph).to_string(), "done");
    }

    #[test]
    fn out_of_order_marker_does_not_count() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tracker = StageTracker::new(tmp.path());
        let key = StageKey::new("gcc", "13.2.0", "final").expect("key");
        tracker.mark_done(&key, "libgcc").expect("mark");
        assert_eq!(
            tracker.state(&key, &phases(&["compiler", "libgcc"])),
            StageState::Pending
        );
    }

    #[test]
    fn reset_clears_tree_and_markers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tracker = StageTracker::new(tmp.path());
        let key = StageKey::new("musl", "1.2.4", "build").expect("key");
        let layout = tracker.layout(&key);
        fs::create_dir_all(layout.src.join("src")).expect("src");
        fs::create_dir_all(&layout.build).expect("build");
        tracker.mark_done(&key, "build").expect("mark");

        tracker.reset(&key).expect("reset");
        assert!(!layout.src.exists());
        assert!(!layout.build.exists());
        assert!(!tracker.is_phase_done(&key, "build"));
        assert!(layout.dir.exists());
    }

    #[test]
    fn keys_reject_path_characters() {
        assert!(StageKey::new("gcc", "13.2.0", "bootstrap").is_ok());
        assert!(StageKey::new("../gcc", "1", "build").is_err());
        assert!(StageKey::new("gcc", "", "build").is_err());
        assert_eq!(
            StageKey::new("linux-headers", "6.6", "install")
                .expect("key")
                .id(),
            "linux-headers-6.6-install"
        );
    }
}
