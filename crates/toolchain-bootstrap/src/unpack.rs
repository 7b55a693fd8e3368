use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::archive;
use crate::error::{Error, Result};
use crate::interrupt::{self, ScratchGuard};

/// Extracts `archive` to `target` unless `target` already exists.
///
/// Extraction happens in a hidden sibling directory that is renamed into place, so `target`
/// never appears half-populated. A single top-level directory in the archive is hoisted.
/// Returns whether anything was extracted.
pub fn unpack(archive_path: &Path, target: &Path) -> Result<bool> {
    if target.exists() {
        debug!(target = %target.display(), "working tree present, skipping unpack");
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }

    let scratch = ScratchGuard::sibling_dir(target, "unpack")?;
    archive::extract_into(archive_path, scratch.path())?;

    let mut top: Vec<PathBuf> = fs::read_dir(scratch.path())
        .map_err(|e| Error::extract(archive_path, e.to_string()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    let single_dir = match top.as_slice() {
        [only] => fs::symlink_metadata(only)
            .map(|m| m.is_dir())
            .unwrap_or(false),
        _ => false,
    };

    if single_dir {
        let only = top.remove(0);
        interrupt::commit_rename(&only, target)?;
        // scratch is now empty and removed on drop
    } else {
        interrupt::commit_rename(scratch.path(), target)?;
        scratch.disarm();
    }
    info!(archive = %archive_path.display(), target = %target.display(), "unpacked");
    Ok(true)
}

/// Expands a configured patch list: files are taken as is, directories contribute their
/// `*.patch` / `*.diff` files sorted by name.
pub fn expand_patch_set(entries: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(entry)
                .map_err(|e| Error::patch(entry, format!("failed to read directory: {e}")))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.is_file()
                        && matches!(
                            p.extension().and_then(|s| s.to_str()),
                            Some("patch" | "diff")
                        )
                })
                .collect();
            found.sort();
            out.extend(found);
        } else if entry.is_file() {
            out.push(entry.clone());
        } else {
            return Err(Error::patch(entry, "no such file or directory"));
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct PatchTool {
    program: String,
    strip: u32,
}

impl Default for PatchTool {
    fn default() -> Self {
        Self {
            program: "patch".into(),
            strip: 1,
        }
    }
}

impl PatchTool {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    fn invoke(&self, patch: &Path, target: &Path, reverse: bool, dry_run: bool) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("-p{}", self.strip))
            .arg("--batch")
            .arg("--silent")
            .arg("-d")
            .arg(target)
            .arg("-i")
            .arg(patch);
        if reverse {
            cmd.arg("--reverse");
        } else {
            cmd.arg("--forward");
        }
        if dry_run {
            cmd.arg("--dry-run");
        }
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::patch(patch, format!("failed to run {}: {e}", self.program)))?;
        if out.status.success() {
            return Ok(());
        }
        let mut text = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push_str("; ");
            }
            text.push_str(stderr.trim());
        }
        Err(Error::patch(
            patch,
            format!(
                "{}{} ({}): {text}",
                if reverse { "reverse " } else { "" },
                if dry_run { "dry run failed" } else { "apply failed" },
                out.status
            ),
        ))
    }

    /// Applies `patches` in order, each gated by a dry run.
    ///
    /// The set is all-or-nothing: when one patch fails, the ones already applied are reversed
    /// (last first) so the tree returns to its unpacked state.
    pub fn apply_all(&self, patches: &[PathBuf], target: &Path) -> Result<()> {
        let mut applied: Vec<&Path> = Vec::new();
        for patch in patches {
            let res = self
                .invoke(patch, target, false, true)
                .and_then(|_| self.invoke(patch, target, false, false));
            match res {
                Ok(()) => {
                    debug!(patch = %patch.display(), "applied");
                    applied.push(patch);
                }
                Err(err) => {
                    warn!(patch = %patch.display(), error = %err, "patch failed, rolling back");
                    return Err(self.rollback(&applied, target, err));
                }
            }
        }
        if !patches.is_empty() {
            info!(count = patches.len(), target = %target.display(), "patch set applied");
        }
        Ok(())
    }

    fn rollback(&self, applied: &[&Path], target: &Path, cause: Error) -> Error {
        for (i, patch) in applied.iter().enumerate().rev() {
            let res = self
                .invoke(patch, target, true, true)
                .and_then(|_| self.invoke(patch, target, true, false));
            if let Err(e) = res {
                let still: Vec<String> = applied[..=i]
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                let (patch_path, message) = match cause {
                    Error::Patch { patch, message } => (patch, message),
                    other => (patch.to_path_buf(), other.to_string()),
                };
                return Error::patch(
                    patch_path,
                    format!(
                        "{message}; rollback failed ({e}); still applied: {}",
                        still.join(", ")
                    ),
                );
            }
        }
        cause
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;
    use crate::archive::{ArchiveFormat, TarOptions, collect_tree, write_tar};

    fn have_bin(name: &str) -> bool {
        Command::new(name)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn make_archive(src: &Path, out: &Path, prefix: Option<&str>) {
        let entries = collect_tree(src, &[]).expect("collect");
        let file = File::create(out).expect("create");
        let enc = write_tar(
            &entries,
            ArchiveFormat::TarGz.encoder(file),
            &TarOptions {
                mtime: 0,
                path_prefix: prefix.map(PathBuf::from),
            },
        )
        .expect("tar");
        enc.finish().expect("finish");
    }

    #[test]
    fn single_top_level_dir_is_hoisted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("include")).expect("dirs");
        fs::write(src.join("configure"), "#!/bin/sh\n").expect("configure");
        fs::write(src.join("include/foo.h"), "\n").expect("header");
        let tarball = tmp.path().join("foo-1.0.tar.gz");
        make_archive(&src, &tarball, Some("foo-1.0"));

        let target = tmp.path().join("work/foo");
        assert!(unpack(&tarball, &target).expect("unpack"));
        assert!(target.join("configure").is_file());
        assert!(target.join("include/foo.h").is_file());

        // Second call is a no-op.
        fs::write(target.join("marker"), "x").expect("marker");
        assert!(!unpack(&tarball, &target).expect("unpack again"));
        assert!(target.join("marker").exists());

        let hidden: Vec<_> = fs::read_dir(tmp.path().join("work"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(hidden.is_empty());
    }

    #[test]
    fn flat_archives_move_as_is() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).expect("src");
        fs::write(src.join("a"), "a").expect("a");
        fs::write(src.join("b"), "b").expect("b");
        let tarball = tmp.path().join("flat.tar.gz");
        make_archive(&src, &tarball, None);

        let target = tmp.path().join("flat");
        unpack(&tarball, &target).expect("unpack");
        assert!(target.join("a").is_file());
        assert!(target.join("b").is_file());
    }

    #[test]
    fn corrupt_archive_leaves_no_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tarball = tmp.path().join("bad.tar.gz");
        fs::write(&tarball, b"definitely not gzip").expect("write");
        let target = tmp.path().join("bad");
        assert!(matches!(
            unpack(&tarball, &target),
            Err(Error::Extract { .. })
        ));
        assert!(!target.exists());
        assert_eq!(fs::read_dir(tmp.path()).expect("read_dir").count(), 1);
    }

    #[test]
    fn patch_dirs_expand_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("patches");
        fs::create_dir_all(&dir).expect("dir");
        for name in ["0002-b.patch", "0001-a.diff", "README", "0003-c.patch"] {
            fs::write(dir.join(name), "").expect("write");
        }
        let extra = tmp.path().join("extra.patch");
        fs::write(&extra, "").expect("extra");

        let got = expand_patch_set(&[dir.clone(), extra.clone()]).expect("expand");
        assert_eq!(
            got,
            vec![
                dir.join("0001-a.diff"),
                dir.join("0002-b.patch"),
                dir.join("0003-c.patch"),
                extra
            ]
        );
        assert!(expand_patch_set(&[tmp.path().join("missing")]).is_err());
    }

    const GOOD: &str = "\
--- a/a.txt
+++ b/a.txt
@@ -1,3 +1,3 @@
 one
-two
+TWO
 three
";

    const CONFLICT: &str = "\
--- a/b.txt
+++ b/b.txt
@@ -1,2 +1,2 @@
 alpha
-gamma
+GAMMA
";

    #[test]
    fn failing_patch_rolls_back_the_set() {
        if !have_bin("patch") {
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let tree = tmp.path().join("tree");
        fs::create_dir_all(&tree).expect("tree");
        fs::write(tree.join("a.txt"), "one\ntwo\nthree\n").expect("a");
        fs::write(tree.join("b.txt"), "alpha\nbeta\n").expect("b");
        let p1 = tmp.path().join("0001-good.patch");
        let p2 = tmp.path().join("0002-conflict.patch");
        fs::write(&p1, GOOD).expect("p1");
        fs::write(&p2, CONFLICT).expect("p2");

        let err = PatchTool::default()
            .apply_all(&[p1.clone(), p2.clone()], &tree)
            .unwrap_err();
        match err {
            Error::Patch { patch, .. } => assert_eq!(patch, p2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            fs::read_to_string(tree.join("a.txt")).expect("a"),
            "one\ntwo\nthree\n"
        );
        assert_eq!(
            fs::read_to_string(tree.join("b.txt")).expect("b"),
            "alpha\nbeta\n"
        );

        PatchTool::default()
            .apply_all(&[p1], &tree)
            .expect("good patch applies");
        assert_eq!(
            fs::read_to_string(tree.join("a.txt")).expect("a"),
            "one\nTWO\nthree\n"
        );
    }
}
