use std::fs;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Produces a checkout of `revision` (submodules included) at `dest` and returns the commit
/// time in seconds since the epoch.
pub trait SourceControl: Send + Sync {
    fn checkout(&self, repo: &str, revision: &str, dest: &Path) -> Result<i64>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".into(),
        }
    }
}

impl GitCli {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        if let Some(d) = dir {
            cmd.arg("-C").arg(d);
        }
        cmd.args(args);
        // Never block on a credential prompt.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        debug!(?cmd, "git");
        let out = cmd
            .output()
            .map_err(|e| Error::msg(format!("failed to run {}: {e}", self.program)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::msg(format!(
                "git {} failed ({}): {}",
                args.join(" "),
                out.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl SourceControl for GitCli {
    fn checkout(&self, repo: &str, revision: &str, dest: &Path) -> Result<i64> {
        let dest_s = dest.to_string_lossy();
        self.run(None, &["clone", "--quiet", "--no-checkout", repo, &dest_s])?;
        self.run(Some(dest), &["checkout", "--quiet", "--detach", revision])?;
        self.run(
            Some(dest),
            &["submodule", "update", "--init", "--recursive", "--quiet"],
        )?;
        let ts = self.run(Some(dest), &["log", "-1", "--format=%ct", "HEAD"])?;
        ts.parse::<i64>()
            .map_err(|e| Error::msg(format!("unexpected commit timestamp '{ts}': {e}")))
    }
}

/// Removes `.git` directories and gitlink files (submodules) below `root`.
pub fn strip_vcs_metadata(root: &Path) -> Result<()> {
    let mut victims = Vec::new();
    let mut it = walkdir::WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = it.next() {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if entry.file_name() == ".git" {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            victims.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }
    for (path, is_dir) in victims {
        let res = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        res.map_err(|e| Error::msg(format!("failed to remove {}: {e}", path.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_nested_git_metadata() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join(".git/objects")).expect("git dir");
        fs::create_dir_all(root.join("vendor/sub")).expect("sub");
        fs::write(root.join("vendor/sub/.git"), "gitdir: ../../.git/modules/sub\n").expect("gitlink");
        fs::write(root.join("vendor/sub/lib.c"), "int x;\n").expect("src");
        fs::write(root.join(".gitignore"), "*.o\n").expect("gitignore");

        strip_vcs_metadata(root).expect("strip");
        assert!(!root.join(".git").exists());
        assert!(!root.join("vendor/sub/.git").exists());
        assert!(root.join("vendor/sub/lib.c").exists());
        assert!(root.join(".gitignore").exists());
    }
}
