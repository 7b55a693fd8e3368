use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_cache_dir() -> String {
    "cache".into()
}

fn default_build_dir() -> String {
    "build".into()
}

fn default_prefix() -> String {
    "output".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Prefix,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Prefix => "prefix",
            CleanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    #[serde(default)]
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            cache_dir: default_cache_dir(),
            build_dir: default_build_dir(),
            prefix: default_prefix(),
            paths: BTreeMap::new(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    /// Content Store directory.
    pub cache_dir: PathBuf,
    /// Working trees, completion markers and error logs.
    pub build_dir: PathBuf,
    /// Staging Tree.
    pub prefix: PathBuf,
    pub aliases: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    // `@alias/rest` expands from [workspace.paths]; absolute paths pass through;
    // everything else is rooted at the workspace root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        let Some(after_at) = raw.strip_prefix('@') else {
            let pb = PathBuf::from(raw);
            return Ok(if pb.is_absolute() { pb } else { self.root.join(pb) });
        };
        let (alias, rest) = match after_at.split_once('/') {
            Some((a, r)) => (a.trim(), r),
            None => (after_at.trim(), ""),
        };
        let base = self.aliases.get(alias).ok_or_else(|| {
            let known = self.aliases.keys().cloned().collect::<Vec<_>>().join(", ");
            Error::config(format!(
                "unknown workspace path alias '{alias}' in '{raw}' (known: {known})"
            ))
        })?;
        Ok(if rest.is_empty() {
            base.clone()
        } else {
            base.join(rest)
        })
    }
}

/// Resolves the configured directories relative to `base` (the build definition's directory).
/// A relative `base` is taken from the current directory; every returned path is absolute.
pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let base = absolute(base)?;
    let root = lexical_clean(&rooted(&base, &cfg.root_dir)?);
    let cache_dir = rooted_dir(&root, &cfg.cache_dir)?;
    let build_dir = rooted_dir(&root, &cfg.build_dir)?;
    let prefix = rooted_dir(&root, &cfg.prefix)?;

    let mut aliases = BTreeMap::new();
    aliases.insert("root".to_string(), root.clone());
    aliases.insert("cache".to_string(), cache_dir.clone());
    aliases.insert("build".to_string(), build_dir.clone());
    aliases.insert("prefix".to_string(), prefix.clone());
    for (name, raw) in &cfg.paths {
        let key = name.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::config(format!(
                "workspace.paths key '{key}' is invalid (allowed: a-zA-Z0-9_-)"
            )));
        }
        if aliases.contains_key(key) {
            return Err(Error::config(format!(
                "workspace.paths key '{key}' is reserved"
            )));
        }
        aliases.insert(key.to_string(), rooted(&root, raw)?);
    }

    Ok(WorkspacePaths {
        root,
        cache_dir,
        build_dir,
        prefix,
        aliases,
    })
}

pub fn init_dirs(paths: &WorkspacePaths) -> Result<()> {
    for dir in [&paths.cache_dir, &paths.build_dir, &paths.prefix] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(())
}

/// Deliberate reset of build state. The Content Store is never touched.
pub fn clean(paths: &WorkspacePaths, mode: CleanMode) -> Result<Vec<PathBuf>> {
    let targets: Vec<&PathBuf> = match mode {
        CleanMode::None => vec![],
        CleanMode::Build => vec![&paths.build_dir],
        CleanMode::Prefix => vec![&paths.prefix],
        CleanMode::All => vec![&paths.build_dir, &paths.prefix],
    };
    let mut removed = Vec::new();
    for dir in targets {
        if remove_inside_root(&paths.root, dir)? {
            removed.push(dir.clone());
        }
    }
    Ok(removed)
}

fn remove_inside_root(root: &Path, dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not strictly inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dir_can.display())))?;
    Ok(true)
}

fn rooted(base: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(raw);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

/// Anchors a relative path at the current directory.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(lexical_clean(path));
    }
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    Ok(lexical_clean(&cwd.join(path)))
}

// Drops `.` and folds `name/..` without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn rooted_dir(root: &Path, raw: &str) -> Result<PathBuf> {
    if Path::new(raw.trim())
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{raw}' (contains '..')"
        )));
    }
    rooted(root, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_expand_and_relative_paths_root_at_workspace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = WorkspaceConfig::default();
        cfg.paths.insert("patches".into(), "patches".into());
        let ws = load_paths(&cfg, tmp.path()).expect("paths");

        assert_eq!(ws.cache_dir, tmp.path().join("cache"));
        assert_eq!(
            ws.resolve("@patches/gcc/0001.diff").expect("alias"),
            tmp.path().join("patches/gcc/0001.diff")
        );
        assert_eq!(
            ws.resolve("@prefix").expect("prefix alias"),
            tmp.path().join("output")
        );
        assert!(ws.resolve("@nope/x").is_err());
    }

    #[test]
    fn relative_base_is_made_absolute() {
        let cfg = WorkspaceConfig {
            root_dir: "..".into(),
            ..WorkspaceConfig::default()
        };
        let ws = load_paths(&cfg, Path::new("configs")).expect("paths");
        let cwd = std::env::current_dir().expect("cwd");

        assert_eq!(ws.root, cwd);
        assert_eq!(ws.prefix, cwd.join("output"));
        assert!(ws.cache_dir.is_absolute());
        assert!(ws.aliases.values().all(|p| p.is_absolute()));
    }

    #[test]
    fn lexical_clean_folds_parent_components() {
        assert_eq!(lexical_clean(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(lexical_clean(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(lexical_clean(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn clean_prefix_keeps_cache_and_build() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = load_paths(&WorkspaceConfig::default(), tmp.path()).expect("paths");
        init_dirs(&ws).expect("init");
        fs::write(ws.cache_dir.join("foo-1.0.tar.gz"), b"x").expect("artifact");

        let removed = clean(&ws, CleanMode::Prefix).expect("clean");
        assert_eq!(removed, vec![ws.prefix.clone()]);
        assert!(!ws.prefix.exists());
        assert!(ws.build_dir.exists());
        assert!(ws.cache_dir.join("foo-1.0.tar.gz").exists());
    }

    #[test]
    fn parent_dir_components_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            prefix: "../escape".into(),
            ..WorkspaceConfig::default()
        };
        assert!(load_paths(&cfg, tmp.path()).is_err());
    }
}
