use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{BuildDefinition, ToolchainConfig};
use crate::error::{Error, Result};
use crate::workspace::{self, WorkspaceConfig, WorkspacePaths};

pub const ENV_CACHE_DIR: &str = "TCB_CACHE_DIR";
pub const ENV_TARGET: &str = "TCB_TARGET";
pub const ENV_JOBS: &str = "TCB_JOBS";

/// Everything a stage may read about the run. Passed by reference into every component;
/// the Staging Tree at `prefix` has exactly one writer, the stage holding this context.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub name: String,
    pub target: String,
    pub jobs: usize,
    pub workspace: WorkspacePaths,
    /// Tool-path table exported to build operations.
    pub tools: BTreeMap<String, String>,
    /// Checkout recorded in the build session provenance.
    pub source_dir: PathBuf,
    pub dry_run: bool,
}

/// Values that beat both the build definition and the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub dry_run: bool,
}

impl BuildContext {
    pub fn prefix(&self) -> &Path {
        &self.workspace.prefix
    }

    pub fn cache_dir(&self) -> &Path {
        &self.workspace.cache_dir
    }

    pub fn build_dir(&self) -> &Path {
        &self.workspace.build_dir
    }

    pub fn sysroot(&self) -> PathBuf {
        self.workspace.prefix.join(&self.target)
    }

    pub fn from_definition(def: &BuildDefinition, ov: &Overrides) -> Result<Self> {
        Self::resolve(def, ov, |k| std::env::var(k).ok())
    }

    /// Precedence: overrides, then environment, then the definition.
    pub fn resolve(
        def: &BuildDefinition,
        ov: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let tc: ToolchainConfig = def.section_or_default("toolchain")?;
        let ws_cfg: WorkspaceConfig = def.section_or_default("workspace")?;
        let base = workspace::absolute(&def.base_dir())?;
        let mut workspace = workspace::load_paths(&ws_cfg, &base)?;

        let env_cache = env(ENV_CACHE_DIR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(dir) = ov.cache_dir.clone().or(env_cache) {
            workspace.cache_dir = if dir.is_absolute() {
                dir
            } else {
                workspace.root.join(dir)
            };
            workspace
                .aliases
                .insert("cache".into(), workspace.cache_dir.clone());
        }

        let target = ov
            .target
            .clone()
            .or_else(|| env(ENV_TARGET))
            .or(tc.target)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::config(format!(
                    "no target triple: set [toolchain].target, {ENV_TARGET} or --target"
                ))
            })?;

        let env_jobs = match env(ENV_JOBS) {
            Some(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<usize>().map_err(
                |e| Error::config(format!("invalid {ENV_JOBS} '{raw}': {e}")),
            )?),
            _ => None,
        };
        let jobs = match ov.jobs.or(env_jobs).unwrap_or(tc.jobs) {
            0 => num_cpus::get().max(1),
            n => n,
        };

        let tools: BTreeMap<String, String> = def.section_or_default("tools")?;
        let source_dir = match tc.source_dir.as_deref() {
            Some(raw) => workspace.resolve(raw)?,
            None => base.clone(),
        };
        let name = tc
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{target}-cross"));

        Ok(Self {
            name,
            target,
            jobs,
            workspace,
            tools,
            source_dir,
            dry_run: ov.dry_run,
        })
    }
}
