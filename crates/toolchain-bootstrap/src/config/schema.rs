use std::collections::BTreeMap;

use serde::Deserialize;

use crate::archive::ArchiveFormat;
use crate::verify::DigestPolicy;

fn default_true() -> bool {
    true
}

fn default_step() -> String {
    "build".into()
}

fn default_max_attempts() -> u32 {
    100
}

fn default_delay_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_publish_name() -> String {
    "{name}".into()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolchainConfig {
    pub name: Option<String>,
    pub target: Option<String>,
    /// Parallelism hint handed to build operations (0 = CPU count).
    pub jobs: usize,
    /// Checkout of the orchestrator itself, recorded for provenance.
    pub source_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_publish_name")]
    pub name: String,
    pub format: ArchiveFormat,
    pub exclude: Vec<String>,
    pub files: Vec<String>,
    pub path_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub release_pointer: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_publish_name(),
            format: ArchiveFormat::TarXz,
            exclude: Vec::new(),
            files: Vec::new(),
            path_prefix: None,
            release_pointer: true,
        }
    }
}

/// Where a stage's source comes from. Exactly one of `url` / `git` is set.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SourceConfig {
    pub url: Option<String>,
    pub git: Option<String>,
    pub rev: Option<String>,
    pub filename: Option<String>,
    pub sha256: Option<String>,
    pub policy: Option<DigestPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PhaseConfig {
    pub name: String,
    pub run: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub package: String,
    pub version: String,
    #[serde(default = "default_step")]
    pub step: String,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub patches: Vec<String>,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl StageConfig {
    /// Single-phase stages may list `run` directly instead of `[[stage.phases]]`.
    pub fn effective_phases(&self) -> Vec<PhaseConfig> {
        if !self.phases.is_empty() {
            return self.phases.clone();
        }
        vec![PhaseConfig {
            name: self.step.clone(),
            run: self.run.clone(),
        }]
    }
}
