//! Pipeline Driver: runs stages strictly in declaration order, skipping completed ones.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::build_op::{BuildOperation, PhaseRequest};
use crate::config::{BuildDefinition, PhaseConfig, PublishConfig};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::events::{ExecSink, PipelineEvent};
use crate::fetch::{FetchRequest, Fetcher};
use crate::interrupt;
use crate::publish::{self, Published};
use crate::session::SessionTracker;
use crate::stage::{self, StageKey, StageState, StageTracker};
use crate::unpack::{self, PatchTool};
use crate::verify;
use crate::workspace;

/// A `[[stage]]` entry with paths resolved and its source request built.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub key: StageKey,
    pub phases: Vec<PhaseConfig>,
    pub request: Option<FetchRequest>,
    /// Expanded, in application order.
    pub patches: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl StagePlan {
    pub fn id(&self) -> String {
        self.key.id()
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }
}

/// Directory scanned for leftover downloads from earlier partial runs.
pub fn downloads_dir(ctx: &BuildContext) -> PathBuf {
    ctx.build_dir().join("downloads")
}

pub fn plan(def: &BuildDefinition, ctx: &BuildContext) -> Result<Vec<StagePlan>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cfg in def.stages()? {
        let key = StageKey::from_config(&cfg)?;
        if !seen.insert(key.id()) {
            return Err(Error::config(format!("duplicate stage '{}'", key.id())));
        }

        let phases = cfg.effective_phases();
        let mut names = BTreeSet::new();
        for p in &phases {
            stage::check_component("phase", &p.name)?;
            if !names.insert(p.name.as_str()) {
                return Err(Error::config(format!(
                    "stage '{}' declares phase '{}' twice",
                    key.id(),
                    p.name
                )));
            }
        }

        let request = match &cfg.source {
            Some(src) => {
                let mut req = FetchRequest::from_source(&key.package, &key.version, src)?;
                req.leftover = Some(downloads_dir(ctx).join(&req.filename));
                Some(req)
            }
            None => None,
        };

        let mut patch_entries = Vec::with_capacity(cfg.patches.len());
        for raw in &cfg.patches {
            patch_entries.push(ctx.workspace.resolve(raw)?);
        }
        let patches = unpack::expand_patch_set(&patch_entries)?;

        out.push(StagePlan {
            key,
            phases,
            request,
            patches,
            env: cfg.env.clone(),
        });
    }
    Ok(out)
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    /// Stages a dry run would have executed.
    pub pending: Vec<String>,
    pub version_file: Option<PathBuf>,
    pub published: Option<Published>,
}

pub struct Pipeline<'a> {
    ctx: &'a BuildContext,
    fetcher: &'a Fetcher,
    builder: &'a dyn BuildOperation,
    sink: Arc<dyn ExecSink>,
    patcher: PatchTool,
    publish: Option<PublishConfig>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        fetcher: &'a Fetcher,
        builder: &'a dyn BuildOperation,
        sink: Arc<dyn ExecSink>,
    ) -> Self {
        Self {
            ctx,
            fetcher,
            builder,
            sink,
            patcher: PatchTool::default(),
            publish: None,
        }
    }

    pub fn with_patcher(mut self, patcher: PatchTool) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn with_publish(mut self, cfg: Option<PublishConfig>) -> Self {
        self.publish = cfg.filter(|c| c.enabled);
        self
    }

    pub fn tracker(&self) -> StageTracker {
        StageTracker::new(self.ctx.build_dir())
    }

    pub fn status(&self, stages: &[StagePlan]) -> Vec<(String, StageState)> {
        let tracker = self.tracker();
        stages
            .iter()
            .map(|s| (s.id(), tracker.state(&s.key, &s.phase_names())))
            .collect()
    }

    /// Fetches and verifies every stage source without building anything.
    pub fn fetch_all(&self, stages: &[StagePlan]) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for s in stages {
            let Some(req) = &s.request else {
                continue;
            };
            if interrupt::interrupted() {
                return Err(Error::Interrupted);
            }
            let fetched = self.fetcher.fetch(req)?;
            verify::verify(&fetched.path, req.expected.as_deref(), req.policy)?;
            info!(stage = %s.id(), artifact = %fetched.path.display(), cached = fetched.from_cache, "source ready");
            out.push(fetched.path);
        }
        Ok(out)
    }

    pub fn run(&self, stages: &[StagePlan]) -> Result<RunReport> {
        let res = self.run_inner(stages);
        match &res {
            Ok(_) => self.sink.emit(PipelineEvent::PipelineDone {
                ok: true,
                error: None,
            }),
            Err(e) => self.sink.emit(PipelineEvent::PipelineDone {
                ok: false,
                error: Some(e.to_string()),
            }),
        }
        res
    }

    fn run_inner(&self, stages: &[StagePlan]) -> Result<RunReport> {
        let tracker = self.tracker();
        let mut report = RunReport::default();
        let mut session = SessionTracker::new(self.ctx.prefix(), &self.ctx.source_dir);
        if !self.ctx.dry_run {
            workspace::init_dirs(&self.ctx.workspace)?;
        }

        for s in stages {
            if interrupt::interrupted() {
                return Err(Error::Interrupted);
            }
            let id = s.id();
            let state = tracker.state(&s.key, &s.phase_names());
            if state == StageState::Done {
                self.sink.emit(PipelineEvent::StageSkipped {
                    id: id.clone(),
                    reason: "complete".into(),
                });
                report.skipped.push(id);
                continue;
            }

            if self.ctx.dry_run {
                self.dry_run_stage(s, state);
                report.pending.push(id);
                continue;
            }

            session.begin()?;
            self.sink.emit(PipelineEvent::StageStarted { id: id.clone() });
            let started = Instant::now();
            let res = self.execute_stage(&tracker, s, state);
            let elapsed_ms = started.elapsed().as_millis();
            self.sink.emit(PipelineEvent::StageFinished {
                id: id.clone(),
                ok: res.is_ok(),
                error: res.as_ref().err().map(|e| e.to_string()),
                elapsed_ms,
            });
            if let Err(e) = res {
                warn!(stage = %id, error = %e, "stage failed");
                return Err(e);
            }
            report.executed.push(id);
        }

        if self.ctx.dry_run {
            return Ok(report);
        }

        // Finalize when this run (or an interrupted earlier one) did real work.
        if session.is_open() {
            let ids: Vec<String> = stages.iter().map(StagePlan::id).collect();
            report.version_file = Some(session.finish(self.ctx, &ids)?);
            if let Some(cfg) = &self.publish {
                let published = publish::publish(
                    self.ctx,
                    self.fetcher.store(),
                    cfg,
                    publish::source_date_epoch(),
                )?;
                report.published = Some(published);
            }
            session.close()?;
        }
        Ok(report)
    }

    fn dry_run_stage(&self, s: &StagePlan, state: StageState) {
        let id = s.id();
        let log = |line: String| {
            self.sink.emit(PipelineEvent::StageLog {
                id: id.clone(),
                line,
            })
        };
        self.sink.emit(PipelineEvent::StageStarted { id: id.clone() });
        let done = match state {
            StageState::Partial { done, .. } => done,
            _ => 0,
        };
        if done == 0 {
            if let Some(req) = &s.request {
                log(format!(
                    "DRY-RUN: fetch {} from {} and verify ({})",
                    req.filename,
                    req.mode.origin(),
                    req.policy.as_str()
                ));
            }
            if !s.patches.is_empty() {
                log(format!("DRY-RUN: apply {} patch(es)", s.patches.len()));
            }
        }
        for p in &s.phases[done..] {
            log(format!("DRY-RUN: phase '{}' ({} command(s))", p.name, p.run.len()));
        }
        self.sink.emit(PipelineEvent::StageFinished {
            id,
            ok: true,
            error: None,
            elapsed_ms: 0,
        });
    }

    fn execute_stage(&self, tracker: &StageTracker, s: &StagePlan, state: StageState) -> Result<()> {
        let id = s.id();
        let log = |line: &str| {
            self.sink.emit(PipelineEvent::StageLog {
                id: id.clone(),
                line: line.to_string(),
            })
        };
        let layout = tracker.layout(&s.key);

        let done = match state {
            StageState::Partial { done, .. } => done,
            _ => 0,
        };
        if done == 0 {
            tracker.reset(&s.key)?;
            match &s.request {
                Some(req) => {
                    let fetched = self.fetcher.fetch(req)?;
                    log(&format!(
                        "source {} ({})",
                        fetched.path.display(),
                        if fetched.from_cache { "cached" } else { "fetched" }
                    ));
                    verify::verify(&fetched.path, req.expected.as_deref(), req.policy)?;
                    log(&format!("verified ({})", req.policy.as_str()));
                    unpack::unpack(&fetched.path, &layout.src)?;
                }
                None => {
                    fs::create_dir_all(&layout.src).map_err(|e| {
                        Error::msg(format!("failed to create {}: {e}", layout.src.display()))
                    })?;
                }
            }
            self.patcher.apply_all(&s.patches, &layout.src)?;
            if !s.patches.is_empty() {
                log(&format!("applied {} patch(es)", s.patches.len()));
            }
        } else {
            if !layout.src.is_dir() {
                return Err(Error::msg(format!(
                    "stage '{id}' has {done} completed phase(s) but its working tree {} is gone; \
                     run `tcb clean` to start it over",
                    layout.src.display()
                )));
            }
            log(&format!(
                "resuming at phase {}/{}",
                done + 1,
                s.phases.len()
            ));
        }

        for phase in &s.phases[done..] {
            if interrupt::interrupted() {
                return Err(Error::Interrupted);
            }
            info!(stage = %id, phase = %phase.name, "running phase");
            let req = PhaseRequest {
                stage: &s.key,
                phase,
                layout: &layout,
                stage_env: &s.env,
            };
            self.builder.run_phase(self.ctx, &req, &log)?;
            tracker.mark_done(&s.key, &phase.name)?;
        }
        Ok(())
    }
}
