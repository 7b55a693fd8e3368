//! The opaque "build a package" step: the engine only prepares inputs, streams output and
//! observes success or failure.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;

use tracing::debug;

use crate::config::PhaseConfig;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::interrupt;
use crate::stage::{StageKey, StageLayout};

pub mod diagnostics;
pub mod sanitize;

const TAIL_LINES: usize = 200;

pub struct PhaseRequest<'a> {
    pub stage: &'a StageKey,
    pub phase: &'a PhaseConfig,
    pub layout: &'a StageLayout,
    pub stage_env: &'a BTreeMap<String, String>,
}

pub trait BuildOperation: Send + Sync {
    /// Runs one phase against a prepared working tree. Installed files go to `ctx.prefix()`.
    fn run_phase(&self, ctx: &BuildContext, req: &PhaseRequest<'_>, log: &dyn Fn(&str))
    -> Result<()>;
}

/// Environment handed to a phase: run-wide values, then the `[tools]` table, then the stage's
/// own `env` (later entries win).
pub fn phase_env(ctx: &BuildContext, req: &PhaseRequest<'_>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let prefix = ctx.prefix().display().to_string();
    env.insert("PREFIX".into(), prefix.clone());
    env.insert("TARGET".into(), ctx.target.clone());
    env.insert("SYSROOT".into(), ctx.sysroot().display().to_string());
    env.insert("JOBS".into(), ctx.jobs.to_string());
    env.insert("MAKEFLAGS".into(), format!("-j{}", ctx.jobs));
    env.insert("SRC_DIR".into(), req.layout.src.display().to_string());
    env.insert("BUILD_DIR".into(), req.layout.build.display().to_string());
    env.insert("PACKAGE".into(), req.stage.package.clone());
    env.insert("VERSION".into(), req.stage.version.clone());
    env.insert("STAGE".into(), req.stage.id());
    env.insert("PHASE".into(), req.phase.name.clone());

    // Tools installed by earlier stages come first.
    let path = match std::env::var("PATH") {
        Ok(p) if !p.is_empty() => format!("{prefix}/bin:{p}"),
        _ => format!("{prefix}/bin"),
    };
    env.insert("PATH".into(), path);

    for (k, v) in &ctx.tools {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in req.stage_env {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Runs each command of a phase with `sh -c` inside the stage's build directory.
#[derive(Debug, Clone)]
pub struct CommandBuild {
    shell: String,
}

impl Default for CommandBuild {
    fn default() -> Self {
        Self { shell: "sh".into() }
    }
}

impl CommandBuild {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl BuildOperation for CommandBuild {
    fn run_phase(
        &self,
        ctx: &BuildContext,
        req: &PhaseRequest<'_>,
        log: &dyn Fn(&str),
    ) -> Result<()> {
        fs::create_dir_all(&req.layout.build).map_err(|e| {
            Error::msg(format!(
                "failed to create {}: {e}",
                req.layout.build.display()
            ))
        })?;
        let env = phase_env(ctx, req);

        for script in &req.phase.run {
            log(&format!("$ {script}"));
            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c")
                .arg(script)
                .current_dir(&req.layout.build)
                .envs(&env);

            let mut tail = VecDeque::with_capacity(TAIL_LINES);
            let status = run_streaming(cmd, &mut |line| {
                log(line);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            })?;
            if !status.success() {
                return Err(Error::BuildOperation {
                    stage: req.stage.id(),
                    message: format!(
                        "phase '{}': `{script}` exited with {status}",
                        req.phase.name
                    ),
                    hints: diagnostics::scan(tail.iter().map(String::as_str)),
                });
            }
        }
        Ok(())
    }
}

/// Spawns `cmd` in its own process group and feeds sanitized stdout/stderr lines to `on_line`.
pub fn run_streaming(mut cmd: Command, on_line: &mut dyn FnMut(&str)) -> Result<ExitStatus> {
    if interrupt::interrupted() {
        return Err(Error::Interrupted);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    debug!(?cmd, "spawn");
    // stdin stays detached: a read from the controlling TTY would stop the process group.
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("spawn failed: {e}")))?;
    let pgid = child.id();
    interrupt::register_child_pgroup(pgid);

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || forward_lines(out, tx)));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || forward_lines(err, tx)));
    }
    drop(tx);

    for raw in rx {
        let line = sanitize::sanitize_line(&raw);
        if !line.trim().is_empty() {
            on_line(&line);
        }
    }
    for r in readers {
        let _ = r.join();
    }

    let status = child.wait();
    interrupt::unregister_child_pgroup(pgid);
    status.map_err(|e| Error::msg(format!("wait failed: {e}")))
}

fn forward_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    // Progress output uses bare carriage returns; treat them as line ends too.
    for chunk in BufReader::new(reader).split(b'\n') {
        let Ok(chunk) = chunk else {
            break;
        };
        for piece in chunk.split(|b| *b == b'\r') {
            if piece.is_empty() {
                continue;
            }
            if tx.send(String::from_utf8_lossy(piece).into_owned()).is_err() {
                return;
            }
        }
    }
}
