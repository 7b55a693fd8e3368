use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};

const ERROR_LOG_TAIL: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    StageSkipped {
        id: String,
        reason: String,
    },
    StageStarted {
        id: String,
    },
    StageLog {
        id: String,
        line: String,
    },
    StageFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    PipelineDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: PipelineEvent);
}

/// Line-oriented console output plus per-stage error logs for failed stages.
pub struct StdoutSink {
    error_logs_root: PathBuf,
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    started_at: Option<Instant>,
    skipped: usize,
    ran: usize,
    ok: usize,
    failed: Vec<String>,
    log_lines: usize,
    stage_ms: u128,
    current_log: VecDeque<String>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl StdoutSink {
    /// Error logs go to `<error_logs_root>/<YYYYmmdd-HHMMSS>/<stage>.log`.
    pub fn new(error_logs_root: impl Into<PathBuf>) -> Self {
        Self {
            error_logs_root: error_logs_root.into(),
            state: Mutex::new(SinkState::default()),
        }
    }

    fn write_error_log(
        &self,
        s: &mut SinkState,
        id: &str,
        error: Option<&str>,
        elapsed_ms: u128,
    ) -> Result<PathBuf> {
        let dir = match &s.error_logs_dir {
            Some(d) => d.clone(),
            None => {
                let d = self
                    .error_logs_root
                    .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
                fs::create_dir_all(&d).map_err(|e| {
                    Error::msg(format!("failed to create error logs dir {}: {e}", d.display()))
                })?;
                s.error_logs_dir = Some(d.clone());
                d
            }
        };
        let path = dir.join(format!("{}.log", filename_safe(id)));

        let mut body = format!("stage: {id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
        if let Some(e) = error.filter(|e| !e.trim().is_empty()) {
            body.push_str(&format!("error: {e}\n"));
        }
        body.push_str("\nlogs:\n");
        for line in &s.current_log {
            body.push_str(line);
            body.push('\n');
        }
        fs::write(&path, body).map_err(|e| {
            Error::msg(format!("failed to write error log {}: {e}", path.display()))
        })?;
        s.error_log_paths.push(path.clone());
        Ok(path)
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: PipelineEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        if s.started_at.is_none() {
            s.started_at = Some(Instant::now());
        }
        match ev {
            PipelineEvent::StageSkipped { id, reason } => {
                s.skipped += 1;
                println!("SKIP: {id} ({reason})");
            }
            PipelineEvent::StageStarted { id } => {
                s.ran += 1;
                s.current_log.clear();
                println!("RUN: {id}");
            }
            PipelineEvent::StageLog { id, line } => {
                s.log_lines += 1;
                if s.current_log.len() == ERROR_LOG_TAIL {
                    s.current_log.pop_front();
                }
                s.current_log.push_back(line.clone());
                println!("[{id}] {line}");
            }
            PipelineEvent::StageFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                s.stage_ms += elapsed_ms;
                if ok {
                    s.ok += 1;
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    s.failed.push(id.clone());
                    println!(
                        "FAIL: {id} ({elapsed_ms}ms) {}",
                        error.as_deref().unwrap_or_default()
                    );
                    match self.write_error_log(&mut s, &id, error.as_deref(), elapsed_ms) {
                        Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                        Err(e) => println!("WARN: failed to write error log for {id}: {e}"),
                    }
                }
                s.current_log.clear();
            }
            PipelineEvent::PipelineDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  stages: skipped={} ran={} ok={} failed={}",
                    s.skipped,
                    s.ran,
                    s.ok,
                    s.failed.len()
                );
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_hms(wall.as_secs()));
                println!("  stage_time: {}", format_hms((s.stage_ms / 1000) as u64));
                if !s.failed.is_empty() {
                    println!("  failed_stages: {}", s.failed.join(", "));
                }
                if !s.error_log_paths.is_empty() {
                    println!("  error_logs:");
                    for p in &s.error_log_paths {
                        println!("    {}", p.display());
                    }
                }
                if let Some(e) = error.filter(|_| !ok) {
                    println!("  error: {e}");
                }
                *s = SinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: PipelineEvent) {
        let _ = self.tx.send(ev);
    }
}

fn filename_safe(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "stage".into() } else { out }
}

fn format_hms(total_secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_stage_gets_an_error_log_with_its_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = StdoutSink::new(tmp.path().join("error-logs"));
        sink.emit(PipelineEvent::StageStarted {
            id: "gcc-13.2.0-final".into(),
        });
        sink.emit(PipelineEvent::StageLog {
            id: "gcc-13.2.0-final".into(),
            line: "configure: error: no acceptable C compiler".into(),
        });
        sink.emit(PipelineEvent::StageFinished {
            id: "gcc-13.2.0-final".into(),
            ok: false,
            error: Some("exit status: 1".into()),
            elapsed_ms: 12,
        });

        let runs: Vec<_> = fs::read_dir(tmp.path().join("error-logs"))
            .expect("logs root")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(runs.len(), 1);
        let body = fs::read_to_string(runs[0].path().join("gcc-13.2.0-final.log")).expect("log");
        assert!(body.contains("error: exit status: 1"), "{body}");
        assert!(body.contains("configure: error: no acceptable C compiler"));
    }

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.emit(PipelineEvent::PipelineDone {
            ok: true,
            error: None,
        });
        assert_eq!(
            rx.recv().expect("event"),
            PipelineEvent::PipelineDone {
                ok: true,
                error: None
            }
        );
    }

    #[test]
    fn hms() {
        assert_eq!(format_hms(3725), "01:02:05");
        assert_eq!(filename_safe("a/b c"), "a_b_c");
    }
}
