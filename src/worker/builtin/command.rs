//! Command worker: runs an external program as a worker.
//!
//! This is how business workers plug in without the orchestrator knowing what
//! they do. The prior context is passed as JSON in `AI_AGENT_CONTEXT`. If the
//! program prints a JSON object on stdout it may set `summary`, `metrics`,
//! `context`, `success` and `error`; otherwise the last non-empty stdout line
//! becomes the summary and the prior context is carried forward.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::worker::contract::{Context, Metric, MetricValue, Worker, WorkerResult};
use crate::worker::descriptor::WorkerDescriptor;

/// Maximum captured output per stream (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Worker backed by a shell command.
///
/// Has no clock of its own: the orchestrator bounds every run with the
/// descriptor's timeout and dropping the future kills the child.
#[derive(Debug)]
pub struct CommandWorker {
    descriptor: WorkerDescriptor,
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandWorker {
    pub fn new(descriptor: WorkerDescriptor, command: impl Into<String>) -> Self {
        Self {
            descriptor,
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn build_command(&self, prior_context: &Context) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &self.command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &self.command]);
            c
        };

        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        command
            .env("AI_AGENT_ID", &self.descriptor.id)
            .env("AI_AGENT_CONTEXT", prior_context.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The orchestrator may drop this future on timeout or cancellation.
            .kill_on_drop(true);
        command
    }
}

/// One output stream, capped at [`MAX_OUTPUT_SIZE`].
#[derive(Debug, Default)]
struct Captured {
    text: String,
    truncated: bool,
}

/// Read at most [`MAX_OUTPUT_SIZE`] bytes, then discard the rest so the
/// child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Captured> {
    let Some(mut reader) = reader else {
        return Ok(Captured::default());
    };
    let mut buf = Vec::new();
    (&mut reader)
        .take(MAX_OUTPUT_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    let truncated = buf.len() > MAX_OUTPUT_SIZE;
    if truncated {
        buf.truncate(MAX_OUTPUT_SIZE);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok(Captured {
        text: String::from_utf8_lossy(&buf).into_owned(),
        truncated,
    })
}

/// Structured report a command may print on stdout.
#[derive(Debug, Default, Deserialize)]
struct CommandReport {
    success: Option<bool>,
    summary: Option<String>,
    error: Option<String>,
    #[serde(default)]
    metrics: MetricsField,
    context: Option<Context>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MetricsField {
    List(Vec<Metric>),
    Map(BTreeMap<String, MetricValue>),
}

impl Default for MetricsField {
    fn default() -> Self {
        MetricsField::List(Vec::new())
    }
}

impl MetricsField {
    fn into_metrics(self) -> Vec<Metric> {
        match self {
            MetricsField::List(list) => list,
            MetricsField::Map(map) => map
                .into_iter()
                .map(|(name, value)| Metric { name, value })
                .collect(),
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn identify(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    async fn execute(&self, prior_context: Context) -> WorkerResult {
        let start = Instant::now();
        let mut child = match self.build_command(&prior_context).spawn() {
            Ok(child) => child,
            Err(e) => return WorkerResult::failure(format!("failed to spawn command: {e}")),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, stdout, stderr) =
            tokio::join!(child.wait(), read_capped(stdout), read_capped(stderr));
        let status = match status {
            Ok(status) => status,
            Err(e) => return WorkerResult::failure(format!("command execution failed: {e}")),
        };
        let (stdout, stderr) = match (stdout, stderr) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                return WorkerResult::failure(format!("reading command output: {e}"));
            }
        };

        let duration_ms = start.elapsed().as_millis() as i64;
        let exit_code = status.code().unwrap_or(-1) as i64;

        let mut result = interpret_output(&stdout, &stderr.text, exit_code == 0, prior_context);
        result = result
            .with_metric("exit_code", exit_code)
            .with_metric("duration_ms", duration_ms);

        tracing::debug!(
            worker = %self.descriptor.id,
            exit_code,
            duration_ms,
            "Command worker finished"
        );
        result
    }
}

/// Turn captured output into a result.
///
/// Stdout starting with `{` must be a complete report; anything else fails
/// the run rather than being mistaken for plain text.
fn interpret_output(stdout: &Captured, stderr: &str, exited_ok: bool, prior: Context) -> WorkerResult {
    let trimmed = stdout.text.trim();
    let report = if trimmed.starts_with('{') {
        if stdout.truncated {
            return WorkerResult::failure(format!(
                "malformed command report: output exceeds {} KiB",
                MAX_OUTPUT_SIZE / 1024
            ));
        }
        match serde_json::from_str::<CommandReport>(trimmed) {
            Ok(report) => Some(report),
            Err(e) => return WorkerResult::failure(format!("malformed command report: {e}")),
        }
    } else {
        None
    };

    match report {
        Some(report) => {
            let success = exited_ok && report.success.unwrap_or(true);
            let summary = report.summary.unwrap_or_default();
            let base = if success {
                WorkerResult::success(summary)
            } else {
                let error = report
                    .error
                    .or_else(|| non_empty(stderr))
                    .unwrap_or_else(|| "command reported failure".to_string());
                WorkerResult::failure(error).with_summary(summary)
            };
            let mut result = base.with_context(report.context.unwrap_or(prior));
            result.metrics = report.metrics.into_metrics();
            result
        }
        None if exited_ok => {
            let summary = trimmed
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .trim()
                .to_string();
            WorkerResult::success(summary).with_context(prior)
        }
        None => {
            let error = non_empty(stderr)
                .or_else(|| non_empty(trimmed))
                .unwrap_or_else(|| "command exited with non-zero status".to_string());
            WorkerResult::failure(error)
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
