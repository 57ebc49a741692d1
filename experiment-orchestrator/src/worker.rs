//! Worker that runs an external command inside the variant workspace.
//!
//! The command receives the instructions on stdin and in the environment:
//!
//! | Variable                  | Value                       |
//! |---------------------------|-----------------------------|
//! | `EXPERIMENT_NAME`         | experiment name             |
//! | `EXPERIMENT_TASK`         | shared task description     |
//! | `EXPERIMENT_VARIANT`      | variant name                |
//! | `EXPERIMENT_INSTRUCTIONS` | variant instructions        |
//! | `EXPERIMENT_WORKSPACE`    | absolute workspace path     |
//!
//! Structured results come back as [`WorkerLog`] lines on stderr. Without a
//! summary event, the tail of stdout becomes the summary.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use experiment_sdk::{VariantWorker, WorkerLog, WorkerOutput, WorkerRequest};
use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

const TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build_command(&self, request: &WorkerRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.workspace)
            .envs(&self.env)
            .env("EXPERIMENT_NAME", &request.experiment)
            .env("EXPERIMENT_TASK", &request.task)
            .env("EXPERIMENT_VARIANT", &request.variant)
            .env("EXPERIMENT_INSTRUCTIONS", &request.instructions)
            .env("EXPERIMENT_WORKSPACE", &request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// What the stderr reader collected
#[derive(Debug, Default)]
struct StderrReport {
    summary: Option<String>,
    metrics: BTreeMap<String, serde_json::Value>,
    tail: VecDeque<String>,
}

async fn read_tail<R: AsyncRead + Unpin>(reader: R) -> VecDeque<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        push_tail(&mut tail, line);
    }
    tail
}

/// Parse `WorkerLog` events out of stderr; plain lines are kept as a tail
async fn parse_stderr<R: AsyncRead + Unpin>(reader: R, variant: String) -> StderrReport {
    let mut report = StderrReport::default();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match WorkerLog::parse_line(&line) {
            Some(WorkerLog::Progress { message }) => {
                info!(variant = %variant, "{}", message);
            }
            Some(WorkerLog::Metric { name, value }) => {
                debug!(variant = %variant, metric = %name, %value, "metric");
                report.metrics.insert(name, value);
            }
            Some(WorkerLog::Summary { text }) => {
                report.summary = Some(text);
            }
            None => push_tail(&mut report.tail, line),
        }
    }

    report
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn join_tail(tail: &VecDeque<String>) -> String {
    tail.iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[async_trait]
impl VariantWorker for CommandWorker {
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let mut child = self
            .build_command(&request)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        // Instructions go in on stdin; closing it signals EOF
        if let Some(mut stdin) = child.stdin.take() {
            let instructions = request.instructions.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(instructions.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout available"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("no stderr available"))?;

        let stdout_task = tokio::spawn(read_tail(stdout));
        let stderr_task = tokio::spawn(parse_stderr(stderr, request.variant.clone()));

        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for '{}'", self.program))?;

        let stdout_tail = stdout_task.await.unwrap_or_default();
        let report = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let stderr_tail = join_tail(&report.tail);
            if stderr_tail.is_empty() {
                bail!("'{}' exited with {}", self.program, status);
            }
            bail!("'{}' exited with {}: {}", self.program, status, stderr_tail);
        }

        let summary = report
            .summary
            .unwrap_or_else(|| join_tail(&stdout_tail));

        Ok(WorkerOutput {
            summary,
            metrics: report.metrics,
        })
    }
}
