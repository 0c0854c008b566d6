use crate::aggregate::{rows_for_pairs, ResultRow};
use crate::dispatch::Dispatcher;
use crate::pairlist::PairRecord;
use crate::pool::{PoolReport, RunState, WorkerPool};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// What a workflow hands to the aggregator.
#[derive(Debug, Default)]
pub struct RunOutput {
    pub report: PoolReport,
    /// One row per pair with a result or an existing pose file.
    pub rows: Vec<ResultRow>,
}

/// A workflow over the whole pair list.
#[async_trait]
pub trait Runner {
    async fn run(&self, pairs: &[PairRecord]) -> Result<RunOutput>;
}

/// How a child process ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    Exited {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

impl ProcessOutcome {
    pub fn stderr(&self) -> &[u8] {
        match self {
            ProcessOutcome::Exited { stderr, .. } | ProcessOutcome::TimedOut { stderr, .. } => {
                stderr
            }
        }
    }

    pub fn stdout(&self) -> &[u8] {
        match self {
            ProcessOutcome::Exited { stdout, .. } | ProcessOutcome::TimedOut { stdout, .. } => {
                stdout
            }
        }
    }
}

// Grace period for draining pipes once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct LocalJobStarter;

impl LocalJobStarter {
    /// Run `program` with `args`, killing it (and its process group) once
    /// `limit` elapses. Only spawn errors are returned as `Err`.
    pub async fn run_with_timeout(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        limit: Duration,
    ) -> std::io::Result<ProcessOutcome> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                warn!(
                    "{:?} exceeded {}s, killing it",
                    program.file_name().unwrap_or_default(),
                    limit.as_secs()
                );
                kill_tree(&mut child).await;
                None
            }
        };

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        Ok(match status {
            Some(status) => ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
            },
            None => ProcessOutcome::TimedOut { stdout, stderr },
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Child output read stopped after {} bytes: {}", buf.len(), e);
        }
    }
    buf
}

async fn collect(handle: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(buf)) => buf,
        _ => Vec::new(),
    }
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group; take the whole group down.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// One docking mode over every pair, resumable.
pub struct DockingRun {
    pub pool: WorkerPool,
    pub dispatcher: Arc<Dispatcher>,
    pub state: Arc<RunState>,
}

#[async_trait]
impl Runner for DockingRun {
    async fn run(&self, pairs: &[PairRecord]) -> Result<RunOutput> {
        info!(
            "Running {} docking on {} pairs ({} workers)",
            self.dispatcher.label(),
            pairs.len(),
            self.pool.concurrency()
        );
        self.dispatcher.prepare().await?;
        let report = self
            .pool
            .run(pairs, self.dispatcher.clone(), self.state.clone())
            .await;
        let rows = rows_for_pairs(pairs, &self.dispatcher, &report.results);
        Ok(RunOutput { report, rows })
    }
}
