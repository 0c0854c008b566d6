use crate::config::{Config, SearchParams};
use crate::device::DeviceSelection;
use crate::error::FailureKind;
use crate::pairlist::PairRecord;
use crate::protocols::DockingMode;
use crate::results::TaskResult;
use crate::runners::{LocalJobStarter, ProcessOutcome};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// The exact child process a dispatch will start, and where it writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub pose_path: PathBuf,
    pub log_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        let mut words = vec![self.program.to_string_lossy().to_string()];
        words.extend(self.args.iter().cloned());
        shell_words::join(words)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Turns one `PairRecord` into one GNINA run and a `TaskResult`.
pub struct Dispatcher {
    config: Config,
    mode: DockingMode,
    label: String,
    params: SearchParams,
    device: DeviceSelection,
    tag_suffix: String,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(config: &Config, mode: DockingMode, gpu_available: bool) -> Result<Self> {
        let extra_args =
            shell_words::split(&config.extra_args).context("Failed to parse extra_args")?;
        Ok(Self {
            params: mode.search_params(&config.search),
            tag_suffix: mode.tag_suffix().unwrap_or_default().to_string(),
            device: DeviceSelection::resolve(config, gpu_available),
            timeout: Duration::from_secs(config.timeout_secs),
            label: mode.label().to_string(),
            config: config.clone(),
            mode,
            extra_args,
        })
    }

    pub fn with_params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_tag_suffix(mut self, suffix: &str) -> Self {
        self.tag_suffix.push_str(suffix);
        self
    }

    /// Recorded as `mode` on every result.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn device(&self) -> DeviceSelection {
        self.device
    }

    /// File-name key for everything this dispatcher writes for `pair`.
    pub fn tag(&self, pair: &PairRecord) -> String {
        format!("{}{}", pair.pair_id(), self.tag_suffix)
    }

    pub fn pose_path(&self, pair: &PairRecord) -> PathBuf {
        self.config
            .output_path()
            .join(format!("{}_poses.sdf", self.tag(pair)))
    }

    pub async fn prepare(&self) -> Result<()> {
        for dir in [self.config.output_path(), self.config.log_path()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .context(format!("Failed to create directory {:?}", dir))?;
        }
        Ok(())
    }

    pub fn build_invocation(&self, pair: &PairRecord) -> Invocation {
        let tag = self.tag(pair);
        let pose_path = self.pose_path(pair);
        let log_dir = self.config.log_path();
        let log_path = log_dir.join(format!("{}.log", tag));
        let stderr_path = log_dir.join(format!("{}.stderr", tag));

        let mut args = vec![
            "--receptor".to_string(),
            path_arg(&self.config.receptor_path(&pair.receptor)),
            "--ligand".to_string(),
            path_arg(&self.config.ligand_path(&pair.ligand)),
            "--out".to_string(),
            path_arg(&pose_path),
            "--log".to_string(),
            path_arg(&log_path),
        ];
        for (axis, value) in ["x", "y", "z"].iter().zip(pair.center) {
            args.push(format!("--center_{}", axis));
            args.push(value.to_string());
        }
        for (axis, value) in ["x", "y", "z"].iter().zip(pair.size) {
            args.push(format!("--size_{}", axis));
            args.push(value.to_string());
        }

        args.extend(self.mode.mode_args(&self.params));
        args.extend(self.device.args());

        let on_off = |flag: bool| (if flag { "on" } else { "off" }).to_string();
        args.push("--addH".to_string());
        args.push(on_off(self.params.add_hydrogens));
        args.push("--stripH".to_string());
        args.push(on_off(self.params.strip_hydrogens));

        args.extend(self.extra_args.iter().cloned());

        let (program, args) = match &self.config.container_image {
            Some(image) => {
                let mut wrapped = vec!["exec".to_string()];
                if self.device.uses_gpu() {
                    wrapped.push("--nv".to_string());
                }
                wrapped.push(path_arg(image));
                wrapped.push(path_arg(&self.config.gnina_binary));
                wrapped.extend(args);
                (PathBuf::from(&self.config.container_runtime), wrapped)
            }
            None => (self.config.gnina_binary.clone(), args),
        };

        Invocation {
            program,
            args,
            pose_path,
            log_path,
            stderr_path,
        }
    }

    /// Run GNINA for one pair. Every outcome, including a timeout or a
    /// missing input, comes back as a `TaskResult`.
    pub async fn dispatch(&self, pair: &PairRecord) -> TaskResult {
        let invocation = self.build_invocation(pair);
        let tag = self.tag(pair);

        for input in [
            self.config.receptor_path(&pair.receptor),
            self.config.ligand_path(&pair.ligand),
        ] {
            if !input.is_file() {
                warn!("{}: input not found: {:?}", tag, input);
                let failure = FailureKind::MissingInput { path: input };
                persist(&invocation.stderr_path, failure.to_string().as_bytes()).await;
                return self.result(pair, &invocation, Some(failure), None, 0.0);
            }
        }

        debug!("Executing: {}", invocation.command_line());
        let started = Instant::now();
        let outcome = LocalJobStarter::run_with_timeout(
            &invocation.program,
            &invocation.args,
            &self.config.work_dir,
            self.timeout,
        )
        .await;
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{}: failed to start {:?}: {}", tag, invocation.program, e);
                let failure = FailureKind::SpawnFailed {
                    message: e.to_string(),
                };
                persist(&invocation.stderr_path, failure.to_string().as_bytes()).await;
                return self.result(pair, &invocation, Some(failure), None, elapsed);
            }
        };

        persist(&invocation.stderr_path, outcome.stderr()).await;
        if !invocation.log_path.exists() && !outcome.stdout().is_empty() {
            persist(&invocation.log_path, outcome.stdout()).await;
        }

        let (failure, exit_code) = match &outcome {
            ProcessOutcome::TimedOut { .. } => (
                Some(FailureKind::Timeout {
                    secs: self.timeout.as_secs(),
                }),
                None,
            ),
            ProcessOutcome::Exited { status, .. } if status.success() => {
                if has_content(&invocation.pose_path) {
                    (None, status.code())
                } else {
                    (
                        Some(FailureKind::MissingOutput {
                            path: invocation.pose_path.clone(),
                        }),
                        status.code(),
                    )
                }
            }
            ProcessOutcome::Exited { status, .. } => (
                Some(FailureKind::NonZeroExit {
                    code: status.code(),
                }),
                status.code(),
            ),
        };

        if failure.is_some() {
            set_aside(&invocation.pose_path);
        }
        match &failure {
            None => info!("{} docked in {:.1}s", tag, elapsed),
            Some(kind) => warn!(
                "{} failed after {:.1}s: {} (stderr: {:?})",
                tag, elapsed, kind, invocation.stderr_path
            ),
        }
        self.result(pair, &invocation, failure, exit_code, elapsed)
    }

    /// Result for a dispatch whose worker died before reporting.
    pub fn crashed(&self, pair: &PairRecord, message: &str) -> TaskResult {
        let invocation = self.build_invocation(pair);
        set_aside(&invocation.pose_path);
        self.result(
            pair,
            &invocation,
            Some(FailureKind::WorkerCrashed {
                message: message.to_string(),
            }),
            None,
            0.0,
        )
    }

    /// Result for a pair whose poses an earlier run already wrote.
    pub fn resumed(&self, pair: &PairRecord) -> TaskResult {
        let invocation = self.build_invocation(pair);
        TaskResult {
            resumed: true,
            ..self.result(pair, &invocation, None, None, 0.0)
        }
    }

    fn result(
        &self,
        pair: &PairRecord,
        invocation: &Invocation,
        failure: Option<FailureKind>,
        exit_code: Option<i32>,
        elapsed_secs: f64,
    ) -> TaskResult {
        TaskResult {
            pair_id: pair.pair_id(),
            receptor: pair.receptor.clone(),
            ligand: pair.ligand.clone(),
            site_id: pair.site_id.clone(),
            mode: self.label.clone(),
            failure,
            exit_code,
            elapsed_secs,
            pose_path: invocation.pose_path.clone(),
            log_path: invocation.log_path.clone(),
            stderr_path: invocation.stderr_path.clone(),
            device_fallback: self.device.fallback,
            command: invocation.command_line(),
            resumed: false,
        }
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// `{tag}_poses.sdf` -> `{tag}_poses.sdf.partial`
pub fn partial_path(pose_path: &Path) -> PathBuf {
    let mut name = pose_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Poses left by a failed run must not look like a finished output on resume.
fn set_aside(pose_path: &Path) {
    if !pose_path.exists() {
        return;
    }
    let partial = partial_path(pose_path);
    match std::fs::rename(pose_path, &partial) {
        Ok(()) => warn!("Moved incomplete poses to {:?}", partial),
        Err(e) => {
            warn!("Failed to move {:?} aside: {}", pose_path, e);
            if let Err(e) = std::fs::remove_file(pose_path) {
                warn!("Failed to remove {:?}: {}", pose_path, e);
            }
        }
    }
}

async fn persist(path: &Path, bytes: &[u8]) {
    if let Err(e) = tokio::fs::write(path, bytes).await {
        warn!("Failed to write {:?}: {}", path, e);
    }
}
