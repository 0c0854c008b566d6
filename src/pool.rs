use crate::dispatch::Dispatcher;
use crate::pairlist::PairRecord;
use crate::results::{Summary, TaskResult};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const POSE_SUFFIX: &str = "_poses.sdf";

/// Tags that already have a non-empty pose file.
#[derive(Debug, Default)]
pub struct RunState {
    completed: Mutex<HashSet<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    run_id: String,
    total: usize,
    completed: Vec<String>,
}

impl RunState {
    pub fn scan(output_dir: &Path) -> Result<Self> {
        let pattern = output_dir.join(format!("*{}", POSE_SUFFIX));
        let pattern = pattern.to_string_lossy();
        let mut completed = HashSet::new();
        for entry in glob::glob(&pattern).context("Invalid output directory pattern")? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unreadable output entry: {}", e);
                    continue;
                }
            };
            let non_empty = std::fs::metadata(&path)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false);
            if !non_empty {
                continue;
            }
            if let Some(tag) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(POSE_SUFFIX))
            {
                completed.insert(tag.to_string());
            }
        }
        if !completed.is_empty() {
            info!(
                "Found {} completed outputs in {:?}",
                completed.len(),
                output_dir
            );
        }
        Ok(Self {
            completed: Mutex::new(completed),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set of tags.
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_complete(&self, tag: &str) -> bool {
        self.lock().contains(tag)
    }

    pub fn mark_complete(&self, tag: &str) {
        self.lock().insert(tag.to_string());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Write `docking_state.json`.
    pub fn save(&self, path: &Path, run_id: &str, total: usize) -> Result<()> {
        let mut completed: Vec<String> = self.lock().iter().cloned().collect();
        completed.sort();
        let state = StateFile {
            run_id: run_id.to_string(),
            total,
            completed,
        };
        let content = serde_json::to_string_pretty(&state)?;
        std::fs::write(path, content).context(format!("Failed to write state file {:?}", path))?;
        Ok(())
    }
}

/// What a pool run produced. `results` follow submission order.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub results: Vec<TaskResult>,
    /// Tags that were not dispatched because their output already exists.
    pub skipped: Vec<String>,
    /// One result per pair whose output an earlier run left.
    pub resumed: Vec<TaskResult>,
}

impl PoolReport {
    pub fn summary(&self) -> Summary {
        Summary::from_results(&self.results, self.skipped.len())
    }

    /// Resumed and dispatched results together, for a saved results file.
    pub fn all_results(&self) -> Vec<TaskResult> {
        self.resumed
            .iter()
            .chain(self.results.iter())
            .cloned()
            .collect()
    }
}

pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Dispatch every pair not yet in `state`, at most `concurrency` at a
    /// time. Returns once every task has finished.
    pub async fn run(
        &self,
        pairs: &[PairRecord],
        dispatcher: Arc<Dispatcher>,
        state: Arc<RunState>,
    ) -> PoolReport {
        let mut report = PoolReport::default();
        let mut queued: Vec<PairRecord> = Vec::new();
        let mut seen = HashSet::new();

        for pair in pairs {
            let tag = dispatcher.tag(pair);
            if state.is_complete(&tag) {
                debug!("{} already has poses, skipping", tag);
                if seen.insert(tag.clone()) {
                    report.resumed.push(dispatcher.resumed(pair));
                }
                report.skipped.push(tag);
            } else if !seen.insert(tag.clone()) {
                warn!("{} appears more than once in the pair list, skipping repeat", tag);
                report.skipped.push(tag);
            } else {
                queued.push(pair.clone());
            }
        }

        if !report.skipped.is_empty() {
            info!(
                "Resuming: {} of {} pairs already done",
                report.skipped.len(),
                pairs.len()
            );
        }

        let total = queued.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for (index, pair) in queued.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let dispatcher = dispatcher.clone();
            let state = state.clone();
            let finished = finished.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                info!("[{}/{}] Docking {}", index + 1, total, dispatcher.tag(&pair));

                // The dispatch runs in its own task so a panic surfaces as a
                // JoinError here instead of losing the index.
                let worker = {
                    let dispatcher = dispatcher.clone();
                    let pair = pair.clone();
                    tokio::spawn(async move { dispatcher.dispatch(&pair).await })
                };
                let result = match worker.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Worker for {} crashed: {}", dispatcher.tag(&pair), e);
                        dispatcher.crashed(&pair, &e.to_string())
                    }
                };

                if result.succeeded() {
                    state.mark_complete(&dispatcher.tag(&pair));
                }
                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    "[{}/{}] {} finished: {}",
                    done,
                    total,
                    result.pair_id,
                    result.status()
                );
                (index, result)
            });
        }

        let mut slots: Vec<Option<TaskResult>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!("Pool task failed: {}", e),
            }
        }

        report.results = slots
            .into_iter()
            .zip(queued.iter())
            .map(|(slot, pair)| {
                slot.unwrap_or_else(|| dispatcher.crashed(pair, "task did not report"))
            })
            .collect();
        report
    }
}

pub fn state_path(results_dir: &Path) -> PathBuf {
    results_dir.join("docking_state.json")
}
