use crate::error::FailureKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Outcome of one dispatch. Produced only by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub pair_id: String,
    pub receptor: String,
    pub ligand: String,
    pub site_id: String,
    pub mode: String,
    pub failure: Option<FailureKind>,
    pub exit_code: Option<i32>,
    pub elapsed_secs: f64,
    pub pose_path: PathBuf,
    pub log_path: PathBuf,
    pub stderr_path: PathBuf,
    /// GPU was requested but the run went to CPU.
    pub device_fallback: bool,
    pub command: String,
    /// Output came from an earlier run; nothing was started this time.
    #[serde(default)]
    pub resumed: bool,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn status(&self) -> &'static str {
        match &self.failure {
            None => "success",
            Some(kind) => kind.label(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn from_results(results: &[TaskResult], skipped: usize) -> Self {
        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        Self {
            total: results.len() + skipped,
            succeeded,
            failed: results.len() - succeeded,
            skipped,
        }
    }
}

/// Everything one workflow invocation produced, as written to
/// `results/{workflow}_results.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResults {
    pub run_id: String,
    pub workflow: String,
    pub metadata: Value,
    pub summary: Summary,
    pub results: Vec<TaskResult>,
}

impl WorkflowResults {
    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())
            .context(format!("Failed to open results file: {:?}", path.as_ref()))?;
        let reader = BufReader::new(file);
        let results: WorkflowResults = serde_json::from_reader(reader)?;
        Ok(results)
    }

    pub fn save_to_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())
            .context(format!("Failed to create results file: {:?}", path.as_ref()))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pair_id: &str, failure: Option<FailureKind>) -> TaskResult {
        TaskResult {
            pair_id: pair_id.to_string(),
            receptor: "rec.pdbqt".to_string(),
            ligand: "lig.pdbqt".to_string(),
            site_id: "site_1".to_string(),
            mode: "standard".to_string(),
            failure,
            exit_code: Some(0),
            elapsed_secs: 1.5,
            pose_path: PathBuf::from("gnina_out/x_poses.sdf"),
            log_path: PathBuf::from("logs/x.log"),
            stderr_path: PathBuf::from("logs/x.stderr"),
            device_fallback: false,
            command: "gnina --receptor rec.pdbqt".to_string(),
            resumed: false,
        }
    }

    #[test]
    fn summary_counts_skips_separately() {
        let results = vec![
            sample("a", None),
            sample("b", Some(FailureKind::Timeout { secs: 300 })),
            sample("c", None),
        ];
        let summary = Summary::from_results(&results, 4);
        assert_eq!(
            summary,
            Summary {
                total: 7,
                succeeded: 2,
                failed: 1,
                skipped: 4
            }
        );
        assert_eq!(results[1].status(), "timeout");
    }

    #[test]
    fn workflow_results_survive_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standard_results.json");
        let results = vec![
            sample("a", None),
            sample("b", Some(FailureKind::NonZeroExit { code: Some(2) })),
        ];
        let doc = WorkflowResults {
            run_id: "run".to_string(),
            workflow: "standard".to_string(),
            metadata: serde_json::json!({"cnn_scoring": "rescore"}),
            summary: Summary::from_results(&results, 0),
            results,
        };
        doc.save_to_json(&path).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["results"][1]["failure"]["kind"], "non_zero_exit");

        let back = WorkflowResults::load_from_json(&path).unwrap();
        assert_eq!(back.results, doc.results);
        assert_eq!(back.summary.failed, 1);
    }
}
