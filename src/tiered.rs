use crate::aggregate::{percentile, rows_for_pairs, rows_from_results, ResultRow};
use crate::config::{CnnScoring, Config, SearchParams};
use crate::dispatch::Dispatcher;
use crate::pairlist::PairRecord;
use crate::pool::{PoolReport, RunState, WorkerPool};
use crate::results::{Summary, WorkflowResults};
use crate::runners::{RunOutput, Runner};
use anyhow::Result;
use async_trait::async_trait;
use clap::ValueEnum;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    A,
    B,
    C,
}

/// Search settings and selection rules of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePreset {
    pub name: &'static str,
    pub cnn_scoring: CnnScoring,
    pub exhaustiveness: u32,
    pub num_modes: u32,
    /// Best CNN score a pair needs to enter this stage.
    pub cnn_score_threshold: f64,
    pub max_ligands_per_receptor: Option<usize>,
    /// Fraction of the receptor's score distribution a pair must reach.
    pub top_fraction: Option<f64>,
}

impl Stage {
    pub fn letter(&self) -> char {
        match self {
            Stage::A => 'a',
            Stage::B => 'b',
            Stage::C => 'c',
        }
    }

    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::A => None,
            Stage::B => Some(Stage::A),
            Stage::C => Some(Stage::B),
        }
    }

    pub fn tag_suffix(&self) -> String {
        format!("_stage_{}", self.letter())
    }

    pub fn preset(&self) -> StagePreset {
        match self {
            Stage::A => StagePreset {
                name: "Broad Screening",
                cnn_scoring: CnnScoring::Rescore,
                exhaustiveness: 12,
                num_modes: 8,
                cnn_score_threshold: 0.5,
                max_ligands_per_receptor: None,
                top_fraction: None,
            },
            Stage::B => StagePreset {
                name: "Focused Refinement",
                cnn_scoring: CnnScoring::Refinement,
                exhaustiveness: 24,
                num_modes: 15,
                cnn_score_threshold: 0.7,
                max_ligands_per_receptor: Some(5),
                top_fraction: Some(0.05),
            },
            Stage::C => StagePreset {
                name: "High-Accuracy Validation",
                cnn_scoring: CnnScoring::All,
                exhaustiveness: 48,
                num_modes: 20,
                cnn_score_threshold: 0.8,
                max_ligands_per_receptor: Some(2),
                top_fraction: Some(0.01),
            },
        }
    }

    pub fn search_params(&self, base: &SearchParams) -> SearchParams {
        let preset = self.preset();
        SearchParams {
            cnn_scoring: preset.cnn_scoring,
            exhaustiveness: preset.exhaustiveness,
            num_modes: preset.num_modes,
            ..base.clone()
        }
    }
}

/// Pairs that go on to `stage`, given the scored rows of the stage before.
///
/// Stage A, or no scored rows at all, keeps every pair. Otherwise a pair
/// needs scores of its own, a best CNN score at or above the threshold and
/// at or above the receptor's top-fraction quantile, and must be among the
/// receptor's best ligands when the stage caps them.
pub fn filter_for_stage(
    stage: Stage,
    previous: &[ResultRow],
    pairs: &[PairRecord],
) -> Vec<PairRecord> {
    if stage == Stage::A {
        return pairs.to_vec();
    }
    let scored: Vec<&ResultRow> = previous
        .iter()
        .filter(|r| r.succeeded() && !r.cnn_scores.is_empty())
        .collect();
    if scored.is_empty() {
        warn!(
            "No scored results before stage {:?}, using all {} pairs",
            stage,
            pairs.len()
        );
        return pairs.to_vec();
    }

    let preset = stage.preset();

    let mut best: HashMap<(&str, &str, &str), f64> = HashMap::new();
    let mut receptor_scores: HashMap<&str, Vec<f64>> = HashMap::new();
    let mut ligand_best: HashMap<&str, BTreeMap<&str, f64>> = HashMap::new();
    for row in &scored {
        let row_best = row.cnn_scores.iter().copied().fold(f64::MIN, f64::max);
        let key = (row.receptor.as_str(), row.ligand.as_str(), row.site_id.as_str());
        let entry = best.entry(key).or_insert(f64::MIN);
        *entry = entry.max(row_best);

        receptor_scores
            .entry(row.receptor.as_str())
            .or_default()
            .extend(row.cnn_scores.iter().copied());

        let by_ligand = ligand_best.entry(row.receptor.as_str()).or_default();
        let entry = by_ligand.entry(row.ligand.as_str()).or_insert(f64::MIN);
        *entry = entry.max(row_best);
    }

    let quantiles: HashMap<&str, f64> = match preset.top_fraction {
        Some(fraction) => receptor_scores
            .into_iter()
            .map(|(receptor, mut scores)| {
                scores.sort_by(f64::total_cmp);
                (receptor, percentile(&scores, (1.0 - fraction) * 100.0))
            })
            .collect(),
        None => HashMap::new(),
    };

    let top_ligands: HashMap<&str, Vec<&str>> = match preset.max_ligands_per_receptor {
        Some(cap) => ligand_best
            .into_iter()
            .map(|(receptor, ligands)| {
                let mut ranked: Vec<(&str, f64)> = ligands.into_iter().collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
                ranked.truncate(cap);
                (receptor, ranked.into_iter().map(|(l, _)| l).collect())
            })
            .collect(),
        None => HashMap::new(),
    };

    let selected: Vec<PairRecord> = pairs
        .iter()
        .filter(|pair| {
            let key = (pair.receptor.as_str(), pair.ligand.as_str(), pair.site_id.as_str());
            let Some(&score) = best.get(&key) else {
                return false;
            };
            if score < preset.cnn_score_threshold {
                return false;
            }
            if let Some(cut) = quantiles.get(pair.receptor.as_str()) {
                if score < *cut {
                    return false;
                }
            }
            if let Some(top) = top_ligands.get(pair.receptor.as_str()) {
                if !top.contains(&pair.ligand.as_str()) {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect();

    info!(
        "Stage {:?} filtering: {}/{} pairs selected",
        stage,
        selected.len(),
        pairs.len()
    );
    selected
}

/// What one stage ran and produced.
pub struct StageOutcome {
    pub stage: Stage,
    pub report: PoolReport,
    pub rows: Vec<ResultRow>,
}

/// Stages run in order; each one re-docks what the previous one let through.
pub struct TieredRun {
    pub config: Config,
    pub pool: WorkerPool,
    pub stages: Vec<Stage>,
    pub gpu_available: bool,
    pub run_id: String,
}

impl TieredRun {
    fn stage_results_path(&self, stage: Stage) -> std::path::PathBuf {
        self.config
            .results_path()
            .join(format!("stage_{}_results.json", stage.letter()))
    }

    /// Scored rows the stage before `stage` left on disk in an earlier
    /// invocation.
    fn load_previous(&self, stage: Stage) -> Vec<ResultRow> {
        let Some(previous) = stage.previous() else {
            return Vec::new();
        };
        let path = self.stage_results_path(previous);
        if !path.is_file() {
            return Vec::new();
        }
        match WorkflowResults::load_from_json(&path) {
            Ok(doc) => {
                info!("Loaded stage {:?} results from {:?}", previous, path);
                rows_from_results(&doc.results)
            }
            Err(e) => {
                warn!("Ignoring stage {:?} results: {:#}", previous, e);
                Vec::new()
            }
        }
    }

    pub async fn run_stages(&self, pairs: &[PairRecord]) -> Result<Vec<StageOutcome>> {
        let mut stages = self.stages.clone();
        stages.sort();
        stages.dedup();

        let mut outcomes: Vec<StageOutcome> = Vec::new();
        for stage in stages {
            let preset = stage.preset();
            info!(
                "Stage {:?} ({}): cnn_scoring {}, exhaustiveness {}, num_modes {}",
                stage,
                preset.name,
                preset.cnn_scoring.as_str(),
                preset.exhaustiveness,
                preset.num_modes
            );

            let previous = match outcomes.last() {
                Some(outcome) if Some(outcome.stage) == stage.previous() => outcome.rows.clone(),
                _ => self.load_previous(stage),
            };
            let selected = filter_for_stage(stage, &previous, pairs);
            if selected.is_empty() {
                warn!("No pairs left for stage {:?}, stopping", stage);
                break;
            }

            let dispatcher = Dispatcher::new(
                &self.config,
                crate::protocols::DockingMode::Standard,
                self.gpu_available,
            )?
            .with_params(stage.search_params(&self.config.search))
            .with_tag_suffix(&stage.tag_suffix())
            .with_label(&format!("tiered_stage_{}", stage.letter()));
            dispatcher.prepare().await?;
            let dispatcher = Arc::new(dispatcher);
            let state = Arc::new(RunState::scan(&self.config.output_path())?);

            let report = self
                .pool
                .run(&selected, dispatcher.clone(), state)
                .await;
            let rows = rows_for_pairs(&selected, &dispatcher, &report.results);

            let summary = report.summary();
            info!(
                "Stage {:?} done: {} succeeded, {} failed, {} skipped",
                stage, summary.succeeded, summary.failed, summary.skipped
            );

            let doc = WorkflowResults {
                run_id: self.run_id.clone(),
                workflow: format!("stage_{}", stage.letter()),
                metadata: serde_json::json!({
                    "stage": stage,
                    "preset": preset,
                    "selected_pairs": selected.len(),
                    "search": dispatcher.params(),
                }),
                summary,
                results: report.all_results(),
            };
            doc.save_to_json(self.stage_results_path(stage))?;

            outcomes.push(StageOutcome {
                stage,
                report,
                rows,
            });
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl Runner for TieredRun {
    /// All stage results in one report; the rows are the last stage's.
    async fn run(&self, pairs: &[PairRecord]) -> Result<RunOutput> {
        let outcomes = self.run_stages(pairs).await?;
        let mut report = PoolReport::default();
        let mut rows = Vec::new();
        for outcome in outcomes {
            report.results.extend(outcome.report.results);
            report.skipped.extend(outcome.report.skipped);
            report.resumed.extend(outcome.report.resumed);
            rows = outcome.rows;
        }
        let Summary {
            succeeded, failed, ..
        } = report.summary();
        info!("Tiered run finished: {} succeeded, {} failed", succeeded, failed);
        Ok(RunOutput { report, rows })
    }
}
