//! Turns pose files and task results into the results table and the quality
//! report.
//!
//! Scores come from the SD data fields GNINA writes on every pose:
//!
//! ```text
//! > <minimizedAffinity>
//! -7.31
//!
//! > <CNNscore>
//! 0.8123
//! ```
//!
//! Rows are sorted by pair id before anything is computed, so the report does
//! not depend on the order tasks finished in.

use crate::dispatch::Dispatcher;
use crate::error::AggregationWarning;
use crate::pairlist::PairRecord;
use crate::results::TaskResult;
use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const MINIMIZED_AFFINITY: &str = "minimizedAffinity";
pub const CNN_SCORE: &str = "CNNscore";
pub const CNN_AFFINITY: &str = "CNNaffinity";

const LOW_MEAN_CNN: f64 = 0.3;
const LOW_CNN_SPREAD: f64 = 0.1;
const NO_HIGH_CNN: f64 = 0.5;
const LOW_RECEPTOR_SUCCESS: f64 = 50.0;
const LOW_OVERALL_SUCCESS: f64 = 70.0;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^>\s*<([^>]+)>").expect("valid regex"))
}

/// Scores carried by one pose record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseScores {
    pub minimized_affinity: Option<f64>,
    pub cnn_score: Option<f64>,
    pub cnn_affinity: Option<f64>,
}

/// Read the three score fields from every record of an SD file's text.
pub fn parse_sd_scores(content: &str) -> (Vec<PoseScores>, Vec<AggregationWarning>) {
    let mut poses = Vec::new();
    let mut warnings = Vec::new();

    for record in content.split("$$$$") {
        if record.trim().is_empty() {
            continue;
        }
        let mut pose = PoseScores::default();
        let mut lines = record.lines();
        while let Some(line) = lines.next() {
            let Some(caps) = tag_re().captures(line) else {
                continue;
            };
            let field = caps[1].trim();
            let slot = match field {
                MINIMIZED_AFFINITY => &mut pose.minimized_affinity,
                CNN_SCORE => &mut pose.cnn_score,
                CNN_AFFINITY => &mut pose.cnn_affinity,
                _ => continue,
            };
            let raw = lines.next().unwrap_or_default().trim();
            match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => *slot = Some(value),
                _ => {
                    let warning = AggregationWarning::NonFiniteScore {
                        field: field.to_string(),
                        value: raw.to_string(),
                    };
                    if !warnings.contains(&warning) {
                        warnings.push(warning);
                    }
                }
            }
        }
        poses.push(pose);
    }

    for (field, present) in [
        (MINIMIZED_AFFINITY, poses.iter().any(|p| p.minimized_affinity.is_some())),
        (CNN_SCORE, poses.iter().any(|p| p.cnn_score.is_some())),
        (CNN_AFFINITY, poses.iter().any(|p| p.cnn_affinity.is_some())),
    ] {
        let reported = warnings.iter().any(|w| {
            matches!(w, AggregationWarning::NonFiniteScore { field: f, .. } if f == field)
        });
        if !poses.is_empty() && !present && !reported {
            warnings.push(AggregationWarning::MissingScore {
                field: field.to_string(),
            });
        }
    }
    if poses.is_empty() {
        warnings.push(AggregationWarning::NoPoses);
    }
    (poses, warnings)
}

pub fn read_pose_file(path: &Path) -> (Vec<PoseScores>, Vec<AggregationWarning>) {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_sd_scores(&content),
        Err(e) => (
            Vec::new(),
            vec![AggregationWarning::UnreadablePoseFile {
                message: format!("{:?}: {}", path, e),
            }],
        ),
    }
}

/// One line of the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub pair_id: String,
    pub receptor: String,
    pub ligand: String,
    pub site_id: String,
    /// Dispatcher label (`standard`, `tiered_stage_b`, ...); empty when unknown.
    #[serde(default)]
    pub mode: String,
    pub status: String,
    pub elapsed_secs: Option<f64>,
    pub num_poses: usize,
    /// Lowest `minimizedAffinity` (kcal/mol).
    pub best_affinity: Option<f64>,
    pub best_cnn_score: Option<f64>,
    pub best_cnn_affinity: Option<f64>,
    pub pose_path: PathBuf,
    pub warnings: Vec<AggregationWarning>,
    #[serde(skip)]
    pub cnn_scores: Vec<f64>,
    #[serde(skip)]
    pub cnn_affinities: Vec<f64>,
}

impl ResultRow {
    fn empty(
        pair_id: &str,
        receptor: &str,
        ligand: &str,
        site_id: &str,
        mode: &str,
        pose_path: &Path,
    ) -> Self {
        Self {
            pair_id: pair_id.to_string(),
            receptor: receptor.to_string(),
            ligand: ligand.to_string(),
            site_id: site_id.to_string(),
            mode: mode.to_string(),
            status: "success".to_string(),
            elapsed_secs: None,
            num_poses: 0,
            best_affinity: None,
            best_cnn_score: None,
            best_cnn_affinity: None,
            pose_path: pose_path.to_path_buf(),
            warnings: Vec::new(),
            cnn_scores: Vec::new(),
            cnn_affinities: Vec::new(),
        }
    }

    fn fill_scores(&mut self) {
        let (poses, warnings) = read_pose_file(&self.pose_path);
        self.num_poses = poses.len();
        self.cnn_scores = poses.iter().filter_map(|p| p.cnn_score).collect();
        self.cnn_affinities = poses.iter().filter_map(|p| p.cnn_affinity).collect();
        self.best_affinity = poses
            .iter()
            .filter_map(|p| p.minimized_affinity)
            .reduce(f64::min);
        self.best_cnn_score = self.cnn_scores.iter().copied().reduce(f64::max);
        self.best_cnn_affinity = self.cnn_affinities.iter().copied().reduce(f64::max);
        self.warnings = warnings;
    }

    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }

    /// Row for a finished task. Scores are read only when it succeeded.
    pub fn from_result(result: &TaskResult) -> Self {
        let mut row = Self::empty(
            &result.pair_id,
            &result.receptor,
            &result.ligand,
            &result.site_id,
            &result.mode,
            &result.pose_path,
        );
        row.status = result.status().to_string();
        row.elapsed_secs = (!result.resumed).then_some(result.elapsed_secs);
        if result.succeeded() {
            row.fill_scores();
        }
        row
    }

    /// Row for a pose file already on disk, such as a resumed pair.
    pub fn from_pose_file(pair: &PairRecord, mode: &str, pose_path: &Path) -> Self {
        let mut row = Self::empty(
            &pair.pair_id(),
            &pair.receptor,
            &pair.ligand,
            &pair.site_id,
            mode,
            pose_path,
        );
        row.fill_scores();
        row
    }
}

pub fn rows_from_results(results: &[TaskResult]) -> Vec<ResultRow> {
    results.iter().map(ResultRow::from_result).collect()
}

/// Rows for every pair of a run: dispatched pairs from their results, the
/// rest from pose files left by earlier runs. Pairs with neither are left out.
pub fn rows_for_pairs(
    pairs: &[PairRecord],
    dispatcher: &Dispatcher,
    results: &[TaskResult],
) -> Vec<ResultRow> {
    let by_id: HashMap<&str, &TaskResult> =
        results.iter().map(|r| (r.pair_id.as_str(), r)).collect();
    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for pair in pairs {
        let pair_id = pair.pair_id();
        if !seen.insert(pair_id.clone()) {
            continue;
        }
        if let Some(result) = by_id.get(pair_id.as_str()) {
            rows.push(ResultRow::from_result(result));
            continue;
        }
        let pose_path = dispatcher.pose_path(pair);
        if pose_path.is_file() {
            rows.push(ResultRow::from_pose_file(pair, dispatcher.label(), &pose_path));
        }
    }
    rows
}

/// Rows straight from `*_poses.sdf` files, with no pair list or run behind
/// them. Receptor and ligand are unknown, so the per-receptor breakdown
/// stays empty.
pub fn scan_output_dir(dir: &Path) -> Result<Vec<ResultRow>> {
    let pattern = dir.join("*_poses.sdf");
    let mut rows = Vec::new();
    for entry in glob::glob(&pattern.to_string_lossy()).context("Invalid output pattern")? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping unreadable output entry: {}", e);
                continue;
            }
        };
        let Some(tag) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix("_poses.sdf"))
        else {
            continue;
        };
        let mut row = ResultRow::empty(tag, "", "", "", "", &path);
        row.fill_scores();
        rows.push(row);
    }
    info!("Found {} pose files in {:?}", rows.len(), dir);
    Ok(rows)
}

/// numpy-style summary: population std, linear-interpolated percentiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub q25: f64,
    pub q75: f64,
}

impl Distribution {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: sorted.len(),
            mean,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            median: percentile(&sorted, 50.0),
            q25: percentile(&sorted, 25.0),
            q75: percentile(&sorted, 75.0),
        })
    }
}

/// `sorted` must be ascending and non-empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceptorBreakdown {
    /// Distinct pair ids; a pair docked at several stages counts once.
    pub total_pairs: usize,
    /// Pairs with at least one successful row.
    pub successful_pairs: usize,
    /// Percent.
    pub success_rate: f64,
    pub avg_cnn_score: Option<f64>,
    pub max_cnn_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowWarnings {
    pub pair_id: String,
    pub warnings: Vec<AggregationWarning>,
}

/// Contents of `quality_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Percent; zero when there are no rows.
    pub success_rate: f64,
    pub mean_runtime_secs: Option<f64>,
    pub median_runtime_secs: Option<f64>,
    /// Over every pose of every successful pair.
    pub cnn_score: Option<Distribution>,
    pub cnn_affinity: Option<Distribution>,
    pub receptors: BTreeMap<String, ReceptorBreakdown>,
    pub warnings: Vec<RowWarnings>,
    pub quality_issues: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(skip)]
    pub rows: Vec<ResultRow>,
}

/// Report for a set of finished tasks.
pub fn aggregate(results: &[TaskResult]) -> Report {
    Report::build(rows_from_results(results))
}

impl Report {
    pub fn build(mut rows: Vec<ResultRow>) -> Self {
        rows.sort_by(|a, b| {
            a.pair_id
                .cmp(&b.pair_id)
                .then_with(|| a.mode.cmp(&b.mode))
                .then_with(|| a.status.cmp(&b.status))
                .then_with(|| a.pose_path.cmp(&b.pose_path))
        });

        let total = rows.len();
        let succeeded = rows.iter().filter(|r| r.succeeded()).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            succeeded as f64 / total as f64 * 100.0
        };

        let runtimes: Vec<f64> = rows.iter().filter_map(|r| r.elapsed_secs).collect();
        let runtime = Distribution::from_values(&runtimes);

        let successful = || rows.iter().filter(|r| r.succeeded());
        let cnn_scores: Vec<f64> = successful().flat_map(|r| r.cnn_scores.clone()).collect();
        let cnn_affinities: Vec<f64> = successful()
            .flat_map(|r| r.cnn_affinities.clone())
            .collect();
        let cnn_score = Distribution::from_values(&cnn_scores);
        let cnn_affinity = Distribution::from_values(&cnn_affinities);

        let mut quality_issues = Vec::new();
        let mut recommendations = Vec::new();

        if let Some(dist) = &cnn_score {
            if dist.mean < LOW_MEAN_CNN {
                quality_issues.push(format!("Low average CNN scores (< {})", LOW_MEAN_CNN));
                recommendations
                    .push("Consider increasing exhaustiveness or using refinement mode".to_string());
            }
            if dist.std < LOW_CNN_SPREAD {
                quality_issues
                    .push("Low score variance - possible convergence issues".to_string());
                recommendations.push("Check binding site coordinates and box size".to_string());
            }
            if dist.max < NO_HIGH_CNN {
                quality_issues.push("No high-scoring poses found".to_string());
                recommendations
                    .push("Review ligand preparation and binding site definition".to_string());
            }
        }

        let mut grouped: BTreeMap<&str, Vec<&ResultRow>> = BTreeMap::new();
        for row in rows.iter().filter(|r| !r.receptor.is_empty()) {
            grouped.entry(row.receptor.as_str()).or_default().push(row);
        }
        let mut receptors = BTreeMap::new();
        for (receptor, group) in grouped {
            let pair_ids: BTreeSet<&str> = group.iter().map(|r| r.pair_id.as_str()).collect();
            let successful_pairs = group
                .iter()
                .filter(|r| r.succeeded())
                .map(|r| r.pair_id.as_str())
                .collect::<BTreeSet<_>>()
                .len();
            let rate = successful_pairs as f64 / pair_ids.len() as f64 * 100.0;
            let scores: Vec<f64> = group
                .iter()
                .filter(|r| r.succeeded())
                .flat_map(|r| r.cnn_scores.iter().copied())
                .collect();
            let scores = Distribution::from_values(&scores);
            if rate < LOW_RECEPTOR_SUCCESS {
                quality_issues.push(format!(
                    "Low success rate for {} ({:.1}%)",
                    receptor, rate
                ));
                recommendations.push(format!("Check receptor preparation for {}", receptor));
            }
            receptors.insert(
                receptor.to_string(),
                ReceptorBreakdown {
                    total_pairs: pair_ids.len(),
                    successful_pairs,
                    success_rate: rate,
                    avg_cnn_score: scores.as_ref().map(|d| d.mean),
                    max_cnn_score: scores.as_ref().map(|d| d.max),
                },
            );
        }

        if total > 0 && success_rate < LOW_OVERALL_SUCCESS {
            quality_issues.push(format!("Low overall success rate ({:.1}%)", success_rate));
            recommendations.push("Review input structures and docking parameters".to_string());
        }

        let warnings = rows
            .iter()
            .filter(|r| !r.warnings.is_empty())
            .map(|r| RowWarnings {
                pair_id: r.pair_id.clone(),
                warnings: r.warnings.clone(),
            })
            .collect();

        Self {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate,
            mean_runtime_secs: runtime.as_ref().map(|d| d.mean),
            median_runtime_secs: runtime.as_ref().map(|d| d.median),
            cnn_score,
            cnn_affinity,
            receptors,
            warnings,
            quality_issues,
            recommendations,
            rows,
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Aggregated {} pairs: {} succeeded, {} failed ({:.1}%)",
            self.total, self.succeeded, self.failed, self.success_rate
        );
        if let Some(dist) = &self.cnn_score {
            info!(
                "CNN scores: mean {:.3}, std {:.3}, max {:.3}",
                dist.mean, dist.std, dist.max
            );
        }
        for issue in &self.quality_issues {
            warn!("Quality issue: {}", issue);
        }
    }

    /// `results_table.csv`, one line per row in pair id order.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .context(format!("Failed to create results table {:?}", path))?;
        for row in &self.rows {
            writer.serialize(CsvRow::from(row))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).context(format!("Failed to create report {:?}", path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    pair_id: &'a str,
    receptor: &'a str,
    ligand: &'a str,
    site_id: &'a str,
    mode: &'a str,
    status: &'a str,
    elapsed_secs: Option<f64>,
    num_poses: usize,
    best_affinity: Option<f64>,
    best_cnn_score: Option<f64>,
    best_cnn_affinity: Option<f64>,
    pose_path: String,
    warnings: String,
}

impl<'a> From<&'a ResultRow> for CsvRow<'a> {
    fn from(row: &'a ResultRow) -> Self {
        Self {
            pair_id: &row.pair_id,
            receptor: &row.receptor,
            ligand: &row.ligand,
            site_id: &row.site_id,
            mode: &row.mode,
            status: &row.status,
            elapsed_secs: row.elapsed_secs,
            num_poses: row.num_poses,
            best_affinity: row.best_affinity,
            best_cnn_score: row.best_cnn_score,
            best_cnn_affinity: row.best_cnn_affinity,
            pose_path: row.pose_path.to_string_lossy().to_string(),
            warnings: row
                .warnings
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    const TWO_POSES: &str = "lig\n  gnina\n\n  0  0  0  0  0  0  0  0  0  0999 V2000\nM  END\n\
> <minimizedAffinity>\n-7.5\n\n> <CNNscore>\n0.61\n\n> <CNNaffinity>\n5.2\n\n$$$$\n\
lig\n  gnina\n\n  0  0  0  0  0  0  0  0  0  0999 V2000\nM  END\n\
> <minimizedAffinity>\n-8.25\n\n> <CNNscore>\n0.42\n\n> <CNNaffinity>\n5.9\n\n$$$$\n";

    fn task(dir: &Path, pair_id: &str, receptor: &str, sdf: Option<&str>) -> TaskResult {
        let pose_path = dir.join(format!("{}_poses.sdf", pair_id));
        let failure = match sdf {
            Some(content) => {
                std::fs::write(&pose_path, content).unwrap();
                None
            }
            None => Some(FailureKind::NonZeroExit { code: Some(1) }),
        };
        TaskResult {
            pair_id: pair_id.to_string(),
            receptor: receptor.to_string(),
            ligand: "lig.pdbqt".to_string(),
            site_id: "site_1".to_string(),
            mode: "standard".to_string(),
            failure,
            exit_code: Some(0),
            elapsed_secs: 2.0,
            pose_path,
            log_path: dir.join("x.log"),
            stderr_path: dir.join("x.stderr"),
            device_fallback: false,
            command: "gnina".to_string(),
            resumed: false,
        }
    }

    #[test]
    fn reads_gnina_sd_fields() {
        let (poses, warnings) = parse_sd_scores(TWO_POSES);
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert_eq!(poses.len(), 2);
        assert_eq!(poses[1].minimized_affinity, Some(-8.25));
        assert_eq!(poses[0].cnn_score, Some(0.61));
        assert_eq!(poses[1].cnn_affinity, Some(5.9));
    }

    #[test]
    fn flags_bad_and_missing_fields() {
        let sdf = "x\nM  END\n> <minimizedAffinity>\nnan\n\n> <CNNscore>\n0.5\n\n$$$$\n";
        let (poses, warnings) = parse_sd_scores(sdf);
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].minimized_affinity, None);
        assert_eq!(
            warnings,
            vec![
                AggregationWarning::NonFiniteScore {
                    field: "minimizedAffinity".to_string(),
                    value: "nan".to_string()
                },
                AggregationWarning::MissingScore {
                    field: "CNNaffinity".to_string()
                },
            ]
        );

        let (poses, warnings) = parse_sd_scores("\n\n");
        assert!(poses.is_empty());
        assert_eq!(warnings, vec![AggregationWarning::NoPoses]);

        let (_, warnings) = read_pose_file(Path::new("/nonexistent/poses.sdf"));
        assert!(matches!(
            warnings[0],
            AggregationWarning::UnreadablePoseFile { .. }
        ));
    }

    #[test]
    fn distribution_matches_numpy() {
        let dist = Distribution::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(dist.count, 4);
        assert_eq!(dist.mean, 2.5);
        assert!((dist.std - 1.25f64.sqrt()).abs() < 1e-12);
        assert_eq!(dist.median, 2.5);
        assert_eq!(dist.q25, 1.75);
        assert_eq!(dist.q75, 3.25);
        assert_eq!((dist.min, dist.max), (1.0, 4.0));
        assert!(Distribution::from_values(&[]).is_none());
    }

    #[test]
    fn rows_take_best_scores() {
        let dir = tempfile::tempdir().unwrap();
        let row = ResultRow::from_result(&task(dir.path(), "a", "r1.pdbqt", Some(TWO_POSES)));
        assert_eq!(row.num_poses, 2);
        assert_eq!(row.best_affinity, Some(-8.25));
        assert_eq!(row.best_cnn_score, Some(0.61));
        assert_eq!(row.best_cnn_affinity, Some(5.9));

        let failed = ResultRow::from_result(&task(dir.path(), "b", "r1.pdbqt", None));
        assert_eq!(failed.status, "error");
        assert_eq!(failed.num_poses, 0);
        assert!(failed.warnings.is_empty());
    }

    #[test]
    fn report_is_independent_of_result_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut results = vec![
            task(dir.path(), "r1_site_1_a", "r1.pdbqt", Some(TWO_POSES)),
            task(dir.path(), "r1_site_1_b", "r1.pdbqt", None),
            task(dir.path(), "r2_site_1_c", "r2.pdbqt", Some(TWO_POSES)),
            task(dir.path(), "r2_site_1_d", "r2.pdbqt", Some("junk\n$$$$\n")),
        ];
        let forward = aggregate(&results);
        results.reverse();
        results.swap(0, 2);
        let shuffled = aggregate(&results);

        assert_eq!(forward, shuffled);
        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            serde_json::to_string(&shuffled).unwrap()
        );

        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        forward.write_csv(&a).unwrap();
        shuffled.write_csv(&b).unwrap();
        assert_eq!(
            std::fs::read_to_string(&a).unwrap(),
            std::fs::read_to_string(&b).unwrap()
        );
    }

    #[test]
    fn stages_of_one_pair_keep_a_stable_order() {
        let dir = tempfile::tempdir().unwrap();
        let stage = |mode: &str, score: f64| {
            let pose_path = dir.path().join(format!("r_site_1_l_{}_poses.sdf", mode));
            let sdf = format!(
                "x\n> <minimizedAffinity>\n-7\n\n> <CNNscore>\n{}\n\n> <CNNaffinity>\n6\n\n$$$$\n",
                score
            );
            std::fs::write(&pose_path, sdf).unwrap();
            TaskResult {
                mode: mode.to_string(),
                failure: None,
                pose_path,
                ..task(dir.path(), "r_site_1_l", "r.pdbqt", None)
            }
        };
        let mut results = vec![stage("tiered_stage_a", 0.6), stage("tiered_stage_b", 0.9)];

        let forward = aggregate(&results);
        results.reverse();
        let reversed = aggregate(&results);

        assert_eq!(forward.rows, reversed.rows);
        assert_eq!(forward, reversed);
        let modes: Vec<&str> = forward.rows.iter().map(|r| r.mode.as_str()).collect();
        assert_eq!(modes, vec!["tiered_stage_a", "tiered_stage_b"]);
        assert_eq!(forward.rows[1].best_cnn_score, Some(0.9));

        let breakdown = &forward.receptors["r.pdbqt"];
        assert_eq!((breakdown.total_pairs, breakdown.successful_pairs), (1, 1));
        assert_eq!(breakdown.success_rate, 100.0);

        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        forward.write_csv(&a).unwrap();
        reversed.write_csv(&b).unwrap();
        let table = std::fs::read_to_string(&a).unwrap();
        assert!(table.starts_with("pair_id,receptor,ligand,site_id,mode,status"));
        assert_eq!(table, std::fs::read_to_string(&b).unwrap());
    }

    #[test]
    fn quality_checks_use_fixed_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let low = "x\n> <minimizedAffinity>\n-3\n\n> <CNNscore>\n0.2\n\n> <CNNaffinity>\n3\n\n$$$$\n";
        let results = vec![
            task(dir.path(), "r1_site_1_a", "r1.pdbqt", Some(low)),
            task(dir.path(), "r1_site_1_b", "r1.pdbqt", None),
            task(dir.path(), "r1_site_1_c", "r1.pdbqt", None),
        ];
        let report = aggregate(&results);

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(
            report.quality_issues,
            vec![
                "Low average CNN scores (< 0.3)".to_string(),
                "Low score variance - possible convergence issues".to_string(),
                "No high-scoring poses found".to_string(),
                "Low success rate for r1.pdbqt (33.3%)".to_string(),
                "Low overall success rate (33.3%)".to_string(),
            ]
        );
        assert_eq!(report.recommendations.len(), 5);
        let r1 = &report.receptors["r1.pdbqt"];
        assert_eq!((r1.total_pairs, r1.successful_pairs), (3, 1));
        assert_eq!(r1.max_cnn_score, Some(0.2));
    }

    #[test]
    fn healthy_run_has_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        let good = "x\n> <minimizedAffinity>\n-9\n\n> <CNNscore>\n0.9\n\n> <CNNaffinity>\n7\n\n$$$$\n";
        let results = vec![
            task(dir.path(), "r_site_1_a", "r.pdbqt", Some(TWO_POSES)),
            task(dir.path(), "r_site_1_b", "r.pdbqt", Some(good)),
        ];
        let report = aggregate(&results);
        assert!(report.quality_issues.is_empty(), "{:?}", report.quality_issues);
        assert_eq!(report.cnn_score.as_ref().unwrap().count, 3);
        assert_eq!(report.mean_runtime_secs, Some(2.0));
    }

    #[test]
    fn scans_an_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r_site_1_a_poses.sdf"), TWO_POSES).unwrap();
        std::fs::write(dir.path().join("r_site_1_b_poses.sdf"), "").unwrap();

        let mut rows = scan_output_dir(dir.path()).unwrap();
        rows.sort_by(|a, b| a.pair_id.cmp(&b.pair_id));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pair_id, "r_site_1_a");
        assert_eq!(rows[0].best_cnn_score, Some(0.61));
        assert_eq!(rows[1].warnings, vec![AggregationWarning::NoPoses]);

        let report = Report::build(rows);
        assert!(report.receptors.is_empty());
        let path = dir.path().join("quality_report.json");
        report.write_json(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["warnings"][0]["warnings"][0]["warning"], "no_poses");
    }
}
