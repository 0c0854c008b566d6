mod aggregate;
mod config;
mod device;
mod dispatch;
mod error;
mod pairlist;
mod pool;
mod protocols;
mod results;
mod runners;
#[cfg(all(test, unix))]
mod testutil;
mod tiered;

use crate::aggregate::{rows_for_pairs, rows_from_results, scan_output_dir, Report, ResultRow};
use crate::config::{CnnScoring, Config, DevicePreference};
use crate::dispatch::Dispatcher;
use crate::pairlist::PairRecord;
use crate::pool::{state_path, RunState, WorkerPool};
use crate::protocols::{CovalentTarget, DockingMode};
use crate::results::WorkflowResults;
use crate::runners::{DockingRun, Runner};
use crate::tiered::{Stage, TieredRun};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(version, about = "Batch GNINA docking over a receptor/ligand pair list", long_about = None)]
struct Args {
    /// JSON config file.
    #[arg(short, long, env = "GNINA_BATCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Pair list CSV, relative to the work dir.
    #[arg(long, global = true)]
    pairlist: Option<PathBuf>,

    /// Dispatches in flight at once.
    #[arg(short = 'j', long, global = true)]
    concurrency: Option<usize>,

    /// Per-pair timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Run on CPU even if a GPU is available.
    #[arg(long, global = true)]
    cpu: bool,

    #[arg(long, global = true)]
    cpu_cores: Option<usize>,

    #[arg(long, global = true)]
    gpu_device: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the pair list and print how many pairs it holds.
    Validate,
    /// Standard docking of every pair.
    Dock {
        #[arg(long, value_enum)]
        cnn_mode: Option<CnnScoring>,
        #[arg(long)]
        exhaustiveness: Option<u32>,
        #[arg(long)]
        num_modes: Option<u32>,
        #[arg(long)]
        seed: Option<i64>,
    },
    /// Score the supplied ligand poses without searching.
    ScoreOnly {
        #[arg(long, value_enum)]
        cnn_mode: Option<CnnScoring>,
    },
    /// Covalent docking against one receptor atom.
    Covalent {
        /// `chain:resnum:atom` or `x,y,z`.
        #[arg(long, conflicts_with = "residue")]
        receptor_atom: Option<String>,
        /// `chain:resnum`, combined with `--atom`.
        #[arg(long, requires = "atom")]
        residue: Option<String>,
        #[arg(long)]
        atom: Option<String>,
        /// SMARTS of the ligand atom that bonds.
        #[arg(long)]
        lig_pattern: String,
        /// `x,y,z` of the ligand atom that bonds.
        #[arg(long)]
        lig_position: Option<String>,
        #[arg(long)]
        covopt: bool,
    },
    /// Staged screening: A (rescore), B (refinement), C (all).
    Tiered {
        #[arg(long, value_enum, value_delimiter = ',', ignore_case = true, default_values_t = [Stage::A, Stage::B, Stage::C])]
        stages: Vec<Stage>,
    },
    /// Build the results table and quality report from existing outputs.
    Aggregate {
        /// A saved `{workflow}_results.json` to report on.
        #[arg(long)]
        results: Option<PathBuf>,
        /// Tag suffix of the pose files, e.g. `_scored` or `_stage_b`.
        #[arg(long, default_value = "")]
        suffix: String,
    },
}

fn parse_position(value: &str) -> Result<[f64; 3]> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .context(format!("Invalid position {:?}", value))?;
    match parts.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => bail!("Position {:?} needs exactly three values", value),
    }
}

fn covalent_target(
    receptor_atom: Option<String>,
    residue: Option<String>,
    atom: Option<String>,
    lig_pattern: &str,
    lig_position: Option<String>,
    covopt: bool,
) -> Result<CovalentTarget> {
    let mut target = match (receptor_atom, residue, atom) {
        (Some(spec), _, _) => CovalentTarget::new(&spec, lig_pattern)?,
        (None, Some(residue), Some(atom)) => {
            CovalentTarget::from_residue(&residue, &atom, lig_pattern)?
        }
        _ => bail!("Covalent docking needs --receptor-atom or --residue with --atom"),
    };
    target.ligand_position = lig_position.as_deref().map(parse_position).transpose()?;
    target.optimize = covopt;
    Ok(target)
}

fn write_reports(config: &Config, rows: Vec<ResultRow>) -> Result<()> {
    let results_dir = config.results_path();
    std::fs::create_dir_all(&results_dir)
        .context(format!("Failed to create results dir {:?}", results_dir))?;

    let report = Report::build(rows);
    report.write_csv(&results_dir.join("results_table.csv"))?;
    report.write_json(&results_dir.join("quality_report.json"))?;
    report.log_summary();
    info!("Reports written to {:?}", results_dir);
    Ok(())
}

fn load_pairs(config: &Config) -> Result<Vec<PairRecord>> {
    let path = config.pairlist_path();
    let pairs = pairlist::load(&path, &config.default_extension)
        .context(format!("Invalid pair list {:?}", path))?;
    Ok(pairs)
}

async fn probe_gpu(config: &Config) -> bool {
    match config.device {
        DevicePreference::Gpu if !config.force_cpu => device::gpu_available().await,
        _ => false,
    }
}

/// One resumable docking run, reported and saved.
async fn run_docking(config: &Config, mode: DockingMode, workflow: &str) -> Result<()> {
    config.check_prerequisites()?;
    let pairs = load_pairs(config)?;

    let gpu = probe_gpu(config).await;
    let dispatcher = Arc::new(Dispatcher::new(config, mode, gpu)?);
    let state = Arc::new(RunState::scan(&config.output_path())?);
    let runner = DockingRun {
        pool: WorkerPool::new(config.concurrency),
        dispatcher: dispatcher.clone(),
        state: state.clone(),
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let metadata = serde_json::json!({
        "mode": dispatcher.label(),
        "search": dispatcher.params(),
        "device_fallback": dispatcher.device().fallback,
        "config": config,
    });
    finish(config, workflow, &run_id, metadata, &runner, &pairs).await?;

    let path = state_path(&config.results_path());
    state.save(&path, &run_id, pairs.len())?;
    info!("{} of {} pairs have poses", state.len(), pairs.len());
    Ok(())
}

async fn finish(
    config: &Config,
    workflow: &str,
    run_id: &str,
    metadata: serde_json::Value,
    runner: &dyn Runner,
    pairs: &[PairRecord],
) -> Result<()> {
    let output = runner.run(pairs).await?;
    write_reports(config, output.rows)?;

    let summary = output.report.summary();
    let doc = WorkflowResults {
        run_id: run_id.to_string(),
        workflow: workflow.to_string(),
        metadata,
        summary,
        results: output.report.all_results(),
    };
    let path = config
        .results_path()
        .join(format!("{}_results.json", workflow));
    doc.save_to_json(&path)?;

    info!(
        "Finished {}: {} succeeded, {} failed, {} skipped",
        workflow, summary.succeeded, summary.failed, summary.skipped
    );
    Ok(())
}

fn aggregate_only(config: &Config, results: Option<&Path>, suffix: &str) -> Result<()> {
    let rows = if let Some(path) = results {
        info!("Aggregating saved results {:?}", path);
        let doc = WorkflowResults::load_from_json(path)?;
        rows_from_results(&doc.results)
    } else if config.pairlist_path().is_file() {
        let pairs = load_pairs(config)?;
        // Only pose paths are needed; skip the GPU fallback warning.
        let offline = Config {
            device: DevicePreference::Cpu,
            ..config.clone()
        };
        let dispatcher =
            Dispatcher::new(&offline, DockingMode::Standard, false)?.with_tag_suffix(suffix);
        rows_for_pairs(&pairs, &dispatcher, &[])
    } else {
        scan_output_dir(&config.output_path())?
    };
    write_reports(config, rows)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_ref())?;
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(pairlist) = args.pairlist {
        config.pairlist = pairlist;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if args.cpu {
        config.device = DevicePreference::Cpu;
    }
    if args.cpu_cores.is_some() {
        config.cpu_cores = args.cpu_cores;
    }
    if let Some(gpu) = args.gpu_device {
        config.gpu_device = gpu;
    }

    config.work_dir = std::fs::canonicalize(&config.work_dir).context(format!(
        "Failed to canonicalize work dir: {:?}",
        config.work_dir
    ))?;
    info!("Work dir: {:?}", config.work_dir);

    match args.command {
        Commands::Validate => {
            let pairs = load_pairs(&config)?;
            info!("Pair list {:?} is valid", config.pairlist_path());
            println!("{}", pairs.len());
        }
        Commands::Dock {
            cnn_mode,
            exhaustiveness,
            num_modes,
            seed,
        } => {
            if let Some(mode) = cnn_mode {
                config.search.cnn_scoring = mode;
            }
            if let Some(n) = exhaustiveness {
                config.search.exhaustiveness = n;
            }
            if let Some(n) = num_modes {
                config.search.num_modes = n;
            }
            if let Some(seed) = seed {
                config.search.seed = seed;
            }
            run_docking(&config, DockingMode::Standard, "standard").await?;
        }
        Commands::ScoreOnly { cnn_mode } => {
            if let Some(mode) = cnn_mode {
                config.search.cnn_scoring = mode;
            }
            run_docking(&config, DockingMode::ScoreOnly, "score_only").await?;
        }
        Commands::Covalent {
            receptor_atom,
            residue,
            atom,
            lig_pattern,
            lig_position,
            covopt,
        } => {
            let target =
                covalent_target(receptor_atom, residue, atom, &lig_pattern, lig_position, covopt)?;
            info!("Covalent target: {}", target.receptor_atom);
            run_docking(&config, DockingMode::Covalent(target), "covalent").await?;
        }
        Commands::Tiered { stages } => {
            config.check_prerequisites()?;
            let pairs = load_pairs(&config)?;
            let run_id = uuid::Uuid::new_v4().to_string();
            let runner = TieredRun {
                config: config.clone(),
                pool: WorkerPool::new(config.concurrency),
                gpu_available: probe_gpu(&config).await,
                stages: stages.clone(),
                run_id: run_id.clone(),
            };
            let metadata = serde_json::json!({
                "stages": stages,
                "config": config,
            });
            finish(&config, "tiered", &run_id, metadata, &runner, &pairs).await?;
        }
        Commands::Aggregate { results, suffix } => {
            aggregate_only(&config, results.as_deref(), &suffix)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_need_three_numbers() {
        assert_eq!(parse_position("1, -2.5,3").unwrap(), [1.0, -2.5, 3.0]);
        assert!(parse_position("1,2").is_err());
        assert!(parse_position("1,2,x").is_err());
    }

    #[test]
    fn covalent_flags_build_a_target() {
        let target = covalent_target(
            None,
            Some("A:145".to_string()),
            Some("SG".to_string()),
            "[CH2]",
            Some("0,1,2".to_string()),
            true,
        )
        .unwrap();
        assert_eq!(target.receptor_atom, "A:145:SG");
        assert_eq!(target.ligand_pattern, "[CH2]");
        assert_eq!(target.ligand_position, Some([0.0, 1.0, 2.0]));
        assert!(target.optimize);

        assert!(covalent_target(None, None, None, "[CH2]", None, false).is_err());
        assert!(covalent_target(Some("A:1:SG".to_string()), None, None, "", None, false).is_err());
    }

    #[test]
    fn covalent_cli_requires_a_ligand_pattern() {
        let missing =
            Args::try_parse_from(["gnina-batch", "covalent", "--receptor-atom", "A:145:SG"]);
        assert!(missing.is_err());

        let args = Args::try_parse_from([
            "gnina-batch",
            "covalent",
            "--receptor-atom",
            "A:145:SG",
            "--lig-pattern",
            "[CH2]",
        ])
        .unwrap();
        match args.command {
            Commands::Covalent { lig_pattern, .. } => assert_eq!(lig_pattern, "[CH2]"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn cli_parses_stage_lists() {
        let args = Args::try_parse_from(["gnina-batch", "tiered", "--stages", "A,b"]).unwrap();
        match args.command {
            Commands::Tiered { stages } => assert_eq!(stages, vec![Stage::A, Stage::B]),
            other => panic!("unexpected: {:?}", other),
        }

        let args = Args::try_parse_from(["gnina-batch", "--cpu", "-j", "8", "validate"]).unwrap();
        assert!(args.cpu);
        assert_eq!(args.concurrency, Some(8));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn docking_run_writes_every_report() {
        use crate::testutil::Project;

        let project = Project::new();
        project.add_receptor("rec.pdbqt");
        project.add_ligand("lig.pdbqt", Some(0.8));
        std::fs::write(
            project.path().join("pairlist.csv"),
            "Receptor,Ligand,Center X,Center Y,Center Z,Size X,Size Y,Size Z\n\
             rec,lig,1,2,3,20,20,20\n\
             rec,absent,1,2,3,20,20,20\n",
        )
        .unwrap();

        run_docking(&project.config, DockingMode::Standard, "standard")
            .await
            .unwrap();

        let results = project.path().join("results");
        let table = std::fs::read_to_string(results.join("results_table.csv")).unwrap();
        assert_eq!(table.lines().count(), 3);
        assert!(table.starts_with("pair_id,receptor,ligand,site_id,mode,status"));

        let doc = WorkflowResults::load_from_json(results.join("standard_results.json")).unwrap();
        assert_eq!((doc.summary.succeeded, doc.summary.failed), (1, 1));

        let state: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(results.join("docking_state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(state["completed"], serde_json::json!(["rec_site_1_lig"]));

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(results.join("quality_report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report["succeeded"], 1);

        // A second run resumes the docked pair and still records it.
        run_docking(&project.config, DockingMode::Standard, "standard")
            .await
            .unwrap();
        let saved = results.join("standard_results.json");
        let doc = WorkflowResults::load_from_json(&saved).unwrap();
        assert_eq!(doc.summary.skipped, 1);
        let kept: Vec<(&str, bool)> = doc
            .results
            .iter()
            .map(|r| (r.pair_id.as_str(), r.resumed))
            .collect();
        assert_eq!(
            kept,
            vec![("rec_site_1_lig", true), ("rec_site_2_absent", false)]
        );

        aggregate_only(&project.config, Some(&saved), "").unwrap();
        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(results.join("quality_report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report["succeeded"], 1);
        assert_eq!(report["cnn_score"]["max"], 0.8);
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_stops_before_any_dispatch() {
        use crate::error::PrerequisiteError;
        use crate::testutil::Project;

        let project = Project::new();
        let config = Config {
            gnina_binary: project.path().join("bin/not-gnina"),
            ..project.config.clone()
        };
        let err = config.check_prerequisites().unwrap_err();
        assert!(matches!(err, PrerequisiteError::MissingBinary(_)));
    }
}
