use crate::error::PrerequisiteError;
use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// GNINA `--cnn_scoring` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CnnScoring {
    None,
    Rescore,
    Refinement,
    All,
}

impl CnnScoring {
    pub fn as_str(&self) -> &'static str {
        match self {
            CnnScoring::None => "none",
            CnnScoring::Rescore => "rescore",
            CnnScoring::Refinement => "refinement",
            CnnScoring::All => "all",
        }
    }
}

/// GNINA `--pose_sort_order` values. Newer GNINA builds only accept the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum PoseSortOrder {
    #[value(name = "CNNscore")]
    CNNscore,
    #[value(name = "CNNaffinity")]
    CNNaffinity,
    #[value(name = "Energy")]
    Energy,
}

impl PoseSortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoseSortOrder::CNNscore => "CNNscore",
            PoseSortOrder::CNNaffinity => "CNNaffinity",
            PoseSortOrder::Energy => "Energy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Gpu,
    Cpu,
}

/// Search settings shared by the docking modes. Covalent docking and the
/// tiered stages start from a copy and override parts of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub exhaustiveness: u32,
    pub num_modes: u32,
    pub seed: i64,
    pub cnn_scoring: CnnScoring,
    pub cnn_rotation: u32,
    pub min_rmsd_filter: f64,
    pub pose_sort_order: PoseSortOrder,
    pub add_hydrogens: bool,
    pub strip_hydrogens: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            exhaustiveness: 32,
            num_modes: 20,
            seed: 42,
            cnn_scoring: CnnScoring::Rescore,
            cnn_rotation: 0,
            min_rmsd_filter: 1.0,
            pose_sort_order: PoseSortOrder::CNNscore,
            add_hydrogens: true,
            strip_hydrogens: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GNINA executable. A bare name is looked up on `PATH`.
    pub gnina_binary: PathBuf,
    /// Apptainer/Singularity image. When set, GNINA runs inside it.
    pub container_image: Option<PathBuf>,
    pub container_runtime: String,

    pub work_dir: PathBuf,
    pub pairlist: PathBuf,
    pub receptor_dir: PathBuf,
    pub ligand_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub results_dir: PathBuf,
    pub default_extension: String,

    pub concurrency: usize,
    pub timeout_secs: u64,
    pub device: DevicePreference,
    pub gpu_device: u32,
    /// Cores handed to `--cpu` when running on CPU. Defaults to an even
    /// share of the machine across workers.
    pub cpu_cores: Option<usize>,
    /// Set by `USE_CPU_MODE=1`: a GPU preference is treated as unavailable.
    #[serde(skip)]
    pub force_cpu: bool,

    pub search: SearchParams,
    /// Appended verbatim (shell-split) to every GNINA invocation.
    pub extra_args: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gnina_binary: PathBuf::from("gnina"),
            container_image: None,
            container_runtime: "apptainer".to_string(),
            work_dir: PathBuf::from("."),
            pairlist: PathBuf::from("pairlist.csv"),
            receptor_dir: PathBuf::from("receptors"),
            ligand_dir: PathBuf::from("ligands"),
            output_dir: PathBuf::from("gnina_out"),
            log_dir: PathBuf::from("logs"),
            results_dir: PathBuf::from("results"),
            default_extension: "pdbqt".to_string(),
            concurrency: 4,
            timeout_secs: 300,
            device: DevicePreference::Gpu,
            gpu_device: 0,
            cpu_cores: None,
            force_cpu: false,
            search: SearchParams::default(),
            extra_args: String::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        Ok(config)
    }

    pub fn load(file_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = file_path {
            info!("Loading config from file: {:?}", path);
            Self::from_file(path)?
        } else {
            Config::default()
        };

        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Override with environment variables if set.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("GNINA_BINARY") {
            self.gnina_binary = PathBuf::from(val);
        }
        if let Some(val) = lookup("GNINA_IMAGE") {
            self.container_image = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
        if let Some(val) = lookup("GNINA_WORK_DIR") {
            self.work_dir = PathBuf::from(val);
        }
        if lookup("USE_CPU_MODE").as_deref() == Some("1") {
            self.force_cpu = true;
        }
        if let Some(val) = lookup("GNINA_CPU_CORES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => self.cpu_cores = Some(n),
                _ => warn!("Ignoring invalid GNINA_CPU_CORES={:?}", val),
            }
        }
    }

    /// Resolve a configured path against the working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    pub fn pairlist_path(&self) -> PathBuf {
        self.resolve(&self.pairlist)
    }

    pub fn receptor_path(&self, receptor: &str) -> PathBuf {
        self.resolve(&self.receptor_dir).join(receptor)
    }

    pub fn ligand_path(&self, ligand: &str) -> PathBuf {
        self.resolve(&self.ligand_dir).join(ligand)
    }

    pub fn output_path(&self) -> PathBuf {
        self.resolve(&self.output_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    pub fn results_path(&self) -> PathBuf {
        self.resolve(&self.results_dir)
    }

    pub fn effective_cpu_cores(&self) -> usize {
        self.cpu_cores
            .unwrap_or_else(|| num_cpus::get() / self.concurrency.max(1))
            .max(1)
    }

    /// Everything a docking run needs before the first dispatch.
    pub fn check_prerequisites(&self) -> Result<(), PrerequisiteError> {
        match &self.container_image {
            Some(image) => {
                if !image.is_file() {
                    return Err(PrerequisiteError::MissingImage(image.clone()));
                }
                // A relative binary path lives inside the image.
                if self.gnina_binary.is_absolute() && !self.gnina_binary.exists() {
                    return Err(PrerequisiteError::MissingBinary(self.gnina_binary.clone()));
                }
            }
            None => {
                if find_executable(&self.gnina_binary).is_none() {
                    return Err(PrerequisiteError::MissingBinary(self.gnina_binary.clone()));
                }
            }
        }

        let pairlist = self.pairlist_path();
        if !pairlist.is_file() {
            return Err(PrerequisiteError::MissingInput(pairlist));
        }
        for dir in [&self.receptor_dir, &self.ligand_dir] {
            let dir = self.resolve(dir);
            if !dir.is_dir() {
                return Err(PrerequisiteError::MissingDirectory(dir));
            }
        }
        Ok(())
    }
}

/// Locate `program` either as a path or on `PATH`.
pub fn find_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"concurrency": 8, "search": {"cnn_scoring": "refinement", "pose_sort_order": "Energy"}}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.timeout_secs, 300);
        assert_eq!(config.search.cnn_scoring, CnnScoring::Refinement);
        assert_eq!(config.search.pose_sort_order, PoseSortOrder::Energy);
        assert_eq!(config.search.exhaustiveness, 32);
        assert_eq!(config.default_extension, "pdbqt");
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GNINA_BINARY", "/opt/gnina/bin/gnina"),
            ("GNINA_IMAGE", "/images/gnina.sif"),
            ("USE_CPU_MODE", "1"),
            ("GNINA_CPU_CORES", "6"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.gnina_binary, PathBuf::from("/opt/gnina/bin/gnina"));
        assert_eq!(
            config.container_image,
            Some(PathBuf::from("/images/gnina.sif"))
        );
        assert_eq!(config.device, DevicePreference::Gpu);
        assert!(config.force_cpu);
        assert_eq!(config.effective_cpu_cores(), 6);
    }

    #[test]
    fn invalid_core_count_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == "GNINA_CPU_CORES").then(|| "zero".to_string()));
        assert_eq!(config.cpu_cores, None);
        assert!(config.effective_cpu_cores() >= 1);
    }

    #[test]
    fn prerequisites_report_first_missing_piece() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("gnina");
        std::fs::write(&binary, "").unwrap();

        let mut config = Config {
            gnina_binary: binary,
            work_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        assert!(matches!(
            config.check_prerequisites(),
            Err(PrerequisiteError::MissingInput(_))
        ));

        std::fs::write(dir.path().join("pairlist.csv"), "").unwrap();
        assert!(matches!(
            config.check_prerequisites(),
            Err(PrerequisiteError::MissingDirectory(_))
        ));

        std::fs::create_dir(dir.path().join("receptors")).unwrap();
        std::fs::create_dir(dir.path().join("ligands")).unwrap();
        assert!(config.check_prerequisites().is_ok());

        config.container_image = Some(dir.path().join("missing.sif"));
        assert!(matches!(
            config.check_prerequisites(),
            Err(PrerequisiteError::MissingImage(_))
        ));

        config.container_image = None;
        config.gnina_binary = dir.path().join("not-there");
        assert!(matches!(
            config.check_prerequisites(),
            Err(PrerequisiteError::MissingBinary(_))
        ));
    }
}
