use crate::config::{CnnScoring, PoseSortOrder, SearchParams};
use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn residue_atom_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]:-?\d+[A-Za-z]?:[A-Za-z0-9'*]+$").expect("valid regex")
    })
}

fn cartesian_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let num = r"-?\d+(?:\.\d+)?";
        Regex::new(&format!(r"^{num},\s*{num},\s*{num}$")).expect("valid regex")
    })
}

/// Receptor atom the ligand bonds to and the ligand atom that bonds.
/// GNINA refuses a receptor atom without a ligand pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovalentTarget {
    /// `chain:resnum:atom_name` (e.g. `A:123:SG`) or `x,y,z`.
    pub receptor_atom: String,
    /// SMARTS for the bonding ligand atom.
    pub ligand_pattern: String,
    pub ligand_position: Option<[f64; 3]>,
    /// Let GNINA optimize the covalent complex with OpenBabel.
    pub optimize: bool,
}

impl CovalentTarget {
    pub fn new(receptor_atom: &str, ligand_pattern: &str) -> Result<Self> {
        let receptor_atom = receptor_atom.trim();
        let ligand_pattern = ligand_pattern.trim();
        if !residue_atom_re().is_match(receptor_atom) && !cartesian_re().is_match(receptor_atom) {
            bail!(
                "invalid covalent receptor atom {:?}: expected chain:resnum:atom (A:123:SG) or x,y,z",
                receptor_atom
            );
        }
        if ligand_pattern.is_empty() {
            bail!("covalent docking needs a SMARTS pattern for the bonding ligand atom");
        }
        Ok(Self {
            receptor_atom: receptor_atom.to_string(),
            ligand_pattern: ligand_pattern.to_string(),
            ligand_position: None,
            optimize: false,
        })
    }

    /// `A:123` + `SG` -> `A:123:SG`.
    pub fn from_residue(residue: &str, atom: &str, ligand_pattern: &str) -> Result<Self> {
        Self::new(&format!("{}:{}", residue.trim(), atom.trim()), ligand_pattern)
    }

    /// Covalent poses need more sampling and a stricter diversity filter.
    pub fn search_params(base: &SearchParams) -> SearchParams {
        SearchParams {
            exhaustiveness: 64,
            num_modes: 30,
            cnn_scoring: CnnScoring::Refinement,
            min_rmsd_filter: 0.5,
            pose_sort_order: PoseSortOrder::CNNscore,
            ..base.clone()
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--covalent_rec_atom".to_string(),
            self.receptor_atom.clone(),
            "--covalent_lig_atom_pattern".to_string(),
            self.ligand_pattern.clone(),
        ];
        if let Some([x, y, z]) = self.ligand_position {
            args.push("--covalent_lig_atom_position".to_string());
            args.push(format!("{},{},{}", x, y, z));
        }
        if self.optimize {
            args.push("--covalent_optimize_lig".to_string());
        }
        args
    }
}
