use crate::error::ValidationError;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

pub const REQUIRED_COLUMNS: [&str; 8] = [
    "receptor", "ligand", "center_x", "center_y", "center_z", "size_x", "size_y", "size_z",
];
const COORDINATE_COLUMNS: [&str; 6] = [
    "center_x", "center_y", "center_z", "size_x", "size_y", "size_z",
];

/// Extensions GNINA reads directly; anything else gets the default appended.
pub const KNOWN_EXTENSIONS: [&str; 7] = ["pdbqt", "pdb", "sdf", "mol2", "mol", "smi", "xyz"];

/// One docking task from the pair list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub receptor: String,
    pub ligand: String,
    pub center: [f64; 3],
    pub size: [f64; 3],
    pub site_id: String,
}

impl PairRecord {
    /// `{receptor}_{site_id}_{ligand}` with extensions stripped. Keys every
    /// file the pair produces.
    pub fn pair_id(&self) -> String {
        format!(
            "{}_{}_{}",
            file_stem(&self.receptor),
            self.site_id,
            file_stem(&self.ligand)
        )
    }
}

fn has_known_extension(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let base = lower.strip_suffix(".gz").unwrap_or(&lower);
    KNOWN_EXTENSIONS
        .iter()
        .any(|ext| base.ends_with(&format!(".{}", ext)))
}

/// Append `.{extension}` unless `name` already carries a known molecular
/// extension (or the default one). Applying it twice is the same as once.
pub fn normalize_extension(name: &str, extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    if extension.is_empty()
        || has_known_extension(name)
        || name.ends_with(&format!(".{}", extension))
    {
        name.to_string()
    } else {
        format!("{}.{}", name, extension)
    }
}

/// Filename without directories and without its molecular extension.
pub fn file_stem(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());

    let without_gz = match base.strip_suffix(".gz") {
        Some(stripped) if has_known_extension(stripped) => stripped.to_string(),
        _ => base.clone(),
    };
    if has_known_extension(&without_gz) {
        if let Some((stem, _)) = without_gz.rsplit_once('.') {
            return stem.to_string();
        }
    }
    without_gz
}

fn cell<'r>(
    columns: &HashMap<String, usize>,
    record: &'r csv::StringRecord,
    column: &str,
) -> &'r str {
    columns
        .get(column)
        .and_then(|&idx| record.get(idx))
        .unwrap_or("")
}

fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase().replace(' ', "_")
}

/// Parse and structurally validate a pair list. Stops at the first bad row.
pub fn load(path: &Path, default_extension: &str) -> Result<Vec<PairRecord>, ValidationError> {
    let file = File::open(path).map_err(|source| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let csv_err = |source| ValidationError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let columns: HashMap<String, usize> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .enumerate()
        .map(|(i, h)| (normalize_header(h), i))
        .collect();

    for column in REQUIRED_COLUMNS {
        if !columns.contains_key(column) {
            return Err(ValidationError::MissingColumn {
                column: column.to_string(),
            });
        }
    }
    let site_column = columns.get("site_id").copied();

    let mut pairs = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let row = i + 1;

        for column in REQUIRED_COLUMNS {
            if cell(&columns, &record, column).is_empty() {
                return Err(ValidationError::EmptyValue {
                    row,
                    column: column.to_string(),
                });
            }
        }

        let mut coords = [0.0f64; 6];
        for (slot, column) in coords.iter_mut().zip(COORDINATE_COLUMNS) {
            let value = cell(&columns, &record, column);
            *slot = match value.parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    return Err(ValidationError::NotNumeric {
                        row,
                        column: column.to_string(),
                        value: value.to_string(),
                    })
                }
            };
        }

        let site_id = site_column
            .and_then(|idx| record.get(idx))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("site_{}", row));

        pairs.push(PairRecord {
            receptor: normalize_extension(
                cell(&columns, &record, "receptor"),
                default_extension,
            ),
            ligand: normalize_extension(cell(&columns, &record, "ligand"), default_extension),
            center: [coords[0], coords[1], coords[2]],
            size: [coords[3], coords[4], coords[5]],
            site_id,
        });
    }

    info!("Loaded {} pairs from {:?}", pairs.len(), path);
    Ok(pairs)
}
