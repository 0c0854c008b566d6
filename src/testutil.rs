//! Scratch projects and a stand-in GNINA for tests.

use crate::config::{Config, DevicePreference};
use crate::pairlist::PairRecord;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes `--out`/`--log` like GNINA does. Behaviour is picked by the ligand
/// name: `slow` hangs, `fail` exits 3, `empty` exits 0 without output.
/// `partial` hangs and `abort` exits 3, both after writing poses.
/// The first line of the ligand file, if any, becomes the CNNscore.
pub const FAKE_GNINA: &str = r#"
out=""; log=""; lig=""
while [ $# -gt 0 ]; do
  case "$1" in
    --out) out="$2"; shift 2 ;;
    --log) log="$2"; shift 2 ;;
    --ligand) lig="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$(basename "$lig")" in
  *slow*) exec sleep 30 ;;
  *fail*) echo "failed to parse ligand" >&2; exit 3 ;;
  *empty*) exit 0 ;;
esac
score=$(head -n 1 "$lig")
[ -n "$score" ] || score=0.9
echo "mode |  affinity" > "$log"
for pose in 1 2; do
  cat >> "$out" <<SDF
lig
     gnina

  0  0  0  0  0  0  0  0  0  0999 V2000
M  END
> <minimizedAffinity>
-7.$pose

> <CNNscore>
$score

> <CNNaffinity>
6.$pose

\$\$\$\$
SDF
done
case "$(basename "$lig")" in
  *partial*) exec sleep 30 ;;
  *abort*) echo "aborted" >&2; exit 3 ;;
esac
echo "docked $lig"
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub struct Project {
    pub dir: TempDir,
    pub config: Config,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["receptors", "ligands", "gnina_out", "logs", "results", "bin"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let gnina = write_script(&dir.path().join("bin"), "gnina", FAKE_GNINA);

        let config = Config {
            gnina_binary: gnina,
            work_dir: dir.path().to_path_buf(),
            device: DevicePreference::Cpu,
            cpu_cores: Some(1),
            timeout_secs: 10,
            concurrency: 2,
            ..Config::default()
        };
        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn add_receptor(&self, name: &str) {
        std::fs::write(self.path().join("receptors").join(name), "RECEPTOR\n").unwrap();
    }

    /// `score` ends up as the CNNscore of every pose the fake GNINA writes.
    pub fn add_ligand(&self, name: &str, score: Option<f64>) {
        let content = score.map(|s| format!("{}\n", s)).unwrap_or_default();
        std::fs::write(self.path().join("ligands").join(name), content).unwrap();
    }

    pub fn pair(receptor: &str, ligand: &str, site: &str) -> PairRecord {
        PairRecord {
            receptor: receptor.to_string(),
            ligand: ligand.to_string(),
            center: [1.0, 2.0, 3.0],
            size: [20.0, 20.0, 20.0],
            site_id: site.to_string(),
        }
    }
}
