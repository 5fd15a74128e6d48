//! Merging finished molecule optimisations back into their crystals.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    fs, io,
    path::{Path, PathBuf},
};

use log::{info, warn};
use walkdir::WalkDir;

use crate::{
    geom::trajectory_string,
    scan::{scan, JobDir, ScanError, ScanResults},
};

pub use crystal::{Crystal, Decompose, Molecule, MoleculeId, ReferenceFile, SymmetryOp};

mod crystal;

/// where the jobs of a crystal live, relative to its directory
pub const MOLECULES_DIR: &str = "rejig_molecules";

#[derive(Debug, thiserror::Error)]
pub enum ReconstructError {
    #[error("failed to access {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse reference file {}: {source}", .path.display())]
    Reference {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("molecule {id} appears twice in {}", .path.display())]
    DuplicateMolecule { path: PathBuf, id: MoleculeId },

    #[error("can't read a molecule id from {}", .0.display())]
    MoleculeId(PathBuf),

    #[error("molecule {0} is not in the reference structure")]
    UnknownMolecule(MoleculeId),

    #[error("molecule {id} has {want} atoms in the reference but {got} in its log")]
    AtomCount {
        id: MoleculeId,
        want: usize,
        got: usize,
    },

    #[error("no geometry in the log of {}", .0.display())]
    NoGeometry(PathBuf),

    #[error("no job found in {}", .0.display())]
    NoJob(PathBuf),

    #[error("failed to classify {}: {msg}", .path.display())]
    Classify { path: PathBuf, msg: String },

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("{} can't be used as a reconstruction root", .0.display())]
    InvalidRoot(PathBuf),
}

/// Where the molecules of one crystal stand
#[derive(Debug, Default, PartialEq)]
pub struct CrystalRecord {
    pub not_begun: BTreeSet<MoleculeId>,
    pub incomplete: BTreeSet<MoleculeId>,
    pub complete: BTreeSet<MoleculeId>,
    /// job directory of each complete molecule
    pub jobs: BTreeMap<MoleculeId, PathBuf>,
}

/// the molecule a job belongs to, named by the directory above the
/// `<functional>_<basis>` job directory
fn molecule_id(job: &Path) -> Result<MoleculeId, ReconstructError> {
    job.parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ReconstructError::MoleculeId(job.to_path_buf()))
}

impl CrystalRecord {
    pub fn from_scan(results: &ScanResults) -> Result<Self, ReconstructError> {
        if let Some((path, msg)) = results.errors.first() {
            return Err(ReconstructError::Classify {
                path: path.clone(),
                msg: msg.clone(),
            });
        }
        let mut ret = Self::default();
        let mut seen = BTreeSet::new();
        for (paths, set) in [
            (&results.not_begun, &mut ret.not_begun),
            (&results.unsuccessful, &mut ret.incomplete),
            (&results.successful, &mut ret.complete),
        ] {
            for path in paths {
                let id = molecule_id(path)?;
                if !seen.insert(id) {
                    return Err(ReconstructError::DuplicateMolecule {
                        path: path.clone(),
                        id,
                    });
                }
                set.insert(id);
            }
        }
        for path in &results.successful {
            ret.jobs.insert(molecule_id(path)?, path.clone());
        }
        Ok(ret)
    }

    /// whether the crystal can be rebuilt now. molecules that never reached
    /// a converged geometry always block it, unconverged ones only unless
    /// `force` is set
    pub fn is_reconstructable(&self, force: bool) -> bool {
        self.not_begun.is_empty() && (force || self.incomplete.is_empty())
    }
}

/// A crystal left alone because some of its molecules are not done
#[derive(Debug, PartialEq)]
pub struct Deferred {
    pub crystal: String,
    pub incomplete: Vec<MoleculeId>,
    pub not_begun: Vec<MoleculeId>,
}

#[derive(Debug, Default)]
pub struct ReconstructionReport {
    pub output: PathBuf,
    pub reconstructed: Vec<String>,
    pub deferred: Vec<Deferred>,
    pub failed: Vec<(String, ReconstructError)>,
}

fn join_ids(ids: &[MoleculeId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Display for ReconstructionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.deferred.is_empty() && self.failed.is_empty() {
            return writeln!(
                f,
                "all {} crystals were reconstructed into {}",
                self.reconstructed.len(),
                self.output.display()
            );
        }
        writeln!(
            f,
            "{} crystals were reconstructed into {}",
            self.reconstructed.len(),
            self.output.display()
        )?;
        if !self.deferred.is_empty() {
            writeln!(f, "crystals not reconstructed yet:")?;
        }
        for d in &self.deferred {
            writeln!(f, "  {}", d.crystal)?;
            if !d.incomplete.is_empty() {
                writeln!(f, "    incomplete: {}", join_ids(&d.incomplete))?;
            }
            if !d.not_begun.is_empty() {
                writeln!(f, "    not begun: {}", join_ids(&d.not_begun))?;
            }
        }
        if self
            .deferred
            .iter()
            .any(|d| d.not_begun.is_empty() && !d.incomplete.is_empty())
        {
            writeln!(
                f,
                "rerun with --process_all_crystals true to reconstruct \
		 crystals whose only unfinished molecules are incomplete"
            )?;
        }
        for (name, e) in &self.failed {
            writeln!(f, "failed to reconstruct {name}: {e}")?;
        }
        Ok(())
    }
}

/// The three directories written next to the reconstruction root
struct Outputs {
    crystals: PathBuf,
    molecules: PathBuf,
    trajectories: PathBuf,
}

impl Outputs {
    fn new(root: &Path) -> Result<Self, ReconstructError> {
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ReconstructError::InvalidRoot(root.to_path_buf()))?;
        let sibling = |suffix: &str| root.with_file_name(format!("{name}{suffix}"));
        Ok(Self {
            crystals: sibling("_reconstructed"),
            molecules: sibling("_reconstructed_molecules"),
            trajectories: sibling("_reconstructed_molecules_trajectory"),
        })
    }

    /// remove anything left by a previous run and start empty
    fn recreate(&self) -> Result<(), ReconstructError> {
        for dir in [&self.crystals, &self.molecules, &self.trajectories] {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(io_err(dir))?;
            }
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        Ok(())
    }
}

fn io_err(path: &Path) -> impl Fn(io::Error) -> ReconstructError + '_ {
    move |source| ReconstructError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write(path: &Path, contents: &str) -> Result<(), ReconstructError> {
    fs::write(path, contents).map_err(io_err(path))
}

enum CrystalOutcome {
    Written,
    Deferred(CrystalRecord),
}

/// Rebuilds every crystal under a root whose molecules have all finished
pub struct Reconstructor<D = ReferenceFile> {
    decomposer: D,
}

impl Default for Reconstructor<ReferenceFile> {
    fn default() -> Self {
        Self::new(ReferenceFile)
    }
}

impl<D: Decompose> Reconstructor<D> {
    pub fn new(decomposer: D) -> Self {
        Self { decomposer }
    }

    fn crystal(
        &self,
        dir: &Path,
        name: &str,
        force: bool,
        out: &Outputs,
    ) -> Result<CrystalOutcome, ReconstructError> {
        let mut crystal = self.decomposer.decompose(dir, name)?;
        let jobs = dir.join(MOLECULES_DIR);
        let results = if jobs.exists() {
            scan(&jobs)?
        } else {
            ScanResults::default()
        };
        let record = CrystalRecord::from_scan(&results)?;
        if !record.is_reconstructable(force) {
            return Ok(CrystalOutcome::Deferred(record));
        }

        let mut trajectories = Vec::new();
        for (&id, path) in &record.jobs {
            let job = JobDir::at(path)
                .ok_or_else(|| ReconstructError::NoJob(path.clone()))?;
            let log = job.log();
            let traj = job.solver.read_trajectory(&log).map_err(io_err(&log))?;
            let last = traj.last().ok_or(ReconstructError::NoGeometry(log))?;
            crystal.replace_coords(id, last)?;
            trajectories.push((id, traj));
        }

        write(
            &out.crystals.join(format!("{name}.xyz")),
            &crystal.to_extxyz(),
        )?;
        let mol_dir = out.molecules.join(name);
        fs::create_dir_all(&mol_dir).map_err(io_err(&mol_dir))?;
        for mol in &crystal.molecules {
            let id = mol.molecule_id();
            write(
                &mol_dir.join(format!("{id}.xyz")),
                &mol.geom().to_xyz(&format!("{name} molecule {id}")),
            )?;
        }
        for (id, traj) in trajectories {
            write(
                &out.trajectories.join(format!("{name}_{id}_traj.xyz")),
                &trajectory_string(&traj),
            )?;
        }
        Ok(CrystalOutcome::Written)
    }

    /// Reconstruct every crystal directory directly under `root`. Crystals
    /// with unfinished molecules are deferred, and a crystal that fails does
    /// not stop the others.
    pub fn run(
        &self,
        root: &Path,
        force: bool,
    ) -> Result<ReconstructionReport, ReconstructError> {
        let out = Outputs::new(root)?;
        let mut names = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| io_err(root)(e.into()))?;
            if entry.file_type().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.recreate()?;

        let mut report = ReconstructionReport {
            output: out.crystals.clone(),
            ..Default::default()
        };
        for name in names {
            match self.crystal(&root.join(&name), &name, force, &out) {
                Ok(CrystalOutcome::Written) => {
                    info!("reconstructed {name}");
                    report.reconstructed.push(name);
                }
                Ok(CrystalOutcome::Deferred(record)) => {
                    info!("deferring {name}");
                    report.deferred.push(Deferred {
                        crystal: name,
                        incomplete: record.incomplete.into_iter().collect(),
                        not_begun: record.not_begun.into_iter().collect(),
                    });
                }
                Err(e) => {
                    warn!("failed to reconstruct {name}: {e}");
                    report.failed.push((name, e));
                }
            }
        }
        Ok(report)
    }
}
