use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    classify::{classify, ClassifyOptions, Verdict},
    program::SolverKind,
    walk::{walk, DirEntries, Visit},
};

/// files written by [ScanResults::write_lists]
pub const COMPLETED_LIST: &str = "ReJig_completed_OPT_jobs.txt";
pub const INCOMPLETE_LIST: &str = "ReJig_incompleted_OPT_jobs.txt";
pub const PENDING_LIST: &str = "ReJig_pending_OPT_jobs.txt";

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to walk job tree: {0}")]
    Io(#[from] io::Error),
}

/// A directory holding one optimisation job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobDir {
    pub path: PathBuf,
    pub solver: SolverKind,
}

impl JobDir {
    pub fn input(&self) -> PathBuf {
        self.path.join(self.solver.input_file())
    }

    pub fn log(&self) -> PathBuf {
        self.path.join(self.solver.log_file())
    }

    /// `Ok(None)` when `entries` is not a job directory, `Err` with the path
    /// when it holds the inputs of more than one solver
    fn detect(entries: &DirEntries) -> Result<Option<Self>, PathBuf> {
        let mut found = SolverKind::ALL
            .into_iter()
            .filter(|s| entries.has_file(s.input_file()));
        match (found.next(), found.next()) {
            (None, _) => Ok(None),
            (Some(solver), None) => Ok(Some(Self {
                path: entries.path.clone(),
                solver,
            })),
            (Some(_), Some(_)) => Err(entries.path.clone()),
        }
    }

    /// the job in `path` itself, if there is exactly one
    pub fn at(path: &Path) -> Option<Self> {
        let mut found = SolverKind::ALL
            .into_iter()
            .filter(|s| path.join(s.input_file()).is_file());
        match (found.next(), found.next()) {
            (Some(solver), None) => Some(Self {
                path: path.to_path_buf(),
                solver,
            }),
            _ => None,
        }
    }
}

/// Every job directory under a root
#[derive(Debug, Default)]
pub struct JobDirs {
    pub jobs: Vec<JobDir>,
    /// directories with inputs for more than one solver
    pub ambiguous: Vec<PathBuf>,
}

/// Collect the job directories under `root`, without descending into them.
pub fn find_job_dirs(root: &Path) -> Result<JobDirs, ScanError> {
    let mut ret = JobDirs::default();
    walk::<ScanError, _>(root, |entries| {
        match JobDir::detect(entries) {
            Ok(None) => return Ok(Visit::Descend),
            Ok(Some(job)) => ret.jobs.push(job),
            Err(path) => {
                warn!("{} holds inputs for both solvers", path.display());
                ret.ambiguous.push(path);
            }
        }
        Ok(Visit::SkipSubtree)
    })?;
    Ok(ret)
}

#[derive(Debug, Default, PartialEq)]
pub struct ScanResults {
    pub successful: Vec<PathBuf>,
    pub unsuccessful: Vec<PathBuf>,
    pub not_begun: Vec<PathBuf>,
    /// job directories that could not be classified, and why
    pub errors: Vec<(PathBuf, String)>,
}

impl ScanResults {
    pub fn len(&self) -> usize {
        self.successful.len()
            + self.unsuccessful.len()
            + self.not_begun.len()
            + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// write one file per verdict into `dir`, listing a job directory per
    /// line
    pub fn write_lists(&self, dir: &Path) -> io::Result<()> {
        for (name, list) in [
            (COMPLETED_LIST, &self.successful),
            (INCOMPLETE_LIST, &self.unsuccessful),
            (PENDING_LIST, &self.not_begun),
        ] {
            let mut body = String::new();
            for path in list {
                body.push_str(&path.display().to_string());
                body.push('\n');
            }
            fs::write(dir.join(name), body)?;
        }
        Ok(())
    }
}

/// Classify every job under `root`. Per-job failures are collected in
/// [ScanResults::errors] rather than ending the scan. A job that wrote a log
/// without ever converging a step has run, so it counts as unsuccessful
/// rather than not begun.
pub fn scan(root: &Path) -> Result<ScanResults, ScanError> {
    let JobDirs { jobs, ambiguous } = find_job_dirs(root)?;
    let opts = ClassifyOptions {
        most_converged: true,
        image_count: true,
        ..Default::default()
    };
    let verdicts: Vec<_> = jobs
        .par_iter()
        .map(|job| (job, classify(&job.log(), job.solver, &opts)))
        .collect();

    let mut ret = ScanResults::default();
    for (job, verdict) in verdicts {
        debug!("{}: {verdict:?}", job.path.display());
        let path = job.path.clone();
        match verdict {
            Ok(Verdict::Complete(_)) => ret.successful.push(path),
            Ok(Verdict::Incomplete(_)) => ret.unsuccessful.push(path),
            Ok(Verdict::NotBegun) if job.log().exists() => {
                ret.unsuccessful.push(path)
            }
            Ok(Verdict::NotBegun) => ret.not_begun.push(path),
            Err(e) => ret.errors.push((path, e.to_string())),
        }
    }
    for path in ambiguous {
        ret.errors
            .push((path, "inputs for more than one solver".to_owned()));
    }
    ret.successful.sort();
    ret.unsuccessful.sort();
    ret.not_begun.sort();
    ret.errors.sort();
    Ok(ret)
}
