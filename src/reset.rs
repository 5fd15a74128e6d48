//! Rewinding interrupted jobs so they can be resubmitted, and cleaning up
//! after finished ones.
//!
//! Neither pass knows whether a job is still running, so both must only be
//! run once the driver's jobs have left the queue.

use std::{
    fmt::Display,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use walkdir::WalkDir;

use crate::{
    classify::{classify_log, terminated_normally, ClassifyError, ClassifyOptions},
    dump::Dump,
    program::{
        last_geometry, slurm_outputs, Gaussian, Orca, RewriteError, Solver,
        SolverKind,
    },
    scan::{find_job_dirs, JobDir, JobDirs, ScanError},
};

#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("failed to access {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(
        "archives of {} are not numbered 1 to N, found {found:?}",
        .path.display()
    )]
    ArchiveNumbering { path: PathBuf, found: Vec<String> },

    #[error("failed to rewrite {}: {source}", .path.display())]
    Rewrite { path: PathBuf, source: RewriteError },

    #[error("inputs for more than one solver")]
    AmbiguousSolver,
}

fn io_err(path: &Path) -> impl Fn(io::Error) -> ResetError + '_ {
    move |source| ResetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResetOptions {
    /// report what would change without touching anything
    pub dry_run: bool,
}

/// What reset did to a single job directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// already finished, only scratch files were removed
    Complete,
    /// input and log archived, new input written from the last geometry
    Reset,
    /// no geometry was ever written, so the log was removed
    LogRemoved,
}

#[derive(Debug, Default)]
pub struct ResetReport {
    pub reset: Vec<PathBuf>,
    pub logs_removed: Vec<PathBuf>,
    pub complete: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, ResetError)>,
    /// number of scratch and Slurm output files deleted
    pub files_removed: usize,
}

impl ResetReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Display for ResetReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "reset {} jobs, removed {} logs without a geometry, \
	     {} already complete, {} files removed",
            self.reset.len(),
            self.logs_removed.len(),
            self.complete.len(),
            self.files_removed,
        )?;
        for (path, e) in &self.failed {
            writeln!(f, "failed to reset {}: {e}", path.display())?;
        }
        Ok(())
    }
}

/// sorted names of the regular files in `dir`
fn list_files(dir: &Path) -> Result<Vec<String>, ResetError> {
    let mut ret = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| io_err(dir)(e.into()))?;
        if entry.file_type().is_file() {
            ret.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(ret)
}

/// The number the next archive of `name` should get. Existing archives are
/// `<name>.old1` to `<name>.oldN` with no gaps, so this is N + 1. Any other
/// file starting with `name`, apart from ones marked `original`, means the
/// numbering can't be trusted.
pub fn next_archive_number(
    dir: &Path,
    files: &[String],
    name: &str,
) -> Result<u32, ResetError> {
    let prefix = format!("{name}.old");
    let archives: Vec<&String> = files
        .iter()
        .filter(|f| {
            f.as_str() != name && f.starts_with(name) && !f.contains("original")
        })
        .collect();
    let mut numbers: Vec<u32> = archives
        .iter()
        .filter_map(|f| f.strip_prefix(&prefix)?.parse().ok())
        .collect();
    numbers.sort_unstable();
    let consecutive = numbers.len() == archives.len()
        && numbers.iter().zip(1..).all(|(&n, want)| n == want);
    if !consecutive {
        return Err(ResetError::ArchiveNumbering {
            path: dir.join(name),
            found: archives.into_iter().cloned().collect(),
        });
    }
    Ok(numbers.len() as u32 + 1)
}

/// queue every scratch file in `files` for removal
fn remove_scratch<S: Solver>(dir: &Path, files: &[String], dump: &Dump) {
    for f in files.iter().filter(|f| S::is_scratch(f, files)) {
        dump.send(dir.join(f));
    }
}

fn remove_slurm_outputs(dir: &Path, files: &[String], dump: &Dump) {
    for f in slurm_outputs(files) {
        dump.send(dir.join(f));
    }
}

fn reset_job<S: Solver>(
    dir: &Path,
    dump: &Dump,
    dry_run: bool,
) -> Result<Outcome, ResetError> {
    let log = dir.join(S::LOG_FILE);
    let files = list_files(dir)?;
    let verdict = classify_log::<S>(&log, &ClassifyOptions::default())?;
    if verdict.is_complete() {
        remove_scratch::<S>(dir, &files, dump);
        return Ok(Outcome::Complete);
    }

    let outcome = match last_geometry::<S>(&log).map_err(io_err(&log))? {
        None => {
            info!("{} has no geometry, removing its log", dir.display());
            if !dry_run {
                fs::remove_file(&log).map_err(io_err(&log))?;
            }
            Outcome::LogRemoved
        }
        Some(geom) => {
            // check both before touching either
            let input_n = next_archive_number(dir, &files, S::INPUT_FILE)?;
            let log_n = next_archive_number(dir, &files, S::LOG_FILE)?;
            let input = dir.join(S::INPUT_FILE);
            let contents =
                fs::read_to_string(&input).map_err(io_err(&input))?;
            let new = S::rewrite_input(&contents, &geom).map_err(|source| {
                ResetError::Rewrite {
                    path: input.clone(),
                    source,
                }
            })?;
            let input_old = dir.join(format!("{}.old{input_n}", S::INPUT_FILE));
            let log_old = dir.join(format!("{}.old{log_n}", S::LOG_FILE));
            info!(
                "resetting {} job {} from its last geometry ({} atoms)",
                S::KIND,
                dir.display(),
                geom.len()
            );
            if !dry_run {
                fs::rename(&input, &input_old).map_err(io_err(&input))?;
                fs::write(&input, new).map_err(io_err(&input))?;
                fs::rename(&log, &log_old).map_err(io_err(&log))?;
            }
            Outcome::Reset
        }
    };
    remove_slurm_outputs(dir, &files, dump);
    remove_scratch::<S>(dir, &files, dump);
    Ok(outcome)
}

/// Rewind every job under `root` that has run but not finished: archive its
/// input and log and write a new input starting from the last geometry in
/// the log. Scratch files are removed from every job that has run. Failures
/// are collected per job and never stop the pass.
pub fn reset(root: &Path, opts: &ResetOptions) -> Result<ResetReport, ScanError> {
    let JobDirs { jobs, ambiguous } = find_job_dirs(root)?;
    let dump = Dump::new(opts.dry_run);
    let mut report = ResetReport::default();
    for job in jobs {
        if !job.log().exists() {
            continue;
        }
        let res = match job.solver {
            SolverKind::Gaussian => {
                reset_job::<Gaussian>(&job.path, &dump, opts.dry_run)
            }
            SolverKind::Orca => reset_job::<Orca>(&job.path, &dump, opts.dry_run),
        };
        match res {
            Ok(Outcome::Complete) => report.complete.push(job.path),
            Ok(Outcome::Reset) => report.reset.push(job.path),
            Ok(Outcome::LogRemoved) => report.logs_removed.push(job.path),
            Err(e) => {
                warn!("failed to reset {}: {e}", job.path.display());
                report.failed.push((job.path, e));
            }
        }
    }
    for path in ambiguous {
        report.failed.push((path, ResetError::AmbiguousSolver));
    }
    report.files_removed = dump.shutdown();
    Ok(report)
}

#[derive(Debug, Default)]
pub struct TidyReport {
    pub tidied: Vec<PathBuf>,
    pub not_tidied: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, ResetError)>,
    pub files_removed: usize,
}

impl Display for TidyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "tidied {} jobs, removing {} files",
            self.tidied.len(),
            self.files_removed
        )?;
        if !self.not_tidied.is_empty() {
            writeln!(f, "not tidied, no normal termination:")?;
            for path in &self.not_tidied {
                writeln!(f, "    {}", path.display())?;
            }
        }
        for (path, e) in &self.failed {
            writeln!(f, "failed to tidy {}: {e}", path.display())?;
        }
        Ok(())
    }
}

fn tidy_job<S: Solver>(job: &JobDir, dump: &Dump) -> Result<bool, ResetError> {
    let log = job.log();
    if !terminated_normally::<S>(&log, S::TERMINATION_LOOKBACK)
        .map_err(io_err(&log))?
    {
        return Ok(false);
    }
    let files = list_files(&job.path)?;
    remove_scratch::<S>(&job.path, &files, dump);
    remove_slurm_outputs(&job.path, &files, dump);
    Ok(true)
}

/// Remove scratch and Slurm output files from every job under `root` whose
/// solver exited normally.
pub fn tidy(root: &Path, dry_run: bool) -> Result<TidyReport, ScanError> {
    let JobDirs { jobs, ambiguous } = find_job_dirs(root)?;
    let dump = Dump::new(dry_run);
    let mut report = TidyReport::default();
    for job in jobs {
        let res = match job.solver {
            SolverKind::Gaussian => tidy_job::<Gaussian>(&job, &dump),
            SolverKind::Orca => tidy_job::<Orca>(&job, &dump),
        };
        match res {
            Ok(true) => report.tidied.push(job.path),
            Ok(false) => report.not_tidied.push(job.path),
            Err(e) => report.failed.push((job.path, e)),
        }
    }
    for path in ambiguous {
        report.failed.push((path, ResetError::AmbiguousSolver));
    }
    report.files_removed = dump.shutdown();
    Ok(report)
}

/// Ask `question` on `output` until `input` answers yes or no. An empty
/// answer or the end of input counts as no.
pub fn confirm<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    question: &str,
) -> io::Result<bool> {
    loop {
        write!(output, "{question} [y/N] ")?;
        output.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "" | "n" | "no" => return Ok(false),
            _ => writeln!(output, "please answer y or n")?,
        }
    }
}
