//! Deciding how far an optimisation got by reading its log backwards.

use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
};

use crate::{
    program::{parse_force_value, ForceKind, Gaussian, Orca, Solver, SolverKind},
    rev_lines::RevLines,
};

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("failed to read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed force line in {}: `{line}`", .path.display())]
    MalformedForceLine { path: PathBuf, line: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifyOptions {
    /// report the converged step with the smallest max force instead of the
    /// most recent converged step
    pub most_converged: bool,

    /// count every step in the log
    pub image_count: bool,

    /// scale factor applied to the measured values before comparing them to
    /// their thresholds. values above 1 make convergence stricter
    pub multiplier: f64,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            most_converged: false,
            image_count: false,
            multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptDetails {
    pub fully_converged: bool,

    /// steps back from the last one in the log, so `Some(0)` is the final
    /// geometry
    pub best_image: Option<usize>,

    pub total_images: Option<usize>,
}

impl OptDetails {
    /// 1-based position of `best_image` in the trajectory, if both it and
    /// the trajectory length are known
    pub fn image_number(&self) -> Option<usize> {
        let total = self.total_images?;
        total.checked_sub(self.best_image?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NotBegun,
    Incomplete(OptDetails),
    Complete(OptDetails),
}

impl Verdict {
    pub fn is_complete(&self) -> bool {
        matches!(self, Verdict::Complete(_))
    }

    pub fn details(&self) -> Option<&OptDetails> {
        match self {
            Verdict::NotBegun => None,
            Verdict::Incomplete(d) | Verdict::Complete(d) => Some(d),
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, details) = match self {
            Verdict::NotBegun => return write!(f, "not begun"),
            Verdict::Incomplete(d) => ("incomplete", d),
            Verdict::Complete(d) => ("complete", d),
        };
        write!(f, "{name}")?;
        match (details.image_number(), details.total_images) {
            (Some(i), Some(n)) => write!(f, ", best image {i} of {n}"),
            _ => Ok(()),
        }
    }
}

/// classify the log of a `solver` job at `log`
pub fn classify(
    log: &Path,
    solver: SolverKind,
    opts: &ClassifyOptions,
) -> Result<Verdict, ClassifyError> {
    match solver {
        SolverKind::Gaussian => classify_log::<Gaussian>(log, opts),
        SolverKind::Orca => classify_log::<Orca>(log, opts),
    }
}

/// The optimisation steps of a log, as seen walking backwards from the end.
struct Steps {
    /// number of steps closed so far, which is also the backwards index of
    /// the step currently being read
    closed: usize,
    /// converged flag and value of the non-closing force line of the current
    /// step
    open: Option<(bool, f64)>,
    /// first converged step found
    most_recent: Option<usize>,
    /// converged step with the smallest max force, and that force
    best: Option<(usize, f64)>,
}

pub fn classify_log<S: Solver>(
    log: &Path,
    opts: &ClassifyOptions,
) -> Result<Verdict, ClassifyError> {
    if !log.exists() {
        return Ok(Verdict::NotBegun);
    }
    let io_err = |source| ClassifyError::Io {
        path: log.to_path_buf(),
        source,
    };
    let mut steps = Steps {
        closed: 0,
        open: None,
        most_recent: None,
        best: None,
    };
    let mut terminated = false;
    for line in RevLines::open(log).map_err(io_err)? {
        let line = line.map_err(io_err)?;
        if S::OPT_MARKERS.iter().any(|m| line.contains(m)) {
            terminated = true;
            break;
        }
        let Some(kind) = S::force_line(&line) else {
            continue;
        };
        let (value, threshold) = parse_force_line(log, &line)?;
        let converged = value * opts.multiplier < threshold;
        if kind != S::CLOSING_FORCE {
            steps.open = Some((converged, value));
            continue;
        }
        let (other_converged, other_value) =
            steps.open.take().unwrap_or((false, f64::INFINITY));
        if converged && other_converged {
            let max_force = match kind {
                ForceKind::Max => value,
                ForceKind::Rms => other_value,
            };
            steps.most_recent.get_or_insert(steps.closed);
            // ties go to the later step, which was seen first
            if steps.best.is_none_or(|(_, v)| max_force < v) {
                steps.best = Some((steps.closed, max_force));
            }
            if !opts.most_converged && !opts.image_count {
                break;
            }
        }
        steps.closed += 1;
    }

    let total_images = if !opts.image_count {
        None
    } else if terminated {
        Some(count_steps::<S>(log).map_err(io_err)?)
    } else {
        Some(steps.closed)
    };

    if terminated {
        return Ok(Verdict::Complete(OptDetails {
            fully_converged: true,
            best_image: Some(steps.closed),
            total_images,
        }));
    }
    let best_image = if opts.most_converged {
        steps.best.map(|(i, _)| i)
    } else {
        steps.most_recent
    };
    match best_image {
        Some(i) => Ok(Verdict::Incomplete(OptDetails {
            fully_converged: false,
            best_image: Some(i),
            total_images,
        })),
        None => Ok(Verdict::NotBegun),
    }
}

/// total number of optimisation steps in `log`
fn count_steps<S: Solver>(log: &Path) -> io::Result<usize> {
    let mut count = 0;
    for line in RevLines::open(log)? {
        if S::force_line(&line?) == Some(S::CLOSING_FORCE) {
            count += 1;
        }
    }
    Ok(count)
}

/// parse the value and threshold out of a line like
///
/// ```text
///  Maximum Force            0.000808     0.001000     YES
/// ```
fn parse_force_line(log: &Path, line: &str) -> Result<(f64, f64), ClassifyError> {
    let malformed = || ClassifyError::MalformedForceLine {
        path: log.to_path_buf(),
        line: line.trim().to_owned(),
    };
    let fields: Vec<_> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(malformed());
    }
    let value = parse_force_value(fields[2]).ok_or_else(malformed)?;
    let threshold: f64 = fields[3].parse().map_err(|_| malformed())?;
    Ok((value, threshold))
}

/// whether the solver reported a normal exit within the last `lookback`
/// non-blank lines of `log`. a missing log has not terminated at all
pub fn terminated_normally<S: Solver>(
    log: &Path,
    lookback: usize,
) -> io::Result<bool> {
    if !log.exists() {
        return Ok(false);
    }
    for line in RevLines::open(log)?.take(lookback) {
        if line?.contains(S::NORMAL_TERMINATION) {
            return Ok(true);
        }
    }
    Ok(false)
}
