use std::{
    collections::VecDeque,
    fmt::Display,
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{atom::Atom, geom::Geom, rev_lines::RevLines};

pub mod gaussian;
pub mod orca;

pub use gaussian::Gaussian;
pub use orca::Orca;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RewriteError {
    #[error("input file has no recognizable geometry section")]
    NoGeometrySection,

    #[error("input file reads its geometry from `{0}`")]
    ExternalGeometry(String),
}

/// The two force lines that make up one optimisation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceKind {
    Max,
    Rms,
}

/// Describes one kind of geometry table printed in a solver log. The table
/// starts on the line after `header`, has `skip` lines of decoration, and
/// then one atom per line until the first line `parse_atom` rejects.
pub struct GeomTable {
    pub header: &'static str,
    pub skip: usize,
    pub parse_atom: fn(&str) -> Option<Atom>,
}

/// A quantum-chemistry package whose optimisation jobs rejig manages. All of
/// the solver-specific knowledge lives behind this trait: file names, the
/// lines that signal convergence or termination, the layout of geometry
/// tables, and how to put a new geometry into an input file.
pub trait Solver {
    const KIND: SolverKind;

    /// canonical input file name in a job directory
    const INPUT_FILE: &'static str;

    /// canonical log file name in a job directory
    const LOG_FILE: &'static str;

    /// any of these in a log means the optimisation finished
    const OPT_MARKERS: &'static [&'static str];

    const NORMAL_TERMINATION: &'static str;

    /// how many non-blank lines from the end of a log to search for
    /// `NORMAL_TERMINATION`
    const TERMINATION_LOOKBACK: usize;

    /// the force line that comes first in each step when reading forwards,
    /// and therefore closes the step when reading backwards
    const CLOSING_FORCE: ForceKind;

    /// geometry tables in order of preference
    const GEOM_TABLES: &'static [GeomTable];

    /// classify `line` as one of the convergence-table force lines
    fn force_line(line: &str) -> Option<ForceKind>;

    /// whether `file` is a scratch file that can be deleted once the job is
    /// no longer running. `files` holds every file name in the directory
    fn is_scratch(file: &str, files: &[String]) -> bool;

    /// return a copy of `input` with its coordinates replaced by `geom`
    fn rewrite_input(input: &str, geom: &Geom) -> Result<String, RewriteError>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum SolverKind {
    Gaussian,
    Orca,
}

impl SolverKind {
    pub const ALL: [SolverKind; 2] = [SolverKind::Gaussian, SolverKind::Orca];

    pub fn input_file(&self) -> &'static str {
        match self {
            SolverKind::Gaussian => Gaussian::INPUT_FILE,
            SolverKind::Orca => Orca::INPUT_FILE,
        }
    }

    pub fn log_file(&self) -> &'static str {
        match self {
            SolverKind::Gaussian => Gaussian::LOG_FILE,
            SolverKind::Orca => Orca::LOG_FILE,
        }
    }

    pub fn last_geometry(&self, log: &Path) -> io::Result<Option<Geom>> {
        match self {
            SolverKind::Gaussian => last_geometry::<Gaussian>(log),
            SolverKind::Orca => last_geometry::<Orca>(log),
        }
    }

    pub fn read_trajectory(&self, log: &Path) -> io::Result<Vec<Geom>> {
        match self {
            SolverKind::Gaussian => read_trajectory::<Gaussian>(log),
            SolverKind::Orca => read_trajectory::<Orca>(log),
        }
    }
}

impl Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverKind::Gaussian => write!(f, "Gaussian"),
            SolverKind::Orca => write!(f, "ORCA"),
        }
    }
}

/// Forward parser state for [read_trajectory]
struct TableReader {
    table: usize,
    skip: usize,
    atoms: Vec<Atom>,
}

impl TableReader {
    fn new(table: usize, tables: &[GeomTable]) -> Self {
        Self {
            table,
            skip: tables[table].skip,
            atoms: Vec::new(),
        }
    }

    /// feed the next line of the table. returns `Some` with the finished
    /// geometry once a terminating line is seen, or `None` while the table
    /// is still going
    fn feed(&mut self, line: &str, tables: &[GeomTable]) -> Option<Geom> {
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }
        match (tables[self.table].parse_atom)(line) {
            Some(atom) => {
                self.atoms.push(atom);
                None
            }
            None => Some(Geom(std::mem::take(&mut self.atoms))),
        }
    }
}

fn table_header(line: &str, tables: &[GeomTable]) -> Option<usize> {
    tables.iter().position(|t| line.contains(t.header))
}

/// read every complete geometry table from `log` in file order. only tables
/// of the most preferred kind present in the file are returned
pub fn read_trajectory<S: Solver>(log: &Path) -> io::Result<Vec<Geom>> {
    let tables = S::GEOM_TABLES;
    let mut frames: Vec<Vec<Geom>> = tables.iter().map(|_| Vec::new()).collect();
    let mut reader = BufReader::new(File::open(log)?);
    let mut state: Option<TableReader> = None;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if let Some(st) = state.as_mut() {
            match st.feed(line, tables) {
                Some(geom) => {
                    if !geom.is_empty() {
                        frames[st.table].push(geom);
                    }
                    state = None;
                }
                None => continue,
            }
        }
        if let Some(t) = table_header(line, tables) {
            state = Some(TableReader::new(t, tables));
        }
    }
    Ok(frames.into_iter().find(|f| !f.is_empty()).unwrap_or_default())
}

/// Reverse parser state for one kind of table in [last_geometry]. Only the
/// `skip` most recent lines and the current run of atom lines are held, so
/// memory stays bounded however far the last header is from the end.
struct TableTail {
    /// newest lines, not yet known to be past the table's decoration
    recent: VecDeque<String>,
    /// atom lines running forward from the oldest line fed so far, last atom
    /// first
    run: Vec<Atom>,
    /// whether a rejected line follows `run`
    terminated: bool,
}

impl TableTail {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
            run: Vec::new(),
            terminated: false,
        }
    }

    fn push(&mut self, line: &str, table: &GeomTable) {
        self.recent.push_back(line.to_owned());
        if self.recent.len() <= table.skip {
            return;
        }
        let Some(line) = self.recent.pop_front() else {
            return;
        };
        match (table.parse_atom)(&line) {
            Some(atom) => self.run.push(atom),
            None => {
                self.run.clear();
                self.terminated = true;
            }
        }
    }

    /// the table that would start at a header just before the lines pushed
    /// so far, if it is complete
    fn finish(&mut self, table: &GeomTable) -> Option<Geom> {
        let complete = self.recent.len() == table.skip
            && self.terminated
            && !self.run.is_empty();
        if !complete {
            return None;
        }
        let mut run = std::mem::take(&mut self.run);
        run.reverse();
        Some(Geom(run))
    }
}

/// return the most recent complete geometry in `log`, reading from the end
/// of the file. a table cut off by the end of the file is skipped in favour
/// of the one before it
pub fn last_geometry<S: Solver>(log: &Path) -> io::Result<Option<Geom>> {
    let tables = S::GEOM_TABLES;
    let mut tails: Vec<TableTail> =
        tables.iter().map(|_| TableTail::new()).collect();
    let mut fallback = None;
    for line in RevLines::open(log)? {
        let line = line?;
        let Some(t) = table_header(&line, tables) else {
            for (tail, table) in tails.iter_mut().zip(tables) {
                tail.push(&line, table);
            }
            continue;
        };
        let geom = tails[t].finish(&tables[t]);
        for tail in tails.iter_mut() {
            *tail = TableTail::new();
        }
        match geom {
            Some(geom) if t == 0 => return Ok(Some(geom)),
            Some(geom) if fallback.is_none() => fallback = Some(geom),
            _ => {}
        }
    }
    Ok(fallback)
}

/// Parse one value field of a force line. Fields too wide for the solver's
/// format come out as all asterisks and are read as infinity.
pub(crate) fn parse_force_value(field: &str) -> Option<f64> {
    if !field.is_empty() && field.chars().all(|c| c == '*') {
        return Some(f64::INFINITY);
    }
    field.parse().ok()
}

/// names of `slurm-*.out` and `slurm-*.err` files in `files`
pub fn slurm_outputs(files: &[String]) -> impl Iterator<Item = &String> {
    files.iter().filter(|f| {
        f.starts_with("slurm-") && (f.ends_with(".out") || f.ends_with(".err"))
    })
}
