use std::sync::LazyLock;

use regex::Regex;

use crate::{
    atom::Atom,
    geom::{geom_string, Geom},
};

use super::{ForceKind, GeomTable, RewriteError, Solver, SolverKind};

pub struct Gaussian;

/// a row of an orientation table:
///
/// ```text
///  Center     Atomic      Atomic             Coordinates (Angstroms)
///  Number     Number       Type             X           Y           Z
///       1          8           0        0.000000    0.000000    0.119262
/// ```
static ATOM_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*\d+\s+(\d+)\s+-?\d+\s+(-?\d+\.\d*)\s+(-?\d+\.\d*)\s+(-?\d+\.\d*)\s*$",
    )
    .unwrap()
});

fn parse_atom(line: &str) -> Option<Atom> {
    let caps = ATOM_ROW.captures(line)?;
    let number: usize = caps[1].parse().ok()?;
    let coord = [
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
        caps[4].parse().ok()?,
    ];
    // ghost atoms and other oddities keep their position under a dummy label
    Some(
        Atom::from_atomic_number(number, coord)
            .unwrap_or_else(|_| Atom::new("X", coord)),
    )
}

const SCRATCH_EXTENSIONS: [&str; 5] = [".d2e", ".int", ".rwf", ".skr", ".chk"];

impl Solver for Gaussian {
    const KIND: SolverKind = SolverKind::Gaussian;

    const INPUT_FILE: &'static str = "rejig_opt.gjf";

    const LOG_FILE: &'static str = "rejig_opt.log";

    const OPT_MARKERS: &'static [&'static str] = &[
        "Normal termination of Gaussian",
        "Stationary point found",
        "Optimization completed",
    ];

    const NORMAL_TERMINATION: &'static str = "Normal termination of Gaussian";

    const TERMINATION_LOOKBACK: usize = 20;

    const CLOSING_FORCE: ForceKind = ForceKind::Max;

    const GEOM_TABLES: &'static [GeomTable] = &[
        GeomTable {
            header: "Input orientation:",
            skip: 4,
            parse_atom,
        },
        GeomTable {
            header: "Standard orientation:",
            skip: 4,
            parse_atom,
        },
    ];

    fn force_line(line: &str) -> Option<ForceKind> {
        let mut fields = line.split_whitespace();
        match (fields.next()?, fields.next()?) {
            ("Maximum", "Force") => Some(ForceKind::Max),
            ("RMS", "Force") => Some(ForceKind::Rms),
            _ => None,
        }
    }

    fn is_scratch(file: &str, files: &[String]) -> bool {
        if SCRATCH_EXTENSIONS.iter().any(|ext| file.ends_with(ext))
            || file.contains("core.")
            || file == "gmon.out"
            || file == "fort.7"
        {
            return true;
        }
        // wavefunction files are only kept around to produce charges
        if let Some(stem) = file.strip_suffix(".wfn") {
            let chg = format!("{stem}.chg");
            return files.iter().any(|f| *f == chg);
        }
        false
    }

    /// Replace the molecule specification of a Gaussian input. Everything up
    /// to and including the charge and multiplicity line is kept, as is
    /// everything after the blank line that ends the atoms. Route lines that
    /// read the guess from the checkpoint are switched to `Guess=TCheck` so
    /// the job still starts when the checkpoint has been cleaned up.
    fn rewrite_input(input: &str, geom: &Geom) -> Result<String, RewriteError> {
        let mut head = Vec::new();
        let mut tail = Vec::new();
        let mut blanks = 0;
        let mut found_charge = false;
        for line in input.lines() {
            let blank = line.trim().is_empty();
            if blanks < 2 {
                if blank {
                    blanks += 1;
                }
                head.push(route_line(line));
            } else if blanks == 2 && !found_charge {
                if blank {
                    // molecule section without a charge line
                    return Err(RewriteError::NoGeometrySection);
                }
                found_charge = true;
                head.push(line);
            } else if blanks == 2 {
                if blank {
                    blanks += 1;
                }
            } else {
                tail.push(line);
            }
        }
        if !found_charge {
            return Err(RewriteError::NoGeometrySection);
        }
        while tail.last().is_some_and(|l| l.trim().is_empty()) {
            tail.pop();
        }

        let mut out = String::new();
        for line in head {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&geom_string(geom));
        out.push('\n');
        for line in tail {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Ok(out)
    }
}

fn route_line(line: &str) -> &str {
    if line.contains("# Geom=Check Guess=Read")
        || line.contains("# Geom=Check Guess=TCheck")
    {
        "# Geom=Check Guess=TCheck"
    } else {
        line
    }
}
