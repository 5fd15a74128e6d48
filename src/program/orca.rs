use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use crate::{
    atom::Atom,
    geom::{geom_string, Geom},
};

use super::{ForceKind, GeomTable, RewriteError, Solver, SolverKind};

pub struct Orca;

/// the banner ORCA prints at the top of every output file
const BANNER: &str = "O   R   C   A";

/// how far into an output file to look for [BANNER]
const BANNER_LINES: usize = 10;

/// ```text
///   C      0.000000    0.000000    0.119262
/// ```
fn parse_atom(line: &str) -> Option<Atom> {
    let fields: Vec<_> = line.split_whitespace().collect();
    if fields.len() != 4
        || !fields[0].starts_with(|c: char| c.is_ascii_alphabetic())
    {
        return None;
    }
    line.parse().ok()
}

impl Solver for Orca {
    const KIND: SolverKind = SolverKind::Orca;

    const INPUT_FILE: &'static str = "rejig_opt.inp";

    const LOG_FILE: &'static str = "rejig_opt.out";

    const OPT_MARKERS: &'static [&'static str] =
        &["THE OPTIMIZATION HAS CONVERGED"];

    const NORMAL_TERMINATION: &'static str = "ORCA TERMINATED NORMALLY";

    const TERMINATION_LOOKBACK: usize = 100;

    const CLOSING_FORCE: ForceKind = ForceKind::Rms;

    const GEOM_TABLES: &'static [GeomTable] = &[GeomTable {
        header: "CARTESIAN COORDINATES (ANGSTROEM)",
        skip: 1,
        parse_atom,
    }];

    /// the convergence table also appears, with dotted leaders instead of
    /// values, in the optimiser settings at the top of the file
    fn force_line(line: &str) -> Option<ForceKind> {
        if line.contains("...") {
            return None;
        }
        let mut fields = line.split_whitespace();
        match (fields.next()?, fields.next()?) {
            ("MAX", "gradient") => Some(ForceKind::Max),
            ("RMS", "gradient") => Some(ForceKind::Rms),
            _ => None,
        }
    }

    fn is_scratch(file: &str, _files: &[String]) -> bool {
        [".tmp", ".densities", ".gbw"]
            .iter()
            .any(|ext| file.ends_with(ext))
            || file.contains("core.")
    }

    /// Replace the atoms of the `* xyz charge mult` block, keeping the
    /// block delimiters and everything around them.
    fn rewrite_input(input: &str, geom: &Geom) -> Result<String, RewriteError> {
        let lines: Vec<&str> = input.lines().collect();
        let mut open = None;
        for (i, line) in lines.iter().enumerate() {
            let Some(rest) = line.trim().strip_prefix('*') else {
                continue;
            };
            let fields: Vec<_> = rest.split_whitespace().collect();
            match fields.first().map(|f| f.to_ascii_lowercase()).as_deref() {
                Some("xyz") => {
                    open = Some(i);
                    break;
                }
                Some("xyzfile" | "gzmtfile") => {
                    return Err(RewriteError::ExternalGeometry(
                        fields.last().unwrap_or(&"").to_string(),
                    ));
                }
                _ => {}
            }
        }
        let open = open.ok_or(RewriteError::NoGeometrySection)?;
        let close = lines[open + 1..]
            .iter()
            .position(|l| l.trim() == "*")
            .map(|p| open + 1 + p)
            .ok_or(RewriteError::NoGeometrySection)?;

        let mut out = String::new();
        for line in &lines[..=open] {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&geom_string(geom));
        for line in &lines[close..] {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }
}

/// whether `path` starts like an ORCA output file
pub fn is_orca_output(path: &Path) -> io::Result<bool> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    for _ in 0..BANNER_LINES {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if String::from_utf8_lossy(&buf).contains(BANNER) {
            return Ok(true);
        }
    }
    Ok(false)
}
