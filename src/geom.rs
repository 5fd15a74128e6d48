use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

use crate::atom::{Atom, AtomError};

/// A single geometry snapshot: one frame of an optimisation trajectory or the
/// coordinates of one molecule
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Geom(pub Vec<Atom>);

impl Display for Geom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for atom in &self.0 {
            writeln!(
                f,
                "{:5}{:15.10}{:15.10}{:15.10}",
                atom.label, atom.coord[0], atom.coord[1], atom.coord[2],
            )?
        }
        Ok(())
    }
}

impl FromStr for Geom {
    type Err = AtomError;

    /// parse either bare `label x y z` lines or a full XYZ frame, whose atom
    /// count and comment lines are skipped
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut atoms = Vec::new();
        let mut skip = 0;
        for line in s.lines() {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            if skip > 0 {
                skip -= 1;
                continue;
            } else if fields.is_empty() {
                continue;
            } else if fields.len() == 1 && atoms.is_empty() {
                // start of XYZ with comment line
                skip = 1;
                continue;
            } else {
                atoms.push(line.parse()?);
            }
        }
        Ok(Geom(atoms))
    }
}

impl Geom {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.0
    }

    /// write `self` as one XYZ frame with `comment` on the second line
    pub fn to_xyz(&self, comment: &str) -> String {
        format!("{}\n{comment}\n{}", self.len(), geom_string(self))
    }
}

/// render `geom` one atom per line, tab separated, using the shortest
/// representation that round-trips each coordinate
pub fn geom_string(geom: &Geom) -> String {
    use std::fmt::Write;
    let mut ret = String::with_capacity(50 * geom.len());
    for g in &geom.0 {
        writeln!(
            ret,
            "{}\t{}\t{}\t{}",
            g.label, g.coord[0], g.coord[1], g.coord[2]
        )
        .unwrap();
    }
    ret
}

/// write every frame of `traj` as consecutive XYZ blocks
pub fn trajectory_string(traj: &[Geom]) -> String {
    let mut ret = String::new();
    for (i, frame) in traj.iter().enumerate() {
        ret.push_str(&frame.to_xyz(&format!("image {}", i + 1)));
    }
    ret
}
