use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// element symbols indexed by atomic number - 1
const SYMBOLS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al",
    "Si", "P", "S", "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe",
    "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr",
    "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In", "Sn",
    "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm",
    "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W",
    "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At", "Rn",
    "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk", "Cf",
    "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds",
    "Rg", "Cn", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AtomError {
    #[error("wrong number of fields in atom line `{0}`")]
    FieldCount(String),

    #[error("failed to parse coordinate in atom line `{0}`")]
    Coordinate(String),

    #[error("unknown atomic number {0}")]
    AtomicNumber(usize),
}

/// A labelled atom in Cartesian coordinates (Angstrom)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub label: String,
    pub coord: [f64; 3],
}

impl Atom {
    pub fn new(label: &str, coord: [f64; 3]) -> Self {
        Self {
            label: label.to_string(),
            coord,
        }
    }

    /// build an Atom from an atomic number, as printed in the orientation
    /// tables of Gaussian logs
    pub fn from_atomic_number(
        number: usize,
        coord: [f64; 3],
    ) -> Result<Self, AtomError> {
        match number.checked_sub(1).and_then(|i| SYMBOLS.get(i)) {
            Some(label) => Ok(Self::new(label, coord)),
            None => Err(AtomError::AtomicNumber(number)),
        }
    }

    /// apply the affine map `rotation * coord + translation`
    pub fn transformed(
        &self,
        rotation: &[[f64; 3]; 3],
        translation: &[f64; 3],
    ) -> Self {
        let mut coord = [0.0; 3];
        for (i, row) in rotation.iter().enumerate() {
            coord[i] = row
                .iter()
                .zip(self.coord.iter())
                .map(|(r, c)| r * c)
                .sum::<f64>()
                + translation[i];
        }
        Self {
            label: self.label.clone(),
            coord,
        }
    }
}

impl FromStr for Atom {
    type Err = AtomError;

    /// parse an Atom from a line like
    ///  C 1.0 1.0 1.0
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<_> = s.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(AtomError::FieldCount(s.to_string()));
        }
        let mut coord = [0.0; 3];
        for (c, f) in coord.iter_mut().zip(&fields[1..]) {
            *c = f
                .parse()
                .map_err(|_| AtomError::Coordinate(s.to_string()))?;
        }
        Ok(Self::new(fields[0], coord))
    }
}

impl Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:2} {:15.10} {:15.10} {:15.10}",
            self.label, self.coord[0], self.coord[1], self.coord[2]
        )
    }
}
