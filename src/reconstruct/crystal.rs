use std::{
    collections::BTreeSet,
    fmt::{Display, Write},
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{atom::Atom, geom::Geom};

use super::ReconstructError;

const IDENTITY: SymmetryOp = SymmetryOp {
    rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    translation: [0.0; 3],
};

/// Identifies a molecule within its crystal. Solvent molecules are numbered
/// separately and written with an `S` suffix, as in `3S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoleculeId {
    pub index: usize,
    pub solvent: bool,
}

impl Display for MoleculeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index)?;
        if self.solvent {
            write!(f, "S")?;
        }
        Ok(())
    }
}

impl FromStr for MoleculeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digits, solvent) = match s.strip_suffix('S') {
            Some(d) => (d, true),
            None => (s, false),
        };
        Ok(Self {
            index: digits.parse()?,
            solvent,
        })
    }
}

/// An affine map in Cartesian coordinates taking the stored molecules to one
/// of their images in the unit cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymmetryOp {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    pub id: usize,
    #[serde(default)]
    pub solvent: bool,
    pub atoms: Vec<Atom>,
}

impl Molecule {
    pub fn molecule_id(&self) -> MoleculeId {
        MoleculeId {
            index: self.id,
            solvent: self.solvent,
        }
    }

    pub fn geom(&self) -> Geom {
        Geom(self.atoms.clone())
    }
}

/// A crystal broken into its symmetry-unique molecules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crystal {
    /// lattice vectors as rows, in Angstrom
    pub cell: [[f64; 3]; 3],
    #[serde(default)]
    pub symmetry_operations: Vec<SymmetryOp>,
    pub molecules: Vec<Molecule>,
}

impl Crystal {
    pub fn molecule(&self, id: MoleculeId) -> Option<&Molecule> {
        self.molecules.iter().find(|m| m.molecule_id() == id)
    }

    /// Replace the coordinates of molecule `id` with those of `geom`,
    /// keeping the reference labels. The atom counts must agree.
    pub fn replace_coords(
        &mut self,
        id: MoleculeId,
        geom: &Geom,
    ) -> Result<(), ReconstructError> {
        let mol = self
            .molecules
            .iter_mut()
            .find(|m| m.molecule_id() == id)
            .ok_or(ReconstructError::UnknownMolecule(id))?;
        if mol.atoms.len() != geom.len() {
            return Err(ReconstructError::AtomCount {
                id,
                want: mol.atoms.len(),
                got: geom.len(),
            });
        }
        for (atom, new) in mol.atoms.iter_mut().zip(geom.atoms()) {
            atom.coord = new.coord;
        }
        Ok(())
    }

    /// every atom of the unit cell: each symmetry operation applied to each
    /// molecule
    pub fn assemble(&self) -> Geom {
        let ops = if self.symmetry_operations.is_empty() {
            std::slice::from_ref(&IDENTITY)
        } else {
            &self.symmetry_operations[..]
        };
        let mut atoms = Vec::new();
        for op in ops {
            for mol in &self.molecules {
                atoms.extend(
                    mol.atoms
                        .iter()
                        .map(|a| a.transformed(&op.rotation, &op.translation)),
                );
            }
        }
        Geom(atoms)
    }

    /// the assembled cell as extended XYZ
    pub fn to_extxyz(&self) -> String {
        let geom = self.assemble();
        let mut ret = String::new();
        let lattice: Vec<String> =
            self.cell.iter().flatten().map(|x| x.to_string()).collect();
        writeln!(ret, "{}", geom.len()).unwrap();
        writeln!(
            ret,
            "Lattice=\"{}\" Properties=species:S:1:pos:R:3 pbc=\"T T T\"",
            lattice.join(" ")
        )
        .unwrap();
        for atom in geom.atoms() {
            writeln!(ret, "{atom}").unwrap();
        }
        ret
    }

    /// error unless every (id, solvent) pair is unique
    fn check_ids(&self, path: &Path) -> Result<(), ReconstructError> {
        let mut seen = BTreeSet::new();
        for mol in &self.molecules {
            if !seen.insert(mol.molecule_id()) {
                return Err(ReconstructError::DuplicateMolecule {
                    path: path.to_path_buf(),
                    id: mol.molecule_id(),
                });
            }
        }
        Ok(())
    }
}

/// Supplies the decomposition of a crystal into molecules. Decompositions are
/// requested fresh for every reconstruction.
pub trait Decompose {
    /// decompose the crystal `name` whose working directory is `dir`
    fn decompose(&self, dir: &Path, name: &str) -> Result<Crystal, ReconstructError>;
}

/// Reads the decomposition stored next to the jobs as `<dir>/<name>.json`
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceFile;

impl Decompose for ReferenceFile {
    fn decompose(&self, dir: &Path, name: &str) -> Result<Crystal, ReconstructError> {
        let path = dir.join(format!("{name}.json"));
        let contents =
            std::fs::read_to_string(&path).map_err(|source| ReconstructError::Io {
                path: path.clone(),
                source,
            })?;
        let crystal: Crystal = serde_json::from_str(&contents).map_err(|source| {
            ReconstructError::Reference {
                path: path.clone(),
                source,
            }
        })?;
        crystal.check_ids(&path)?;
        Ok(crystal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn molecule_ids() {
        let id: MoleculeId = "12S".parse().unwrap();
        assert_eq!(
            id,
            MoleculeId {
                index: 12,
                solvent: true
            }
        );
        assert_eq!(id.to_string(), "12S");
        assert_eq!("3".parse::<MoleculeId>().unwrap().to_string(), "3");
        assert!("S".parse::<MoleculeId>().is_err());
        assert!("B3LYP_6-31G".parse::<MoleculeId>().is_err());

        let mut ids: Vec<MoleculeId> =
            ["10", "2S", "2", "1"].map(|s| s.parse().unwrap()).to_vec();
        ids.sort();
        let ids: Vec<_> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(ids, ["1", "2", "2S", "10"]);
    }

    #[test]
    fn assemble_applies_every_operation() {
        let crystal = Crystal {
            cell: [[5.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 5.0]],
            symmetry_operations: vec![
                IDENTITY,
                SymmetryOp {
                    rotation: [
                        [-1.0, 0.0, 0.0],
                        [0.0, -1.0, 0.0],
                        [0.0, 0.0, 1.0],
                    ],
                    translation: [2.5, 2.5, 0.0],
                },
            ],
            molecules: vec![
                Molecule {
                    id: 0,
                    solvent: false,
                    atoms: vec![Atom::new("C", [1.0, 0.0, 0.0])],
                },
                Molecule {
                    id: 0,
                    solvent: true,
                    atoms: vec![Atom::new("O", [0.0, 1.0, 0.0])],
                },
            ],
        };
        let got = crystal.assemble();
        assert_eq!(
            got,
            Geom(vec![
                Atom::new("C", [1.0, 0.0, 0.0]),
                Atom::new("O", [0.0, 1.0, 0.0]),
                Atom::new("C", [1.5, 2.5, 0.0]),
                Atom::new("O", [2.5, 1.5, 0.0]),
            ])
        );
        assert!(crystal
            .to_extxyz()
            .starts_with("4\nLattice=\"5 0 0 0 5 0 0 0 5\" "));
    }

    #[test]
    fn replace_checks_atom_count() {
        let mut crystal = Crystal {
            cell: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            symmetry_operations: Vec::new(),
            molecules: vec![Molecule {
                id: 1,
                solvent: false,
                atoms: vec![
                    Atom::new("H", [0.0; 3]),
                    Atom::new("H", [0.0, 0.0, 0.7]),
                ],
            }],
        };
        let id = MoleculeId {
            index: 1,
            solvent: false,
        };
        let new = Geom(vec![
            Atom::new("X", [0.0; 3]),
            Atom::new("X", [0.0, 0.0, 0.74]),
        ]);
        crystal.replace_coords(id, &new).unwrap();
        let mol = crystal.molecule(id).unwrap();
        assert_eq!(mol.atoms[1], Atom::new("H", [0.0, 0.0, 0.74]));

        assert!(matches!(
            crystal.replace_coords(id, &Geom(vec![Atom::new("H", [0.0; 3])])),
            Err(ReconstructError::AtomCount { want: 2, got: 1, .. })
        ));
        assert!(matches!(
            crystal.replace_coords(
                MoleculeId {
                    index: 1,
                    solvent: true
                },
                &new
            ),
            Err(ReconstructError::UnknownMolecule(_))
        ));
    }

    #[test]
    fn reference_file() {
        let got = ReferenceFile
            .decompose(Path::new("testfiles/crystal"), "water_pair")
            .unwrap();
        assert_eq!(got.molecules.len(), 2);
        assert_eq!(got.symmetry_operations.len(), 2);
        let solvent = got
            .molecule(MoleculeId {
                index: 0,
                solvent: true,
            })
            .unwrap();
        assert_eq!(solvent.atoms[0], Atom::new("O", [2.0, 1.0, 3.1]));
        let cell = got.assemble();
        assert_eq!(cell.len(), 12);
        assert_eq!(cell.atoms()[6], Atom::new("O", [2.75, 2.75, 0.1]));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("x.json"),
            r#"{
  "cell": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
  "molecules": [
    {"id": 0, "atoms": [{"label": "H", "coord": [0, 0, 0]}]},
    {"id": 0, "atoms": [{"label": "H", "coord": [0, 0, 1]}]}
  ]
}"#,
        )
        .unwrap();
        assert!(matches!(
            ReferenceFile.decompose(tmp.path(), "x"),
            Err(ReconstructError::DuplicateMolecule { .. })
        ));
        assert!(matches!(
            ReferenceFile.decompose(tmp.path(), "missing"),
            Err(ReconstructError::Io { .. })
        ));
    }
}
