use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// element symbols indexed by atomic number - 1
static SYMBOLS: [&str; 118] = [
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

/// return the atomic number for the element `symbol`, if it is known
pub fn atomic_number(symbol: &str) -> Option<usize> {
    SYMBOLS.iter().position(|&s| s == symbol).map(|i| i + 1)
}

#[derive(Debug, Error, PartialEq)]
pub enum AtomsParseError {
    #[error("line {line}: expected `{keyword} x y z`")]
    Fields { line: usize, keyword: &'static str },

    #[error("line {line}: failed to parse `{value}` as a coordinate")]
    Float { line: usize, value: String },

    #[error("line {line}: unknown element `{symbol}`")]
    Element { line: usize, symbol: String },

    #[error("found {0} lattice vectors, expected 0 or 3")]
    Lattice(usize),
}

/// A minimal atomistic structure: what a file-based calculator needs to
/// write its geometry and a place to leave metadata for the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Atoms {
    pub symbols: Vec<String>,

    /// Cartesian positions in Å
    pub positions: Vec<[f64; 3]>,

    /// unit cell with the lattice vectors as rows
    pub cell: Option<[[f64; 3]; 3]>,

    /// periodic boundary conditions along each lattice vector
    pub pbc: [bool; 3],

    /// free-form metadata, carried along with the structure
    #[serde(default)]
    pub info: BTreeMap<String, serde_json::Value>,
}

impl Atoms {
    /// a molecule in vacuum, without a cell or periodicity
    pub fn molecule<S: Into<String>>(
        symbols: impl IntoIterator<Item = S>,
        positions: Vec<[f64; 3]>,
    ) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            positions,
            ..Default::default()
        }
    }

    /// a structure periodic in the directions of `pbc`
    pub fn periodic<S: Into<String>>(
        symbols: impl IntoIterator<Item = S>,
        positions: Vec<[f64; 3]>,
        cell: [[f64; 3]; 3],
        pbc: [bool; 3],
    ) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            positions,
            cell: Some(cell),
            pbc,
            info: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn any_pbc(&self) -> bool {
        self.pbc.iter().any(|&p| p)
    }

    pub fn all_pbc(&self) -> bool {
        self.pbc.iter().all(|&p| p)
    }

    /// the distinct element symbols in order of first appearance
    pub fn unique_symbols(&self) -> Vec<&str> {
        let mut ret: Vec<&str> = Vec::new();
        for s in &self.symbols {
            if !ret.contains(&s.as_str()) {
                ret.push(s);
            }
        }
        ret
    }

    /// the reciprocal lattice vectors, including the factor of 2π, as rows.
    /// None if there is no cell or it is singular
    pub fn reciprocal_cell(&self) -> Option<Matrix3<f64>> {
        let cell = self.cell?;
        let a = Matrix3::from_fn(|i, j| cell[i][j]);
        let inv = a.try_inverse()?;
        Some(inv.transpose() * 2.0 * std::f64::consts::PI)
    }
}

/// Writes the structure in FHI-aims `geometry.in` format. Lattice vectors are
/// only written when the structure is periodic in at least one direction
impl Display for Atoms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "# geometry.in written by wfl")?;
        if let Some(cell) = self.cell.filter(|_| self.any_pbc()) {
            for [x, y, z] in cell {
                writeln!(f, "lattice_vector {x:16.8} {y:16.8} {z:16.8}")?;
            }
        }
        for (sym, [x, y, z]) in self.symbols.iter().zip(&self.positions) {
            writeln!(f, "atom {x:16.8} {y:16.8} {z:16.8} {sym}")?;
        }
        Ok(())
    }
}

fn parse_xyz(
    fields: &[&str],
    line: usize,
    keyword: &'static str,
) -> Result<[f64; 3], AtomsParseError> {
    if fields.len() < 4 {
        return Err(AtomsParseError::Fields { line, keyword });
    }
    let mut ret = [0.0; 3];
    for (r, v) in ret.iter_mut().zip(&fields[1..4]) {
        *r = v.parse().map_err(|_| AtomsParseError::Float {
            line,
            value: v.to_string(),
        })?;
    }
    Ok(ret)
}

/// Parse a `geometry.in` file. `atom_frac` lines are converted to Cartesian
/// coordinates with the lattice vectors read so far; other keywords and
/// comments are ignored
impl FromStr for Atoms {
    type Err = AtomsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lattice = Vec::new();
        let mut atoms = Atoms::default();
        for (i, line) in s.lines().enumerate() {
            let line_no = i + 1;
            let line = line.split('#').next().unwrap_or_default();
            let fields: Vec<_> = line.split_whitespace().collect();
            match fields.first() {
                Some(&"lattice_vector") => {
                    let v = parse_xyz(&fields, line_no, "lattice_vector")?;
                    lattice.push(v);
                }
                Some(&kw) if kw == "atom" || kw == "atom_frac" => {
                    let keyword =
                        if kw == "atom" { "atom" } else { "atom_frac" };
                    let mut pos = parse_xyz(&fields, line_no, keyword)?;
                    let Some(sym) = fields.get(4) else {
                        return Err(AtomsParseError::Fields {
                            line: line_no,
                            keyword,
                        });
                    };
                    if atomic_number(sym).is_none() {
                        return Err(AtomsParseError::Element {
                            line: line_no,
                            symbol: sym.to_string(),
                        });
                    }
                    if kw == "atom_frac" {
                        let frac = pos;
                        pos = [0.0; 3];
                        for (f, vec) in frac.iter().zip(&lattice) {
                            for k in 0..3 {
                                pos[k] += f * vec[k];
                            }
                        }
                    }
                    atoms.symbols.push(sym.to_string());
                    atoms.positions.push(pos);
                }
                _ => {}
            }
        }
        match lattice.len() {
            0 => {}
            3 => {
                atoms.cell = Some([lattice[0], lattice[1], lattice[2]]);
                atoms.pbc = [true; 3];
            }
            n => return Err(AtomsParseError::Lattice(n)),
        }
        Ok(atoms)
    }
}
