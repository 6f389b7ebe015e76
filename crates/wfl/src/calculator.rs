use std::{
    collections::BTreeMap,
    fmt::Display,
    fs::File,
    path::{Path, PathBuf},
    process::ExitStatus,
};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atoms::Atoms;

pub mod aims;
pub mod rundir;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Energy,
    FreeEnergy,
    Forces,
    Stress,
    Dipole,
    Charges,
    Magmom,
    Magmoms,
}

/// What changed about a system since the last calculation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Positions,
    Numbers,
    Cell,
    Pbc,
    InitialCharges,
    InitialMagmoms,
}

pub const ALL_CHANGES: [Change; 6] = [
    Change::Positions,
    Change::Numbers,
    Change::Cell,
    Change::Pbc,
    Change::InitialCharges,
    Change::InitialMagmoms,
];

/// A single simulation input value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Param>),
}

impl Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::Bool(b) => write!(f, ".{b}."),
            Param::Int(i) => write!(f, "{i}"),
            Param::Float(x) => write!(f, "{x:?}"),
            Param::Str(s) => write!(f, "{s}"),
            Param::List(v) => {
                for (i, p) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

pub type Parameters = BTreeMap<String, Param>;

/// The quantities parsed from a finished calculation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Results {
    /// total energy in eV
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_energy: Option<f64>,

    /// forces in eV/Å
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forces: Option<Vec<[f64; 3]>>,

    /// stress in eV/Å³, in Voigt order xx yy zz yz xz xy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress: Option<[f64; 6]>,
}

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("invalid calculator configuration: {0}")]
    Config(String),

    #[error("no atoms to calculate")]
    NoAtoms,

    #[error("property {0:?} is not implemented")]
    NotImplemented(Property),

    #[error("k_grid must be three whitespace-separated integers, got `{0}`")]
    BadKGrid(String),

    #[error("no species_dir parameter and AIMS_SPECIES_DIR is not set")]
    NoSpeciesDir,

    #[error("unknown element `{0}`")]
    Element(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Exec { command: String, status: ExitStatus },

    #[error("{0} not found")]
    FileNotFound(String),

    #[error("calculation in {0} did not finish normally")]
    ErrorInOutput(String),

    #[error("energy not found in {0}")]
    EnergyNotFound(String),

    #[error("failed to parse `{value}` in {file}")]
    Parse { file: String, value: String },
}

impl CalcError {
    /// returns a closure wrapping an [std::io::Error] on `path`
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.display().to_string();
        move |source| Self::Io { path, source }
    }
}

/// Runs an external program in a directory prepared for it
pub trait Runner {
    fn run(&self, dir: &Path) -> Result<(), CalcError>;
}

impl<F> Runner for F
where
    F: Fn(&Path) -> Result<(), CalcError>,
{
    fn run(&self, dir: &Path) -> Result<(), CalcError> {
        self(dir)
    }
}

/// An external command
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// a shell command line, run with `bash -c`, including any redirection
    Shell(String),

    /// an argument vector, run directly, with standard output optionally
    /// written to the file `stdout` in the run directory
    Argv {
        argv: Vec<String>,
        stdout: Option<PathBuf>,
    },
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Shell(s) => write!(f, "{s}"),
            Command::Argv { argv, stdout } => {
                write!(f, "{}", argv.join(" "))?;
                if let Some(out) = stdout {
                    write!(f, " > {}", out.display())?;
                }
                Ok(())
            }
        }
    }
}

impl Runner for Command {
    fn run(&self, dir: &Path) -> Result<(), CalcError> {
        let mut cmd = match self {
            Command::Shell(s) => {
                let mut cmd = std::process::Command::new("bash");
                cmd.arg("-c").arg(s);
                cmd
            }
            Command::Argv { argv, stdout } => {
                let Some((prog, args)) = argv.split_first() else {
                    return Err(CalcError::Config("empty command".to_owned()));
                };
                let mut cmd = std::process::Command::new(prog);
                cmd.args(args);
                if let Some(out) = stdout {
                    let path = dir.join(out);
                    let file =
                        File::create(&path).map_err(CalcError::io(&path))?;
                    cmd.stdout(file);
                }
                cmd
            }
        };
        info!("running `{self}` in {}", dir.display());
        let status = cmd.current_dir(dir).status().map_err(|source| {
            CalcError::Spawn {
                command: self.to_string(),
                source,
            }
        })?;
        if !status.success() {
            return Err(CalcError::Exec {
                command: self.to_string(),
                status,
            });
        }
        Ok(())
    }
}

/// A function giving a system-specific k_grid, as `"<k1> <k2> <k3>"`
pub type KGridFn = Box<dyn Fn(&Atoms) -> String>;

/// A k_grid function sampling each reciprocal lattice vector `b` (including
/// the factor of 2π) with `ceil(|b| * density)` points, and at least one.
/// Systems without a usable cell get `1 1 1`
pub fn k_grid_from_density(density: f64) -> KGridFn {
    Box::new(move |atoms: &Atoms| {
        let Some(recip) = atoms.reciprocal_cell() else {
            return "1 1 1".to_owned();
        };
        let ks: Vec<_> = (0..3)
            .map(|i| {
                let k = (recip.row(i).norm() * density).ceil() as usize;
                k.max(1).to_string()
            })
            .collect();
        ks.join(" ")
    })
}

/// Decide how to treat the periodicity of `atoms`. Returns whether the system
/// should be treated as non-periodic, along with `properties` minus `stress`
/// in that case. Systems periodic in only some directions are an error unless
/// `allow_mixed` is set, in which case they count as non-periodic
pub fn handle_nonperiodic(
    atoms: &Atoms,
    properties: &[Property],
    allow_mixed: bool,
) -> Result<(bool, Vec<Property>), CalcError> {
    let nonperiodic = if !atoms.any_pbc() {
        true
    } else if atoms.all_pbc() {
        false
    } else if allow_mixed {
        true
    } else {
        return Err(CalcError::Config(format!(
            "not allowed to handle mixed periodicity {:?}",
            atoms.pbc
        )));
    };
    let properties = properties
        .iter()
        .copied()
        .filter(|&p| !nonperiodic || p != Property::Stress)
        .collect();
    Ok((nonperiodic, properties))
}
