//! FHI-aims calculator

use std::{
    fmt::Display,
    fs::{self, read_to_string},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log::{debug, warn};
use regex::Regex;

use crate::atoms::{Atoms, atomic_number};

use super::{
    CalcError, Change, Command, KGridFn, Param, Parameters, Property, Results,
    Runner, handle_nonperiodic,
    rundir::{FileIo, KeepFiles, RunDirLifecycle},
};


pub const CONTROL_FILE: &str = "control.in";
pub const GEOMETRY_FILE: &str = "geometry.in";
pub const OUTFILE: &str = "aims.out";

/// the files kept by default, enough for a NOMAD upload
pub const DEFAULT_KEEP_FILES: [&str; 3] =
    [CONTROL_FILE, GEOMETRY_FILE, OUTFILE];

pub const DEFAULT_PROPERTIES: [Property; 3] =
    [Property::Energy, Property::Forces, Property::Stress];

pub const IMPLEMENTED_PROPERTIES: [Property; 4] = [
    Property::Energy,
    Property::FreeEnergy,
    Property::Forces,
    Property::Stress,
];

/// the key set to `true` in [Atoms::info] when a calculation fails
pub const FAILED_MARKER: &str = "DFT_FAILED_AIMS";

/// environment variable holding the command used when neither
/// `calculator_exec` nor `command` is given
pub const COMMAND_ENV: &str = "ASE_AIMS_COMMAND";

/// environment variable holding the species defaults directory when there is
/// no `species_dir` parameter
pub const SPECIES_ENV: &str = "AIMS_SPECIES_DIR";

const SEPARATOR: &str =
    "#============================================================";

static CELL: OnceLock<[Regex; 5]> = OnceLock::new();

/// Options for [Aims::new]
pub struct AimsOptions {
    /// which files to keep from each run directory
    pub keep_files: KeepFiles,

    /// run directory name prefix
    pub rundir_prefix: String,

    /// where run directories are created, defaults to `.` at calculate time
    pub workdir: Option<PathBuf>,

    /// where calculations actually run, for example a local disk with fast
    /// file I/O. kept files are moved back to the run directory
    pub scratchdir: Option<PathBuf>,

    /// The command for FHI-aims without any redirection, like `srun -n 4
    /// aims.x`. Mutually exclusive with `command`
    pub calculator_exec: Option<String>,

    /// the full command, including writing to aims.out
    pub command: Option<Command>,

    /// gives a system-specific `k_grid` parameter for periodic systems
    pub get_k_grid: Option<KGridFn>,

    /// simulation parameters written to control.in
    pub parameters: Parameters,
}

impl Default for AimsOptions {
    fn default() -> Self {
        Self {
            keep_files: KeepFiles::Default,
            rundir_prefix: "run_Aims_".to_owned(),
            workdir: None,
            scratchdir: None,
            calculator_exec: None,
            command: None,
            get_k_grid: None,
            parameters: Parameters::new(),
        }
    }
}

/// A calculator running FHI-aims in a fresh run directory for every
/// calculation. `R` runs the program and `D` manages the run directories.
///
/// The parameters are adjusted to each system's periodicity during
/// [calculate](Self::calculate), but always restored to their values at
/// construction afterwards.
pub struct Aims<R = Command, D = FileIo> {
    runner: R,
    files: D,
    parameters: Parameters,
    initial_parameters: Parameters,
    get_k_grid: Option<KGridFn>,
    atoms: Option<Atoms>,
    results: Option<Results>,
}

impl Aims {
    pub fn new(opts: AimsOptions) -> Result<Self, CalcError> {
        let command = match (opts.calculator_exec, opts.command) {
            (Some(_), Some(_)) => {
                return Err(CalcError::Config(
                    "cannot specify both calculator_exec and command".into(),
                ));
            }
            (Some(exec), None) => Command::Shell(format!("{exec} > {OUTFILE}")),
            (None, Some(command)) => command,
            (None, None) => match std::env::var(COMMAND_ENV) {
                Ok(cmd) => Command::Shell(format!("{cmd} > {OUTFILE}")),
                Err(_) => {
                    return Err(CalcError::Config(format!(
                        "one of calculator_exec, command, or the \
                         {COMMAND_ENV} environment variable is required"
                    )));
                }
            },
        };
        let files = FileIo::new(
            opts.keep_files,
            opts.rundir_prefix,
            opts.workdir,
            opts.scratchdir,
        );
        Ok(Self::with_parts(
            command,
            files,
            opts.parameters,
            opts.get_k_grid,
        ))
    }
}

impl<R: Runner, D: RunDirLifecycle> Aims<R, D> {
    pub fn with_parts(
        runner: R,
        files: D,
        parameters: Parameters,
        get_k_grid: Option<KGridFn>,
    ) -> Self {
        Self {
            runner,
            files,
            initial_parameters: parameters.clone(),
            parameters,
            get_k_grid,
            atoms: None,
            results: None,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn files(&self) -> &D {
        &self.files
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn initial_parameters(&self) -> &Parameters {
        &self.initial_parameters
    }

    /// the calculator's copy of the last system calculated
    pub fn atoms(&self) -> Option<&Atoms> {
        self.atoms.as_ref()
    }

    pub fn results(&self) -> Option<&Results> {
        self.results.as_ref()
    }

    /// Run a calculation of `properties` on `atoms`, or on the calculator's
    /// copy of the previous system if `atoms` is `None`.
    ///
    /// On failure, `atoms` gets [FAILED_MARKER] set in its info and the error
    /// is returned as is. Either way, the run directory is cleaned up and the
    /// parameters are reset to their initial values.
    pub fn calculate(
        &mut self,
        atoms: Option<&mut Atoms>,
        properties: &[Property],
        system_changes: &[Change],
    ) -> Result<Results, CalcError> {
        if let Some(&p) =
            properties.iter().find(|p| !IMPLEMENTED_PROPERTIES.contains(p))
        {
            return Err(CalcError::NotImplemented(p));
        }
        if let Some(a) = atoms.as_deref() {
            self.atoms = Some(a.clone());
        }
        if !system_changes.is_empty() {
            self.results = None;
        }

        let res = self
            .setup_calc_params(properties)
            .and_then(|properties| self.execute(&properties));
        let succeeded = res.is_ok();

        let target = match atoms {
            Some(a) => Some(a),
            None => self.atoms.as_mut(),
        };
        if let Some(target) = target {
            if succeeded {
                target.info.remove(FAILED_MARKER);
            } else {
                target.info.insert(
                    FAILED_MARKER.to_owned(),
                    serde_json::Value::Bool(true),
                );
            }
        }

        let cleaned = self.files.clean_rundir(&DEFAULT_KEEP_FILES, succeeded);
        self.parameters = self.initial_parameters.clone();

        match (res, cleaned) {
            (Ok(results), Ok(())) => {
                self.results = Some(results.clone());
                Ok(results)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(clean)) => {
                warn!("failed to clean run directory after `{e}`: {clean}");
                Err(e)
            }
        }
    }

    /// Remove the entries of `properties` and `self.parameters` that don't fit
    /// the periodicity of the current system, or set a system-specific k_grid
    /// for periodic systems. Returns the remaining properties
    fn setup_calc_params(
        &mut self,
        properties: &[Property],
    ) -> Result<Vec<Property>, CalcError> {
        let atoms = self.atoms.as_ref().ok_or(CalcError::NoAtoms)?;
        let (nonperiodic, properties) =
            handle_nonperiodic(atoms, properties, true)?;
        if nonperiodic {
            if !atoms.any_pbc() {
                self.parameters.retain(|k, _| !periodic_only(k));
            }
        } else if let Some(get_k_grid) = &self.get_k_grid {
            let k_grid = get_k_grid(atoms);
            if !is_k_grid(&k_grid) {
                return Err(CalcError::BadKGrid(k_grid));
            }
            debug!("setting k_grid to {k_grid}");
            self.parameters.insert("k_grid".to_owned(), Param::Str(k_grid));
        }
        Ok(properties)
    }

    fn execute(
        &mut self,
        properties: &[Property],
    ) -> Result<Results, CalcError> {
        let dir = self.files.setup_rundir()?;
        let atoms = self.atoms.as_ref().ok_or(CalcError::NoAtoms)?;
        write_input(&dir, atoms, &self.parameters, properties)?;
        self.runner.run(&dir)?;
        let mut results = read_output(&dir.join(OUTFILE), atoms.len())?;
        if !properties.contains(&Property::Forces) {
            results.forces = None;
        }
        if !properties.contains(&Property::Stress) {
            results.stress = None;
        }
        Ok(results)
    }
}

/// parameters that only make sense for periodic systems or stress
/// calculations, like k_grid, k_grid_density, k_offset, or
/// sc_accuracy_stress
fn periodic_only(key: &str) -> bool {
    key.contains("k_grid")
        || key.starts_with("k_")
        || key.contains("stress")
        || key == "relax_unit_cell"
        || key == "external_pressure"
}

fn is_k_grid(s: &str) -> bool {
    let fields: Vec<_> = s.split_whitespace().collect();
    fields.len() == 3 && fields.iter().all(|f| f.parse::<u32>().is_ok())
}

struct Control<'a> {
    parameters: &'a Parameters,
    properties: &'a [Property],
    species: Vec<String>,
}

impl Display for Control<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{SEPARATOR}")?;
        writeln!(f, "# FHI-aims control.in written by wfl")?;
        writeln!(f, "{SEPARATOR}")?;
        for (key, val) in self.parameters {
            match (key.as_str(), val) {
                ("species_dir", _) => {}
                ("output", Param::List(outputs)) => {
                    for out in outputs {
                        writeln!(f, "{key:<35}{out}")?;
                    }
                }
                _ => writeln!(f, "{key:<35}{val}")?,
            }
        }
        if self.properties.contains(&Property::Forces)
            && !self.parameters.contains_key("compute_forces")
        {
            writeln!(f, "{:<35}{}", "compute_forces", Param::Bool(true))?;
        }
        if self.properties.contains(&Property::Stress)
            && !self.parameters.contains_key("compute_analytical_stress")
            && !self.parameters.contains_key("compute_numerical_stress")
        {
            writeln!(
                f,
                "{:<35}{}",
                "compute_analytical_stress",
                Param::Bool(true)
            )?;
        }
        writeln!(f, "{SEPARATOR}")?;
        for species in &self.species {
            write!(f, "{species}")?;
            if !species.ends_with('\n') {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Build the contents of control.in: the parameters, requests for forces and
/// stress if needed, and the species defaults for every element in `atoms`
/// from the `species_dir` parameter or [SPECIES_ENV]
pub fn control_string(
    atoms: &Atoms,
    parameters: &Parameters,
    properties: &[Property],
) -> Result<String, CalcError> {
    let species_dir = match parameters.get("species_dir") {
        Some(Param::Str(dir)) => PathBuf::from(dir),
        Some(p) => {
            return Err(CalcError::Config(format!(
                "species_dir must be a string, got {p:?}"
            )));
        }
        None => std::env::var_os(SPECIES_ENV)
            .map(PathBuf::from)
            .ok_or(CalcError::NoSpeciesDir)?,
    };
    let mut species = Vec::new();
    for sym in atoms.unique_symbols() {
        let z = atomic_number(sym)
            .ok_or_else(|| CalcError::Element(sym.to_owned()))?;
        let path = species_dir.join(format!("{z:02}_{sym}_default"));
        species.push(read_to_string(&path).map_err(CalcError::io(&path))?);
    }
    Ok(Control {
        parameters,
        properties,
        species,
    }
    .to_string())
}

/// write control.in and geometry.in for `atoms` in `dir`
pub fn write_input(
    dir: &Path,
    atoms: &Atoms,
    parameters: &Parameters,
    properties: &[Property],
) -> Result<(), CalcError> {
    let control = control_string(atoms, parameters, properties)?;
    let path = dir.join(CONTROL_FILE);
    fs::write(&path, control).map_err(CalcError::io(&path))?;
    let path = dir.join(GEOMETRY_FILE);
    fs::write(&path, atoms.to_string()).map_err(CalcError::io(&path))
}

/// parse the `nth` field of `line` as a float
fn parse_field(
    line: &str,
    nth: usize,
    outname: &str,
) -> Result<f64, CalcError> {
    let field = line.split_whitespace().nth(nth).unwrap_or_default();
    field.parse().map_err(|_| CalcError::Parse {
        file: outname.to_owned(),
        value: line.trim().to_owned(),
    })
}

/// parse fields `nth..nth+3` of `line` as floats
fn parse_vec(
    line: &str,
    nth: usize,
    outname: &str,
) -> Result<[f64; 3], CalcError> {
    Ok([
        parse_field(line, nth, outname)?,
        parse_field(line, nth + 1, outname)?,
        parse_field(line, nth + 2, outname)?,
    ])
}

/// Read the results of a finished calculation on `natoms` atoms from the
/// aims.out file at `path`. Every quantity is taken from its last occurrence
/// in the file, and the stress is returned in Voigt order
pub fn read_output(path: &Path, natoms: usize) -> Result<Results, CalcError> {
    let outname = path.display().to_string();
    let contents = match read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CalcError::FileNotFound(outname));
        }
        Err(e) => return Err(CalcError::io(path)(e)),
    };

    let [finished, energy_re, free_re, forces_re, stress_re] =
        CELL.get_or_init(|| {
            [
                Regex::new(r"Have a nice day").unwrap(),
                Regex::new(r"^\s*\| Total energy corrected\s+:").unwrap(),
                Regex::new(r"^\s*\| Electronic free energy\s+:").unwrap(),
                Regex::new(r"^\s*Total atomic forces").unwrap(),
                Regex::new(r"Analytical stress tensor - Symmetrized").unwrap(),
            ]
        });

    if !finished.is_match(&contents) {
        return Err(CalcError::ErrorInOutput(outname));
    }

    let lines: Vec<_> = contents.lines().collect();
    let mut results = Results::default();
    for (i, line) in lines.iter().enumerate() {
        if energy_re.is_match(line) {
            results.energy = Some(parse_field(line, 5, &outname)?);
        } else if free_re.is_match(line) {
            results.free_energy = Some(parse_field(line, 5, &outname)?);
        } else if forces_re.is_match(line) {
            let block = lines.get(i + 1..i + 1 + natoms).ok_or_else(|| {
                CalcError::Parse {
                    file: outname.clone(),
                    value: line.trim().to_owned(),
                }
            })?;
            let forces = block
                .iter()
                .map(|l| parse_vec(l, 2, &outname))
                .collect::<Result<Vec<_>, _>>()?;
            results.forces = Some(forces);
        } else if stress_re.is_match(line) {
            let mut s = [[0.0; 3]; 3];
            for (j, row) in s.iter_mut().enumerate() {
                let l = lines.get(i + 5 + j).copied().unwrap_or_default();
                *row = parse_vec(l, 2, &outname)?;
            }
            results.stress =
                Some([s[0][0], s[1][1], s[2][2], s[1][2], s[0][2], s[0][1]]);
        }
    }

    if results.energy.is_none() {
        return Err(CalcError::EnergyNotFound(outname));
    }
    Ok(results)
}
