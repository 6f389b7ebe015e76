//! Configuration settings for running a single FHI-aims calculation

use std::{
    fmt::{Debug, Display},
    fs::read_to_string,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use wfl::calculator::{
    Command, Parameters, Property,
    aims::{AimsOptions, DEFAULT_PROPERTIES, OUTFILE},
    k_grid_from_density,
    rundir::KeepFiles,
};


/// Commands can either be a shell command line, including the redirection to
/// aims.out, or an argument vector whose output is captured in aims.out
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[serde(untagged)]
enum CommandSrc {
    Line(String),
    Argv(Vec<String>),
}

impl From<CommandSrc> for Command {
    fn from(value: CommandSrc) -> Self {
        match value {
            CommandSrc::Line(s) => Command::Shell(s),
            CommandSrc::Argv(argv) => Command::Argv {
                argv,
                stdout: Some(OUTFILE.into()),
            },
        }
    }
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    /// Which files to keep in each run directory. `true` keeps everything,
    /// `false` keeps nothing after a successful run, and `"default"` keeps
    /// control.in, geometry.in, and aims.out. A list of globs keeps the
    /// matching files. Files needed to inspect a failed run are always kept.
    keep_files: Option<KeepFiles>,

    /// The prefix for run directory names. Defaults to `run_Aims_`.
    rundir_prefix: Option<String>,

    /// The directory to create run directories in. Defaults to the current
    /// directory.
    workdir: Option<PathBuf>,

    /// An optional directory to actually run the calculations in. Kept files
    /// are moved back to the run directory afterwards.
    scratchdir: Option<PathBuf>,

    /// The FHI-aims executable, with any launcher like `srun` or `mpirun` but
    /// without redirection.
    calculator_exec: Option<String>,

    /// The full command to run instead of `calculator_exec`.
    command: Option<CommandSrc>,

    /// The density of k-points per reciprocal Å, used to set k_grid for
    /// periodic systems.
    k_grid_density: Option<f64>,

    /// The properties to calculate. Defaults to energy, forces, and stress.
    properties: Option<Vec<Property>>,

    /// The contents of control.in, apart from the species defaults.
    #[serde(default)]
    parameters: Parameters,
}

/// Construct a full `Config` using [Config::load] on a TOML file
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[serde(from = "RawConfig")]
pub struct Config {
    pub keep_files: KeepFiles,
    pub rundir_prefix: String,
    pub workdir: Option<PathBuf>,
    pub scratchdir: Option<PathBuf>,
    pub calculator_exec: Option<String>,
    pub command: Option<Command>,

    /// k-points per reciprocal Å, if k_grid is set from the cell
    pub k_grid_density: Option<f64>,

    pub properties: Vec<Property>,
    pub parameters: Parameters,
}

impl From<RawConfig> for Config {
    fn from(rc: RawConfig) -> Self {
        Self {
            keep_files: rc.keep_files.unwrap_or_default(),
            rundir_prefix: rc
                .rundir_prefix
                .unwrap_or_else(|| AimsOptions::default().rundir_prefix),
            workdir: rc.workdir,
            scratchdir: rc.scratchdir,
            calculator_exec: rc.calculator_exec,
            command: rc.command.map(CommandSrc::into),
            k_grid_density: rc.k_grid_density,
            properties: rc
                .properties
                .unwrap_or_else(|| DEFAULT_PROPERTIES.to_vec()),
            parameters: rc.parameters,
        }
    }
}

impl Config {
    /// load a [Config] from the TOML file specified by `filename`
    pub fn load<P>(filename: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path> + Debug,
    {
        let contents = read_to_string(&filename).with_context(|| {
            format!("failed to load config file {filename:?}")
        })?;
        toml::from_str(&contents).with_context(|| {
            format!("failed to deserialize config file {filename:?}")
        })
    }

    /// the options for constructing an [wfl::calculator::aims::Aims]
    /// calculator from `self`
    pub fn aims_options(&self) -> AimsOptions {
        AimsOptions {
            keep_files: self.keep_files.clone(),
            rundir_prefix: self.rundir_prefix.clone(),
            workdir: self.workdir.clone(),
            scratchdir: self.scratchdir.clone(),
            calculator_exec: self.calculator_exec.clone(),
            command: self.command.clone(),
            get_k_grid: self.k_grid_density.map(k_grid_from_density),
            parameters: self.parameters.clone(),
        }
    }
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Config {
            keep_files,
            rundir_prefix,
            workdir,
            scratchdir,
            calculator_exec,
            command,
            k_grid_density,
            properties,
            parameters,
        } = self;
        writeln!(f, "Configuration Options:")?;
        writeln!(f, "keep_files = {keep_files:?}")?;
        writeln!(f, "rundir_prefix = {rundir_prefix}")?;
        writeln!(f, "workdir = {workdir:?}")?;
        writeln!(f, "scratchdir = {scratchdir:?}")?;
        writeln!(f, "calculator_exec = {calculator_exec:?}")?;
        if let Some(command) = command {
            writeln!(f, "command = {command}")?;
        }
        writeln!(f, "k_grid_density = {k_grid_density:?}")?;
        writeln!(f, "properties = {properties:?}")?;
        writeln!(f, "parameters = {{")?;
        for (k, v) in parameters {
            writeln!(f, "  {k} = {v}")?;
        }
        writeln!(f, "}}")
    }
}
