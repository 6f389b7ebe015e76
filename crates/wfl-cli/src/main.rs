use std::{fs::read_to_string, io::BufRead, path::PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use wfl::{
    atoms::Atoms,
    autopara::{DEFAULT_ENV_VAR, callpath, get_remote_info, grouper},
    calculator::{ALL_CHANGES, aims::Aims},
};

use config::Config;

mod config;

/// workflow helpers for file-based atomistic calculations
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the remote info, as JSON, that applies to an operation. Prints
    /// null if there is none.
    RemoteInfo {
        /// Look up this label instead of matching the call path.
        #[arg(short, long)]
        label: Option<String>,

        /// The environment variable to read the remote info from. Its value is
        /// either the YAML or JSON remote info itself or the name of a file
        /// containing it.
        #[arg(short, long, default_value_t = String::from(DEFAULT_ENV_VAR))]
        env_var: String,

        /// A `file::function` frame of the call path to match, outermost
        /// first. May be repeated.
        #[arg(short, long = "frame")]
        frames: Vec<String>,
    },

    /// Split the lines of standard input into groups of `size`, printing each
    /// group as a JSON array.
    Group {
        #[arg(short = 'n', long, default_value_t = 1)]
        size: usize,
    },

    /// Run FHI-aims on a geometry.in file and print the results as JSON.
    Aims {
        /// input file
        #[arg(value_parser, default_value_t = String::from("aims.toml"))]
        config: String,

        /// the structure to calculate, in geometry.in format
        #[arg(short, long, default_value = "geometry.in")]
        geometry: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Cmd::RemoteInfo {
            label,
            env_var,
            frames,
        } => {
            let _guards: Vec<_> =
                frames.into_iter().map(callpath::enter).collect();
            let info = get_remote_info(None, label.as_deref(), &env_var)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Cmd::Group { size } => {
            let lines = std::io::stdin()
                .lock()
                .lines()
                .collect::<Result<Vec<_>, _>>()?;
            for group in grouper(size, lines) {
                println!("{}", serde_json::to_string(&group)?);
            }
        }
        Cmd::Aims { config, geometry } => {
            let config = Config::load(&config)?;
            info!("{config}");
            let name = geometry.display();
            let mut atoms: Atoms = read_to_string(&geometry)
                .with_context(|| format!("failed to read {name}"))?
                .parse()
                .with_context(|| format!("failed to parse {name}"))?;
            let mut aims = Aims::new(config.aims_options())?;
            let results = aims
                .calculate(Some(&mut atoms), &config.properties, &ALL_CHANGES)
                .with_context(|| {
                    format!("FHI-aims calculation on {name} failed")
                })?;
            if let Some(dir) =
                aims.files().last_rundir().filter(|d| d.exists())
            {
                eprintln!("kept files in {}", dir.display());
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }
    Ok(())
}
