//! Run directories for file-based calculators: one fresh directory per
//! calculation, pruned afterwards according to a [KeepFiles] policy

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;

use super::CalcError;

#[derive(Deserialize)]
#[serde(untagged)]
enum KeepFilesSrc {
    Flag(bool),
    Word(String),
    Globs(Vec<String>),
}

/// Which files to keep from a run directory once a calculation is done
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "KeepFilesSrc")]
pub enum KeepFiles {
    /// keep everything. `true` in config files
    All,

    /// keep nothing unless the calculation fails. `false` in config files
    Nothing,

    /// keep only the calculator's default files. `"default"` in config files
    #[default]
    Default,

    /// keep files matching any of these globs
    Globs(Vec<String>),
}

impl TryFrom<KeepFilesSrc> for KeepFiles {
    type Error = String;

    fn try_from(value: KeepFilesSrc) -> Result<Self, Self::Error> {
        match value {
            KeepFilesSrc::Flag(true) => Ok(Self::All),
            KeepFilesSrc::Flag(false) => Ok(Self::Nothing),
            KeepFilesSrc::Word(w) if w == "default" => Ok(Self::Default),
            KeepFilesSrc::Word(w) => Err(format!(
                "unknown keep_files value `{w}`, expected a bool, \"default\", \
                 or a list of globs"
            )),
            KeepFilesSrc::Globs(g) => Ok(Self::Globs(g)),
        }
    }
}

impl KeepFiles {
    /// The policy to apply after a calculation. [Default](Self::Default)
    /// becomes the globs in `default_keep`, and a failed calculation always
    /// keeps at least `default_keep`
    pub fn on_completion(
        &self,
        default_keep: &[&str],
        succeeded: bool,
    ) -> Self {
        let defaults = || default_keep.iter().map(|s| s.to_string());
        match self {
            Self::All => Self::All,
            Self::Globs(g) if !succeeded => {
                let extra: Vec<_> =
                    defaults().filter(|d| !g.contains(d)).collect();
                let mut g = g.clone();
                g.extend(extra);
                Self::Globs(g)
            }
            Self::Nothing if succeeded => Self::Nothing,
            Self::Globs(g) => Self::Globs(g.clone()),
            Self::Nothing | Self::Default => Self::Globs(defaults().collect()),
        }
    }
}

/// translate a shell glob with `*` and `?` wildcards into an anchored regex
fn glob_to_regex(glob: &str) -> Result<Regex, CalcError> {
    let mut re = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| {
        CalcError::Config(format!("invalid keep_files glob `{glob}`: {e}"))
    })
}

/// apply `keep` to the top-level entries of `dir`. `keep` must already have
/// been through [KeepFiles::on_completion]
fn prune(dir: &Path, keep: &KeepFiles) -> Result<(), CalcError> {
    let globs: Vec<Regex> = match keep {
        KeepFiles::All => return Ok(()),
        KeepFiles::Nothing | KeepFiles::Default => Vec::new(),
        KeepFiles::Globs(g) => {
            g.iter().map(|g| glob_to_regex(g)).collect::<Result<_, _>>()?
        }
    };
    for entry in fs::read_dir(dir).map_err(CalcError::io(dir))? {
        let entry = entry.map_err(CalcError::io(dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if globs.iter().any(|g| g.is_match(&name)) {
            continue;
        }
        let path = entry.path();
        let res = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        res.map_err(CalcError::io(&path))?;
    }
    Ok(())
}

/// move `from` to `to`, copying if a rename is not possible, as between file
/// systems
fn move_entry(from: &Path, to: &Path) -> Result<(), CalcError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if from.is_dir() {
        fs::create_dir_all(to).map_err(CalcError::io(to))?;
        for entry in fs::read_dir(from).map_err(CalcError::io(from))? {
            let entry = entry.map_err(CalcError::io(from))?;
            move_entry(&entry.path(), &to.join(entry.file_name()))?;
        }
        fs::remove_dir(from).map_err(CalcError::io(from))
    } else {
        fs::copy(from, to).map_err(CalcError::io(to))?;
        fs::remove_file(from).map_err(CalcError::io(from))
    }
}

/// Creates the directory a calculation runs in and cleans it up afterwards
pub trait RunDirLifecycle {
    /// create a fresh directory and return the path the program should run in
    fn setup_rundir(&mut self) -> Result<PathBuf, CalcError>;

    /// Prune the directory made by the last call to `setup_rundir`, keeping
    /// `default_keep` as the calculator's default files. Does nothing if
    /// there is no such directory
    fn clean_rundir(
        &mut self,
        default_keep: &[&str],
        succeeded: bool,
    ) -> Result<(), CalcError>;
}

#[derive(Clone, Debug)]
struct ActiveRun {
    /// the directory under `workdir` where kept files end up
    rundir: PathBuf,

    /// where the program actually runs. the same as `rundir` unless there is a
    /// scratch directory
    exec_dir: PathBuf,
}

impl ActiveRun {
    /// prune `exec_dir` down to `keep` and move what is left to `rundir`
    fn collect(&self, keep: &KeepFiles) -> Result<(), CalcError> {
        let Self { rundir, exec_dir } = self;
        prune(exec_dir, keep)?;
        if exec_dir == rundir {
            return Ok(());
        }
        for entry in fs::read_dir(exec_dir).map_err(CalcError::io(exec_dir))? {
            let entry = entry.map_err(CalcError::io(exec_dir))?;
            move_entry(&entry.path(), &rundir.join(entry.file_name()))?;
        }
        fs::remove_dir_all(exec_dir).map_err(CalcError::io(exec_dir))
    }

    /// remove a scratch `exec_dir` that `collect` failed to empty
    fn remove_scratch(&self) {
        if self.exec_dir == self.rundir || !self.exec_dir.exists() {
            return;
        }
        warn!(
            "removing {} after failing to move its files to {}",
            self.exec_dir.display(),
            self.rundir.display()
        );
        if let Err(e) = fs::remove_dir_all(&self.exec_dir) {
            warn!("failed to remove {} with {e}", self.exec_dir.display());
        }
    }
}

/// Run directories named `<rundir_prefix><random>` under `workdir`,
/// optionally executed in a directory of the same name under `scratchdir`
#[derive(Clone, Debug)]
pub struct FileIo {
    pub keep_files: KeepFiles,
    pub rundir_prefix: String,

    /// defaults to the current directory
    pub workdir: Option<PathBuf>,

    /// a directory with fast local I/O, for example. kept files are moved
    /// back to the run directory under `workdir`
    pub scratchdir: Option<PathBuf>,

    active: Option<ActiveRun>,
    last_rundir: Option<PathBuf>,
}

impl FileIo {
    pub fn new(
        keep_files: KeepFiles,
        rundir_prefix: impl Into<String>,
        workdir: Option<PathBuf>,
        scratchdir: Option<PathBuf>,
    ) -> Self {
        Self {
            keep_files,
            rundir_prefix: rundir_prefix.into(),
            workdir,
            scratchdir,
            active: None,
            last_rundir: None,
        }
    }

    /// the run directory of the most recent calculation. it only still exists
    /// if some of its files were kept
    pub fn last_rundir(&self) -> Option<&Path> {
        self.last_rundir.as_deref()
    }
}

impl RunDirLifecycle for FileIo {
    fn setup_rundir(&mut self) -> Result<PathBuf, CalcError> {
        let workdir =
            self.workdir.clone().unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&workdir).map_err(CalcError::io(&workdir))?;
        let rundir = tempfile::Builder::new()
            .prefix(&self.rundir_prefix)
            .tempdir_in(&workdir)
            .map_err(CalcError::io(&workdir))?
            .keep();
        let exec_dir = match (&self.scratchdir, rundir.file_name()) {
            (Some(scratch), Some(name)) => {
                let exec_dir = scratch.join(name);
                fs::create_dir_all(&exec_dir)
                    .map_err(CalcError::io(&exec_dir))?;
                exec_dir
            }
            _ => rundir.clone(),
        };
        debug!(
            "created run directory {} (running in {})",
            rundir.display(),
            exec_dir.display()
        );
        self.last_rundir = Some(rundir.clone());
        self.active = Some(ActiveRun {
            rundir,
            exec_dir: exec_dir.clone(),
        });
        Ok(exec_dir)
    }

    fn clean_rundir(
        &mut self,
        default_keep: &[&str],
        succeeded: bool,
    ) -> Result<(), CalcError> {
        let Some(run) = self.active.take() else {
            return Ok(());
        };
        let keep = self.keep_files.on_completion(default_keep, succeeded);
        debug!("cleaning {} with {keep:?}", run.exec_dir.display());
        if let Err(e) = run.collect(&keep) {
            run.remove_scratch();
            return Err(e);
        }

        let ActiveRun { rundir, .. } = run;
        let empty = fs::read_dir(&rundir)
            .map_err(CalcError::io(&rundir))?
            .next()
            .is_none();
        if empty {
            if let Err(e) = fs::remove_dir(&rundir) {
                warn!("failed to remove empty {} with {e}", rundir.display());
            }
        }
        Ok(())
    }
}
