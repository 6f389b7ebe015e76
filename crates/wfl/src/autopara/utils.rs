use std::{fmt::Display, fs::read_to_string, iter::FusedIterator, path::Path};

use log::warn;
use regex::Regex;
use serde_yaml::Value;

use super::{
    RemoteInfo, RemoteInfoError,
    callpath::{self, CallPath},
};

/// the environment variable consulted when no remote info is passed in
pub const DEFAULT_ENV_VAR: &str = "WFL_EXPYRE_INFO";

/// Iterator over `iter` in groups of `n` items. See [grouper]
#[derive(Clone, Debug)]
pub struct Grouper<I> {
    iter: I,
    n: usize,
}

/// Group the items of `iterable` into `Vec`s of `n` items each, in order. The
/// last group is shorter if the items run out, and an `n` of zero yields
/// nothing. Nothing is pulled from `iterable` until a group is requested.
pub fn grouper<I: IntoIterator>(n: usize, iterable: I) -> Grouper<I::IntoIter> {
    Grouper {
        iter: iterable.into_iter(),
        n,
    }
}

impl<I: Iterator> Iterator for Grouper<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n == 0 {
            return None;
        }
        let chunk: Vec<_> = self.iter.by_ref().take(self.n).collect();
        (!chunk.is_empty()).then_some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.n == 0 {
            return (0, Some(0));
        }
        let (lo, hi) = self.iter.size_hint();
        (lo.div_ceil(self.n), hi.map(|h| h.div_ceil(self.n)))
    }
}

impl<I: FusedIterator> FusedIterator for Grouper<I> {}

/// Who is asking for remote info
#[derive(Clone, Copy, Debug)]
pub enum Caller<'a> {
    /// matched by equality with the keys of a [RemoteInfoConfig::Labeled]
    Label(&'a str),

    /// matched by the trailing frames of the path, see [RemoteInfoConfig]
    Path(&'a CallPath),
}

impl Display for Caller<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Caller::Label(l) => write!(f, "remote_label {l}"),
            Caller::Path(p) => {
                write!(f, "call path {}", p.effective().join(" > "))
            }
        }
    }
}

/// Remote info as loaded from the environment or a file, ready to be resolved
/// against any number of callers
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteInfoConfig {
    /// the loaded mapping was itself a [RemoteInfo]
    Direct(RemoteInfo),

    /// a dictionary of [RemoteInfo] kwargs. each key is a comma-separated list
    /// of patterns, and `source` names where the dictionary came from
    Labeled {
        source: String,
        entries: Vec<(String, Value)>,
    },
}

impl RemoteInfoConfig {
    /// Load from the environment variable `env_var`, returning `None` if it is
    /// not set. A value that is not valid UTF-8 can only be a filename, and is
    /// loaded as one without any conversion
    pub fn from_env(env_var: &str) -> Result<Option<Self>, RemoteInfoError> {
        let Some(raw) = std::env::var_os(env_var) else {
            return Ok(None);
        };
        match raw.to_str() {
            Some(s) => Self::from_env_value(env_var, s).map(Some),
            None => Self::load(&raw).map(Some),
        }
    }

    /// Interpret `raw`, the content of `env_var`, as YAML (or JSON) remote
    /// info. If `raw` doesn't parse, or parses to a plain string, it is taken
    /// to be the name of a file to [load](Self::load) instead.
    pub fn from_env_value(
        env_var: &str,
        raw: &str,
    ) -> Result<Self, RemoteInfoError> {
        match serde_yaml::from_str::<Value>(raw) {
            Ok(Value::String(filename)) => Self::load(filename),
            Ok(value) => Self::from_value(env_var, value),
            Err(e) => {
                // filenames don't usually have spaces
                if raw.contains(char::is_whitespace) {
                    warn!(
                        "remote_info \"{raw}\" from {env_var} has whitespace, \
                         but is not parseable as JSON/YAML with error {e}"
                    );
                }
                Self::load(raw)
            }
        }
    }

    /// load remote info from the YAML (or JSON) file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RemoteInfoError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let contents = read_to_string(path).map_err(|source| {
            RemoteInfoError::Io {
                path: name.clone(),
                source,
            }
        })?;
        let value = serde_yaml::from_str(&contents).map_err(|source| {
            RemoteInfoError::Yaml {
                path: name.clone(),
                source,
            }
        })?;
        Self::from_value(&name, value)
    }

    fn from_value(source: &str, value: Value) -> Result<Self, RemoteInfoError> {
        let Value::Mapping(map) = value else {
            return Err(RemoteInfoError::NotAMapping {
                source_name: source.to_owned(),
                got: format!("{value:?}"),
            });
        };
        if map.contains_key(RemoteInfo::MARKER) {
            warn!("{source} appears to be a RemoteInfo kwargs, using directly");
            return RemoteInfo::from_kwargs(Value::Mapping(map))
                .map(Self::Direct);
        }
        let mut entries = Vec::with_capacity(map.len());
        for (k, v) in map {
            let Value::String(k) = k else {
                return Err(RemoteInfoError::Key(k));
            };
            entries.push((k, v));
        }
        Ok(Self::Labeled {
            source: source.to_owned(),
            entries,
        })
    }

    /// Select the remote info for `caller`. A [Direct](Self::Direct) config
    /// applies to every caller. Otherwise the first key matching `caller` wins:
    /// a label must equal the key, while a call path matches if every
    /// comma-separated pattern in the key matches, as a regular expression
    /// anchored at the end, the corresponding frame at the end of the path.
    /// Returns `None` when no key matches or the matching value is null
    pub fn resolve(
        &self,
        caller: &Caller,
    ) -> Result<Option<RemoteInfo>, RemoteInfoError> {
        let (source, entries) = match self {
            Self::Direct(info) => return Ok(Some(info.clone())),
            Self::Labeled { source, entries } => (source, entries),
        };
        for (key, value) in entries {
            let matched = match caller {
                Caller::Label(label) => key == label,
                Caller::Path(path) => key_matches(key, path.effective())?,
            };
            if !matched {
                continue;
            }
            eprintln!("{source} matched key {key} for {caller}");
            return match value {
                Value::Null => Ok(None),
                v => RemoteInfo::from_kwargs(v.clone()).map(Some),
            };
        }
        Ok(None)
    }
}

/// whether every pattern in `key` matches its frame when the patterns are
/// right-aligned with `frames`
fn key_matches(key: &str, frames: &[String]) -> Result<bool, regex::Error> {
    let patterns: Vec<_> = key.split(',').map(str::trim).collect();
    if patterns.len() > frames.len() {
        return Ok(false);
    }
    let tail = &frames[frames.len() - patterns.len()..];
    for (pat, frame) in patterns.iter().zip(tail) {
        if !Regex::new(&format!("{pat}$"))?.is_match(frame) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Get the [RemoteInfo] for an operation. An explicit `remote_info` always
/// wins. Otherwise the environment variable `env_var` is loaded with
/// [RemoteInfoConfig::from_env] and resolved against `remote_label`, or
/// against the current thread's [call path](callpath) if no label is given.
/// Returns `None` if `env_var` is unset or nothing in it matches.
pub fn get_remote_info(
    remote_info: Option<RemoteInfo>,
    remote_label: Option<&str>,
    env_var: &str,
) -> Result<Option<RemoteInfo>, RemoteInfoError> {
    if remote_info.is_some() {
        return Ok(remote_info);
    }
    let Some(config) = RemoteInfoConfig::from_env(env_var)? else {
        return Ok(None);
    };
    match remote_label {
        Some(label) => config.resolve(&Caller::Label(label)),
        None => config.resolve(&Caller::Path(&callpath::current())),
    }
}
