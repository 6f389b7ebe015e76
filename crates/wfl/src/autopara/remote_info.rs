use serde::{Deserialize, Serialize};

use super::RemoteInfoError;

/// partitions can be given as a single name or a list of names
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[serde(untagged)]
enum PartitionsSrc {
    One(String),
    Many(Vec<String>),
}

impl From<PartitionsSrc> for Vec<String> {
    fn from(value: PartitionsSrc) -> Self {
        match value {
            PartitionsSrc::One(s) => vec![s],
            PartitionsSrc::Many(v) => v,
        }
    }
}

fn partitions<'de, D>(d: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<PartitionsSrc>::deserialize(d)?.map(Into::into))
}

/// The resources requested from the remote queuing system for each job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resources {
    /// maximum wall time, in whatever form the queue accepts (`"1h"`,
    /// `"30:00"`, ...)
    pub max_time: String,

    pub num_nodes: Option<usize>,

    pub num_cores: Option<usize>,

    pub max_mem_per_core: Option<String>,

    #[serde(default, deserialize_with = "partitions")]
    pub partitions: Option<Vec<String>>,
}

fn default_num_inputs() -> isize {
    -100
}

fn yes() -> bool {
    true
}

fn default_timeout() -> u64 {
    3600
}

fn default_check_interval() -> u64 {
    30
}

/// Where and how to run a batch of operations remotely. Built from a mapping
/// of keyword arguments, usually out of the `WFL_EXPYRE_INFO` environment
/// variable, and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteInfo {
    /// name of the remote system, as configured for the job-submission layer
    pub sys_name: String,

    pub job_name: String,

    pub resources: Resources,

    /// number of inputs per queued job. negative values are interpreted as
    /// the (absolute) number of jobs to split the inputs into
    #[serde(default = "default_num_inputs")]
    pub num_inputs_per_queued_job: isize,

    #[serde(default)]
    pub pre_cmds: Vec<String>,

    #[serde(default)]
    pub post_cmds: Vec<String>,

    #[serde(default)]
    pub env_vars: Vec<String>,

    #[serde(default)]
    pub input_files: Vec<String>,

    #[serde(default)]
    pub output_files: Vec<String>,

    #[serde(default)]
    pub header_extra: Vec<String>,

    #[serde(default = "yes")]
    pub exact_fit: bool,

    #[serde(default)]
    pub partial_node: bool,

    /// seconds to wait for remote jobs before giving up
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// seconds between polls of the remote queue
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    #[serde(default)]
    pub ignore_failed_jobs: bool,

    #[serde(default)]
    pub resubmit_killed_jobs: bool,

    /// argument names excluded from the job hash
    #[serde(default)]
    pub hash_ignore: Vec<String>,
}

impl RemoteInfo {
    /// the key whose presence marks a mapping as a single [RemoteInfo] rather
    /// than a dictionary of them
    pub const MARKER: &'static str = "sys_name";

    /// construct a [RemoteInfo] from a mapping of keyword arguments
    pub fn from_kwargs(
        kwargs: serde_yaml::Value,
    ) -> Result<Self, RemoteInfoError> {
        serde_yaml::from_value(kwargs).map_err(RemoteInfoError::Kwargs)
    }
}
