//! Variable-manager configuration.
//!
//! The settings a training harness passes when it picks a replication mode. Everything is
//! `serde`-(de)serializable with defaults for missing fields, so a config can come from a JSON
//! file or be built in code:
//!
//! ```rust
//! use varmgr_rs::config::{VariableMgrConfig, VariableUpdate};
//!
//! let config = VariableMgrConfig {
//!     variable_update: VariableUpdate::Replicated,
//!     num_gpus: 4,
//!     all_reduce_spec: Some("nccl".into()),
//!     ..VariableMgrConfig::default()
//! };
//! config.validate().unwrap();
//! ```

use crate::distributed::allreduce::parse_all_reduce_spec;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replication mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableUpdate {
    /// Every replica trains its own copy; gradients are never combined.
    Independent,
    /// One shared copy on the parameter device(s); replicas fetch it every step.
    #[serde(alias = "ps")]
    ParameterServer,
    /// A copy per local replica, kept identical by summing gradients on every replica.
    #[default]
    Replicated,
    /// A copy per replica across all workers, reduced with an all-reduce spec.
    DistributedAllReduce,
    /// A copy per replica plus a shadow copy on the parameter servers.
    DistributedReplicated,
}

impl VariableUpdate {
    /// Parameter-server and distributed replicated modes apply one averaged update to a shared
    /// copy; the replicated modes sum.
    pub fn averages_by_default(&self) -> bool {
        matches!(self, VariableUpdate::ParameterServer | VariableUpdate::DistributedReplicated)
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariableUpdate::Independent => "independent",
            VariableUpdate::ParameterServer => "parameter_server",
            VariableUpdate::Replicated => "replicated",
            VariableUpdate::DistributedAllReduce => "distributed_all_reduce",
            VariableUpdate::DistributedReplicated => "distributed_replicated",
        }
    }
}

impl fmt::Display for VariableUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VariableUpdate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "independent" => Ok(VariableUpdate::Independent),
            "parameter_server" | "ps" => Ok(VariableUpdate::ParameterServer),
            "replicated" => Ok(VariableUpdate::Replicated),
            "distributed_all_reduce" => Ok(VariableUpdate::DistributedAllReduce),
            "distributed_replicated" => Ok(VariableUpdate::DistributedReplicated),
            _ => Err(Error::Config(format!("unknown variable_update: {s}"))),
        }
    }
}

/// Where parameters live in the local parameter-server mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalParameterDevice {
    #[default]
    Cpu,
    Gpu,
}

impl FromStr for LocalParameterDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(LocalParameterDevice::Cpu),
            "gpu" => Ok(LocalParameterDevice::Gpu),
            _ => Err(Error::Config(format!("unknown local_parameter_device: {s}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableMgrConfig {
    pub variable_update: VariableUpdate,
    /// Serve parameter reads from per-step staging buffers (parameter-server mode only).
    pub staged_vars: bool,
    /// `alg[#shards]:limit:...`, see [`crate::distributed::allreduce`].
    pub all_reduce_spec: Option<String>,
    /// Runs of small gradients are packed into tensors of at most this many bytes before
    /// all-reduce. 0 disables packing.
    pub agg_small_grads_max_bytes: usize,
    /// Maximum number of gradients in one pack.
    pub agg_small_grads_max_group: usize,
    pub hierarchical_copy: bool,
    /// Number of chunks gradients are repacked into before hierarchical copy. 0 disables it.
    pub gradient_repacking: usize,
    /// Name of this process's job; `None` runs everything in one local process.
    pub job_name: Option<String>,
    pub num_workers: usize,
    pub num_ps: usize,
    pub task_index: usize,
    /// GPUs per worker.
    pub num_gpus: usize,
    pub local_parameter_device: LocalParameterDevice,
    /// Average instead of sum when aggregating. `None` keeps the mode's own choice, see
    /// [`VariableUpdate::averages_by_default`]. Independent mode never aggregates.
    pub use_mean: Option<bool>,
    /// Detect non-finite gradients and hand the flag to the loss-scale policy.
    pub enable_auto_loss_scale: bool,
}

impl Default for VariableMgrConfig {
    fn default() -> Self {
        Self {
            variable_update: VariableUpdate::default(),
            staged_vars: false,
            all_reduce_spec: None,
            agg_small_grads_max_bytes: 0,
            agg_small_grads_max_group: 10,
            hierarchical_copy: false,
            gradient_repacking: 0,
            job_name: None,
            num_workers: 1,
            num_ps: 0,
            task_index: 0,
            num_gpus: 1,
            local_parameter_device: LocalParameterDevice::default(),
            use_mean: None,
            enable_auto_loss_scale: false,
        }
    }
}

impl VariableMgrConfig {
    /// True when this process is one worker of a multi-process cluster.
    pub fn is_distributed(&self) -> bool {
        self.job_name.is_some()
    }

    pub fn is_chief(&self) -> bool {
        self.task_index == 0
    }

    /// Whether aggregated gradients are averaged over the replicas.
    pub fn use_mean(&self) -> bool {
        self.use_mean
            .unwrap_or_else(|| self.variable_update.averages_by_default())
    }

    /// The all-reduce spec, with an empty string treated as absent.
    pub fn all_reduce_spec(&self) -> Option<&str> {
        self.all_reduce_spec.as_deref().filter(|s| !s.is_empty())
    }

    /// Rejects combinations no variable manager can run.
    pub fn validate(&self) -> Result<()> {
        let update = self.variable_update;
        if self.num_gpus == 0 {
            return Err(Error::Config("num_gpus must be at least 1".into()));
        }
        if self.num_workers == 0 {
            return Err(Error::Config("num_workers must be at least 1".into()));
        }
        if self.task_index >= self.num_workers {
            return Err(Error::Config(format!(
                "task_index {} is out of range for {} workers",
                self.task_index, self.num_workers
            )));
        }
        if self.staged_vars && update != VariableUpdate::ParameterServer {
            return Err(Error::Config(format!(
                "staged_vars requires variable_update=parameter_server, got {update}"
            )));
        }
        match update {
            VariableUpdate::Independent | VariableUpdate::Replicated if self.is_distributed() => {
                return Err(Error::Config(format!(
                    "Invalid variable_update in distributed mode: {update}"
                )));
            }
            VariableUpdate::DistributedReplicated if !self.is_distributed() => {
                return Err(Error::Config(format!(
                    "Invalid variable_update in local mode: {update}"
                )));
            }
            VariableUpdate::DistributedAllReduce if self.all_reduce_spec().is_none() => {
                return Err(Error::Config(
                    "distributed_all_reduce requires a non-empty all_reduce_spec".into(),
                ));
            }
            _ => {}
        }
        let needs_ps = update == VariableUpdate::DistributedReplicated
            || (update == VariableUpdate::ParameterServer && self.is_distributed());
        if needs_ps && self.num_ps == 0 {
            return Err(Error::Config(format!("{update} in distributed mode needs num_ps > 0")));
        }
        if let Some(spec) = self.all_reduce_spec() {
            parse_all_reduce_spec(spec)?;
        }
        Ok(())
    }
}
