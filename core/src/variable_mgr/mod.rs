//! # Variable managers
//!
//! A variable manager is the placement strategy of one training job. It owns the answers to
//! four questions:
//!
//! 1. Does every replica own its parameters, or do replicas share one copy?
//! 2. Which devices apply the combined gradients?
//! 3. How do freshly initialized values reach every replica?
//! 4. Which variables go into a checkpoint?
//!
//! ## Usage
//!
//! ```text
//! for replica in 0..N:
//!     scope = mgr.open_variable_scope(replica)   // build replica's model in scope
//! (apply_devices, state) = mgr.preprocess(graph, device_grads)
//! for d in 0..apply_devices.len():
//!     grads = mgr.gradients_for(&state, d)
//!     training_ops += mgr.build_apply_ops(graph, &state, d, &grads, optimizer, loss_scale)
//! once after init: run mgr.post_init_sync_ops(graph)
//! ```
//!
//! ## Modes
//!
//! | Mode                              | Storage                     | Apply devices | After init           |
//! |-----------------------------------|-----------------------------|---------------|----------------------|
//! | [`IndependentMgr`]                | per replica                 | every replica | nothing              |
//! | [`FetchFromPsMgr`] (local)        | one shared copy             | one           | nothing              |
//! | [`FetchFromPsMgr`] (distributed)  | shared on the PS tasks      | one           | nothing              |
//! | [`LocalReplicatedMgr`]            | per replica                 | every replica | replica 0 to others  |
//! | [`DistributedAllReduceMgr`]       | per replica, all workers    | every replica | replica 0 to others  |
//! | [`DistributedReplicatedMgr`]      | per replica + PS shadow     | one           | shadow to replicas   |
//!
//! Both fetch-from-PS modes optionally serve reads from a [`StagingCache`].

use crate::cluster::ClusterContext;
use crate::config::{VariableMgrConfig, VariableUpdate};
use crate::distributed::staging::StagingCache;
use crate::distributed::{DeviceGradients, GradientEntry};
use crate::error::{Error, Result};
use crate::graph::{replica_scope_name, Graph, NodeId, ParamRef, VarId, VariableScope};
use crate::loss_scale::{append_gradients_with_loss_scale, LossScaleParams};
use crate::optim::Optimizer;
use crate::tensor::DeviceSpec;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub mod all_reduce;
pub mod distributed_replicated;
pub mod independent;
pub mod parameter_server;
pub mod replicated;

pub use all_reduce::DistributedAllReduceMgr;
pub use distributed_replicated::DistributedReplicatedMgr;
pub use independent::IndependentMgr;
pub use parameter_server::{FetchFromPsMgr, PsMode};
pub use replicated::LocalReplicatedMgr;

/// What [`VariableMgr::preprocess`] hands on to the per-device steps.
#[derive(Clone, Debug)]
pub struct GradientState {
    /// Gradients to apply, one row per apply device.
    pub(crate) per_device: Vec<Vec<GradientEntry>>,
    /// The matrix `preprocess` was given.
    pub(crate) replica_grads: DeviceGradients,
    /// True iff some aggregated gradient is non-finite; present when detection is enabled.
    pub(crate) has_inf_nan: Option<NodeId>,
}

impl GradientState {
    pub fn has_inf_nan(&self) -> Option<NodeId> {
        self.has_inf_nan
    }

    pub fn num_devices(&self) -> usize {
        self.per_device.len()
    }

    pub fn replica_grads(&self) -> &DeviceGradients {
        &self.replica_grads
    }

    pub(crate) fn row(&self, device_num: usize) -> Result<&[GradientEntry]> {
        self.per_device
            .get(device_num)
            .map(Vec::as_slice)
            .ok_or(Error::DeviceIndexOutOfRange {
                index: device_num,
                len: self.per_device.len(),
            })
    }
}

/// A variable placement and gradient aggregation strategy.
pub trait VariableMgr {
    /// Mode name for logs.
    fn name(&self) -> &'static str;

    /// True if every replica has its own copy of the parameters.
    fn owns_replica_local_variables(&self) -> bool;

    fn supports_staged_vars(&self) -> bool {
        false
    }

    /// Replica devices, in replica order.
    fn devices(&self) -> &[DeviceSpec];

    /// The scope replica `replica` builds its model in. Scopes must be opened in replica order.
    fn open_variable_scope(&mut self, replica: usize) -> Result<VariableScope<'_>>;

    /// Combines per-replica gradients. Returns the devices that apply updates and the state
    /// [`gradients_for`](Self::gradients_for) reads.
    fn preprocess(
        &mut self,
        graph: &mut Graph,
        device_grads: DeviceGradients,
    ) -> Result<(Vec<DeviceSpec>, GradientState)>;

    /// Gradients apply device `device_num` applies.
    fn gradients_for(&self, state: &GradientState, device_num: usize) -> Result<Vec<GradientEntry>> {
        Ok(state.row(device_num)?.to_vec())
    }

    /// Update ops for apply device `device_num`, routed through loss scaling.
    fn build_apply_ops(
        &mut self,
        graph: &mut Graph,
        state: &GradientState,
        _device_num: usize,
        grads: &[GradientEntry],
        optimizer: &dyn Optimizer,
        loss_scale: &LossScaleParams<'_>,
    ) -> Result<Vec<NodeId>> {
        let apply_ops = optimizer.apply_gradients(graph, grads)?;
        let mut training_ops = Vec::with_capacity(apply_ops.len());
        append_gradients_with_loss_scale(graph, &mut training_ops, apply_ops, state.has_inf_nan, loss_scale)?;
        Ok(training_ops)
    }

    /// Ops to run once after variable initialization.
    fn post_init_sync_ops(&self, _graph: &mut Graph) -> Result<Vec<NodeId>> {
        Ok(Vec::new())
    }

    /// Variables a checkpoint stores, keyed by checkpoint name.
    fn savable_variables(&self, graph: &Graph) -> Result<BTreeMap<String, VarId>> {
        Ok(graph
            .global_variables()
            .map(|v| (v.name.clone(), v.id))
            .collect())
    }

    /// Trainable parameters as replica `rel_device_num` sees them.
    fn trainable_variables_on_device(
        &self,
        graph: &Graph,
        rel_device_num: usize,
        _abs_device_num: usize,
        _writable: bool,
    ) -> Result<Vec<ParamRef>> {
        if !self.owns_replica_local_variables() {
            return Ok(graph
                .trainable_variables()
                .map(|v| ParamRef::Variable(v.id))
                .collect());
        }
        let prefix = format!("{}/", replica_scope_name(rel_device_num));
        Ok(graph
            .trainable_variables()
            .filter(|v| v.name.starts_with(&prefix))
            .map(|v| ParamRef::Variable(v.id))
            .collect())
    }

    /// Staging put ops that must run every step.
    fn staging_put_ops(&self) -> Vec<NodeId> {
        Vec::new()
    }

    fn staging_cache(&self) -> Option<&StagingCache> {
        None
    }
}

/// Builds the variable manager `config` asks for.
pub fn create_variable_mgr(config: &VariableMgrConfig, ctx: &ClusterContext) -> Result<Box<dyn VariableMgr>> {
    config.validate()?;
    let check_inf_nan = config.enable_auto_loss_scale;
    let mgr: Box<dyn VariableMgr> = match config.variable_update {
        VariableUpdate::Independent => Box::new(IndependentMgr::new(ctx.clone(), check_inf_nan)),
        VariableUpdate::ParameterServer => {
            let mode = if config.is_distributed() {
                PsMode::Distributed
            } else {
                PsMode::Local
            };
            Box::new(
                FetchFromPsMgr::new(ctx.clone(), mode, config.staged_vars, check_inf_nan)
                    .with_use_mean(config.use_mean()),
            )
        }
        VariableUpdate::Replicated => Box::new(LocalReplicatedMgr::new(config, ctx.clone())?),
        VariableUpdate::DistributedAllReduce => {
            Box::new(DistributedAllReduceMgr::new(config, ctx.clone())?)
        }
        VariableUpdate::DistributedReplicated => {
            Box::new(DistributedReplicatedMgr::new(ctx.clone(), check_inf_nan)?.with_use_mean(config.use_mean()))
        }
    };
    info!(
        mode = mgr.name(),
        devices = mgr.devices().len(),
        "created variable manager"
    );
    Ok(mgr)
}

pub(crate) fn replica_device(devices: &[DeviceSpec], replica: usize) -> Result<DeviceSpec> {
    devices.get(replica).cloned().ok_or(Error::DeviceIndexOutOfRange {
        index: replica,
        len: devices.len(),
    })
}

pub(crate) fn check_replica_count(device_grads: &[Vec<GradientEntry>], devices: &[DeviceSpec]) -> Result<()> {
    if device_grads.len() != devices.len() {
        return Err(Error::Config(format!(
            "got gradients for {} replicas, but there are {} devices",
            device_grads.len(),
            devices.len()
        )));
    }
    Ok(())
}

/// True iff any gradient of any replica is non-finite.
pub(crate) fn non_finite_flag(
    graph: &mut Graph,
    device_grads: &[Vec<GradientEntry>],
    device: &DeviceSpec,
) -> Result<Option<NodeId>> {
    let grads: Vec<NodeId> = device_grads.iter().flatten().map(|e| e.grad).collect();
    if grads.is_empty() {
        return Ok(None);
    }
    Ok(Some(graph.any_non_finite(&grads, device)?))
}

/// Pairs each replica's own variables with the shared aggregated gradients.
pub(crate) fn broadcast_to_replicas(
    device_grads: &[Vec<GradientEntry>],
    aggregated: &[GradientEntry],
) -> Vec<Vec<GradientEntry>> {
    device_grads
        .iter()
        .map(|row| {
            row.iter()
                .zip(aggregated)
                .map(|(own, agg)| GradientEntry {
                    grad: agg.grad,
                    var: own.var,
                })
                .collect()
        })
        .collect()
}

/// Divides every reduced gradient by the number of replicas, on the gradient's device.
pub(crate) fn average_over_replicas(
    graph: &mut Graph,
    per_device: Vec<Vec<GradientEntry>>,
) -> Result<Vec<Vec<GradientEntry>>> {
    let n = per_device.len();
    if n <= 1 {
        return Ok(per_device);
    }
    let factor = 1.0 / n as f32;
    per_device
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|e| {
                    let device = graph.device(e.grad)?.clone();
                    Ok(GradientEntry {
                        grad: graph.scale(e.grad, factor, &device)?,
                        var: e.var,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}

/// Splits `replica-<n>/<rest>` into `(n, rest)`.
pub(crate) fn split_replica_name(name: &str) -> Option<(usize, &str)> {
    let (scope, rest) = name.split_once('/')?;
    let n = scope.strip_prefix("replica-")?.parse().ok()?;
    Some((n, rest))
}

/// Assigns every global `replica-<n>/<rest>` variable (`n > 0`) from `replica-0/<rest>`.
pub(crate) fn replicated_post_init_sync_ops(graph: &mut Graph) -> Result<Vec<NodeId>> {
    let mut pairs = Vec::new();
    for v in graph.global_variables() {
        let Some((n, rest)) = split_replica_name(&v.name) else {
            continue;
        };
        if n == 0 {
            continue;
        }
        let source_name = format!("{}/{rest}", replica_scope_name(0));
        let source = graph
            .variable_by_name(&source_name)
            .ok_or(Error::UnknownVariable(source_name))?;
        pairs.push((v.id, source));
    }
    let mut ops = Vec::with_capacity(pairs.len());
    for (target, source) in pairs {
        let device = graph.variable(source)?.device.clone();
        let value = graph.read_variable(source, &device)?;
        ops.push(graph.assign(target, value)?);
    }
    debug!(ops = ops.len(), "replica-0 broadcast after init");
    Ok(ops)
}

/// Replica 0's copies plus every global variable outside the replica scopes.
pub(crate) fn replicated_savable_variables(graph: &Graph) -> BTreeMap<String, VarId> {
    graph
        .global_variables()
        .filter(|v| !matches!(split_replica_name(&v.name), Some((n, _)) if n != 0))
        .map(|v| (v.name.clone(), v.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_replica_name() {
        assert_eq!(split_replica_name("replica-3/conv/w"), Some((3, "conv/w")));
        assert_eq!(split_replica_name("replica-x/w"), None);
        assert_eq!(split_replica_name("global_step"), None);
        assert_eq!(split_replica_name("ps_var/replica-0/w"), None);
    }

    #[test]
    fn test_gradient_state_row_out_of_range() {
        let state = GradientState {
            per_device: vec![vec![]],
            replica_grads: vec![vec![]],
            has_inf_nan: None,
        };
        assert!(state.row(0).is_ok());
        let err = state.row(2).unwrap_err();
        assert_eq!(err.to_string(), "device_num 2 exceeds length of device_grads (1)");
    }
}
