//! Distributed replicated mode.
//!
//! Every replica keeps a local copy. The averaged gradients of a worker are applied to a shadow
//! copy (`ps_var/replica-0/<name>`) on the parameter servers; once every worker has applied its
//! update to a shadow variable, each replica copies the new value back.

use super::{check_replica_count, replica_device, GradientState, VariableMgr};
use crate::cluster::ClusterContext;
use crate::distributed::aggregation::aggregate_gradients_using_copy_with_device_selection;
use crate::distributed::placement::{
    LocalVariableOverride, ReplicaDeviceSetter, RoundRobinStrategy, PS_SHADOW_VAR_PREFIX,
};
use crate::distributed::sync::SyncQueues;
use crate::distributed::{DeviceGradients, GradientEntry};
use crate::error::{Error, Result};
use crate::graph::{
    replica_scope_name, BaseGetter, Collection, FixedPlacer, Graph, NodeId, VarId, VariableDef,
    VariablePlacer, VariableRequest, VariableScope,
};
use crate::loss_scale::{append_gradients_with_loss_scale, LossScaleParams};
use crate::optim::Optimizer;
use crate::tensor::DeviceSpec;
use std::collections::BTreeMap;
use tracing::debug;

/// Global variables other than shadow copies that may appear in a checkpoint.
const SAVABLE_GLOBALS: [&str; 3] = ["global_step", "loss_scale", "loss_scale_normal_steps"];

pub struct DistributedReplicatedMgr {
    ctx: ClusterContext,
    sync: SyncQueues,
    shadow_placer: ReplicaDeviceSetter,
    check_inf_nan: bool,
    use_mean: bool,
}

impl DistributedReplicatedMgr {
    pub fn new(ctx: ClusterContext, check_inf_nan: bool) -> Result<Self> {
        if ctx.ps_devices.is_empty() {
            return Err(Error::Config("distributed_replicated needs at least one ps task".into()));
        }
        let sync = SyncQueues::new(ctx.sync_queue_devices.clone(), ctx.num_workers, ctx.task_index)?;
        let shadow_placer = ReplicaDeviceSetter::for_cluster(
            ctx.cpu_device.clone(),
            Box::new(RoundRobinStrategy::new(ctx.ps_devices.len())),
        );
        Ok(Self {
            ctx,
            sync,
            shadow_placer,
            check_inf_nan,
            use_mean: true,
        })
    }

    pub fn with_use_mean(mut self, use_mean: bool) -> Self {
        self.use_mean = use_mean;
        self
    }

    fn shadow_prefix() -> String {
        format!("{PS_SHADOW_VAR_PREFIX}/{}/", replica_scope_name(0))
    }

    /// Creates the shadow copy of `var` on a parameter server.
    fn create_shadow(&mut self, graph: &mut Graph, var: VarId) -> Result<VarId> {
        let (name, initial_value) = {
            let v = graph.variable(var)?;
            (format!("{PS_SHADOW_VAR_PREFIX}/{}", v.name), v.initial_value.clone())
        };
        let request = VariableRequest::new(name.clone(), initial_value.clone());
        let device = self.shadow_placer.place(graph, &name, &request);
        debug!(name = %name, device = %device, "shadow variable");
        graph.create_variable(VariableDef {
            name,
            device,
            initial_value,
            trainable: true,
            collection: Collection::Global,
            caching_device: None,
        })
    }
}

impl VariableMgr for DistributedReplicatedMgr {
    fn name(&self) -> &'static str {
        "distributed_replicated"
    }

    fn owns_replica_local_variables(&self) -> bool {
        true
    }

    fn devices(&self) -> &[DeviceSpec] {
        &self.ctx.raw_devices
    }

    fn open_variable_scope(&mut self, replica: usize) -> Result<VariableScope<'_>> {
        let device = replica_device(&self.ctx.raw_devices, replica)?;
        let getter = BaseGetter::new(
            Some(replica_scope_name(replica)),
            false,
            Box::new(FixedPlacer(device.clone())),
        );
        Ok(VariableScope::new(replica, device, getter).with_interceptor(Box::new(LocalVariableOverride)))
    }

    fn preprocess(
        &mut self,
        graph: &mut Graph,
        device_grads: DeviceGradients,
    ) -> Result<(Vec<DeviceSpec>, GradientState)> {
        check_replica_count(&device_grads, &self.ctx.raw_devices)?;
        let aggregated = aggregate_gradients_using_copy_with_device_selection(
            graph,
            &self.ctx.raw_devices,
            &device_grads,
            self.use_mean,
            self.check_inf_nan,
        )?;
        let mut shadow_grads = Vec::with_capacity(aggregated.grads.len());
        for (i, entry) in aggregated.grads.iter().enumerate() {
            let var = entry
                .var
                .ok_or_else(|| Error::Config(format!("gradient {i} has no variable to shadow")))?;
            let shadow = self.create_shadow(graph, var)?;
            shadow_grads.push(GradientEntry::new(entry.grad, shadow));
        }
        let state = GradientState {
            per_device: vec![shadow_grads],
            replica_grads: device_grads,
            has_inf_nan: aggregated.has_inf_nan,
        };
        Ok((vec![self.ctx.param_server_device.clone()], state))
    }

    /// Per variable: apply to the shadow, wait for every worker at a barrier, then copy the
    /// shadow into every replica's variable.
    fn build_apply_ops(
        &mut self,
        graph: &mut Graph,
        state: &GradientState,
        _device_num: usize,
        grads: &[GradientEntry],
        optimizer: &dyn Optimizer,
        loss_scale: &LossScaleParams<'_>,
    ) -> Result<Vec<NodeId>> {
        let mut apply_ops = Vec::new();
        for (i, entry) in grads.iter().enumerate() {
            let shadow = entry
                .var
                .ok_or_else(|| Error::Config(format!("gradient {i} has no shadow variable")))?;
            let apply = optimizer.apply_gradients(graph, &[*entry])?;
            let barrier = self
                .sync
                .add_sync_queues_and_barrier(graph, &format!("replicate_variable_{i}"), &apply)?;
            let updated = graph.read_variable(shadow, &self.ctx.cpu_device)?;
            graph.add_control_inputs(updated, &[barrier])?;
            for (d, row) in state.replica_grads.iter().enumerate() {
                let local = row.get(i).and_then(|e| e.var).ok_or_else(|| {
                    Error::Config(format!("replica {d} has no variable for gradient {i}"))
                })?;
                apply_ops.push(graph.assign(local, updated)?);
            }
        }
        let mut training_ops = Vec::with_capacity(apply_ops.len());
        append_gradients_with_loss_scale(graph, &mut training_ops, apply_ops, state.has_inf_nan, loss_scale)?;
        Ok(training_ops)
    }

    fn post_init_sync_ops(&self, graph: &mut Graph) -> Result<Vec<NodeId>> {
        let shadow_root = format!("{PS_SHADOW_VAR_PREFIX}/{}", replica_scope_name(0));
        let mut pairs = Vec::new();
        for v in graph.global_variables() {
            let Some(rest) = v.name.strip_prefix(&shadow_root).filter(|r| r.starts_with('/')) else {
                continue;
            };
            for i in 0..self.ctx.raw_devices.len() {
                let name = format!("{}{rest}", replica_scope_name(i));
                let local = graph
                    .local_variables()
                    .find(|l| l.name == name)
                    .map(|l| l.id);
                if let Some(local) = local {
                    pairs.push((local, v.id));
                }
            }
        }
        let mut ops = Vec::with_capacity(pairs.len());
        for (local, shadow) in pairs {
            let value = graph.read_variable(shadow, &self.ctx.cpu_device)?;
            ops.push(graph.assign(local, value)?);
        }
        Ok(ops)
    }

    /// Shadow copies under their replica-0 names (so replicated mode can restore them), the
    /// known global counters, and replica 0's non-trainable local state.
    fn savable_variables(&self, graph: &Graph) -> Result<BTreeMap<String, VarId>> {
        let shadow_prefix = Self::shadow_prefix();
        let strip = format!("{PS_SHADOW_VAR_PREFIX}/");
        let mut params = BTreeMap::new();
        for v in graph.global_variables() {
            if v.name.starts_with(&shadow_prefix) {
                let name = v.name.strip_prefix(&strip).unwrap_or(&v.name);
                params.insert(name.to_string(), v.id);
            } else if SAVABLE_GLOBALS.contains(&v.name.as_str()) {
                params.insert(v.name.clone(), v.id);
            } else {
                return Err(Error::CheckpointMismatch(v.name.clone()));
            }
        }
        let local_prefix = format!("{}/", replica_scope_name(0));
        for v in graph.local_variables() {
            if v.name.starts_with(&local_prefix) && !v.trainable {
                params.insert(v.name.clone(), v.id);
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VariableMgrConfig, VariableUpdate};
    use crate::tensor::Tensor;

    fn mgr() -> DistributedReplicatedMgr {
        let config = VariableMgrConfig {
            variable_update: VariableUpdate::DistributedReplicated,
            job_name: Some("worker".into()),
            num_workers: 2,
            num_ps: 2,
            num_gpus: 2,
            ..VariableMgrConfig::default()
        };
        DistributedReplicatedMgr::new(ClusterContext::from_config(&config).unwrap(), false).unwrap()
    }

    #[test]
    fn test_replica_variables_are_local() {
        let mut mgr = mgr();
        let mut g = Graph::new();
        let mut scope = mgr.open_variable_scope(1).unwrap();
        let h = scope
            .get_variable(&mut g, VariableRequest::new("w", Tensor::zeros([2])))
            .unwrap();
        let v = g.variable(h.var).unwrap();
        assert_eq!(v.name, "replica-1/w");
        assert_eq!(v.collection, Collection::Local);
    }

    #[test]
    fn test_savable_rejects_unknown_globals() {
        let mgr = mgr();
        let mut g = Graph::new();
        g.create_variable(VariableDef {
            name: "stray".into(),
            device: DeviceSpec::cpu(0),
            initial_value: Tensor::zeros([1]),
            trainable: true,
            collection: Collection::Global,
            caching_device: None,
        })
        .unwrap();
        assert!(matches!(mgr.savable_variables(&g), Err(Error::CheckpointMismatch(name)) if name == "stray"));
    }
}
