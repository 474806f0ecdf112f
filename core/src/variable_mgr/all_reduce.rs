use super::{
    average_over_replicas, check_replica_count, non_finite_flag, replica_device, replicated_post_init_sync_ops,
    replicated_savable_variables, GradientState, VariableMgr,
};
use crate::cluster::ClusterContext;
use crate::config::VariableMgrConfig;
use crate::distributed::allreduce::{
    build_all_reduce_device_prefixes, parse_all_reduce_spec, reduce_by_spec, AllReduceContext,
    AllReduceSpecTuple,
};
use crate::distributed::DeviceGradients;
use crate::error::{Error, Result};
use crate::graph::{replica_scope_name, BaseGetter, FixedPlacer, Graph, NodeId, VarId, VariableScope};
use crate::tensor::DeviceSpec;
use std::collections::BTreeMap;

/// One graph spanning every worker; each replica keeps a copy and the all-reduce spec reduces
/// the gradients across all of them.
///
/// Replica numbers run over the whole cluster, worker-major.
pub struct DistributedAllReduceMgr {
    ctx: ClusterContext,
    spec: Vec<AllReduceSpecTuple>,
    agg_small_grads_max_bytes: usize,
    agg_small_grads_max_group: usize,
    check_inf_nan: bool,
    use_mean: bool,
}

impl DistributedAllReduceMgr {
    pub fn new(config: &VariableMgrConfig, ctx: ClusterContext) -> Result<Self> {
        let spec = config
            .all_reduce_spec()
            .ok_or_else(|| Error::Config("distributed_all_reduce requires a non-empty all_reduce_spec".into()))?;
        Ok(Self {
            ctx,
            spec: parse_all_reduce_spec(spec)?,
            agg_small_grads_max_bytes: config.agg_small_grads_max_bytes,
            agg_small_grads_max_group: config.agg_small_grads_max_group,
            check_inf_nan: config.enable_auto_loss_scale,
            use_mean: config.use_mean(),
        })
    }
}

impl VariableMgr for DistributedAllReduceMgr {
    fn name(&self) -> &'static str {
        "distributed_all_reduce"
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
        Ok(VariableScope::new(replica, device, getter))
    }

    fn preprocess(
        &mut self,
        graph: &mut Graph,
        device_grads: DeviceGradients,
    ) -> Result<(Vec<DeviceSpec>, GradientState)> {
        check_replica_count(&device_grads, &self.ctx.raw_devices)?;
        let has_inf_nan = if self.check_inf_nan {
            non_finite_flag(graph, &device_grads, &self.ctx.cpu_device)?
        } else {
            None
        };
        let dev_prefixes = build_all_reduce_device_prefixes(&self.ctx.job_name, self.ctx.num_workers)?;
        let ctx = AllReduceContext {
            dev_prefixes: &dev_prefixes,
            num_workers: self.ctx.num_workers,
            gpu_indices: &self.ctx.gpu_indices,
            agg_small_grads_max_bytes: self.agg_small_grads_max_bytes,
            agg_small_grads_max_group: self.agg_small_grads_max_group,
        };
        let mut per_device = reduce_by_spec(graph, &self.spec, &ctx, &device_grads)?;
        if self.use_mean {
            per_device = average_over_replicas(graph, per_device)?;
        }

        let apply_devices = per_device
            .iter()
            .enumerate()
            .map(|(r, row)| match row.first() {
                Some(entry) => Ok(graph.device(entry.grad)?.clone()),
                None => replica_device(&self.ctx.raw_devices, r),
            })
            .collect::<Result<Vec<_>>>()?;
        let state = GradientState {
            per_device,
            replica_grads: device_grads,
            has_inf_nan,
        };
        Ok((apply_devices, state))
    }

    fn post_init_sync_ops(&self, graph: &mut Graph) -> Result<Vec<NodeId>> {
        replicated_post_init_sync_ops(graph)
    }

    fn savable_variables(&self, graph: &Graph) -> Result<BTreeMap<String, VarId>> {
        Ok(replicated_savable_variables(graph))
    }
}
