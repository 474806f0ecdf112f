use super::{
    average_over_replicas, broadcast_to_replicas, check_replica_count, non_finite_flag, replica_device,
    replicated_post_init_sync_ops, replicated_savable_variables, GradientState, VariableMgr,
};
use crate::cluster::ClusterContext;
use crate::config::VariableMgrConfig;
use crate::distributed::aggregation::{
    aggregate_gradients_using_copy_with_device_selection, aggregate_gradients_using_hierarchical_copy,
};
use crate::distributed::allreduce::{
    build_all_reduce_device_prefixes, parse_all_reduce_spec, sum_gradients_all_reduce, AllReduceSpecTuple,
};
use crate::distributed::repack::aggregate_gradients_with_repacking;
use crate::distributed::DeviceGradients;
use crate::error::{Error, Result};
use crate::graph::{replica_scope_name, BaseGetter, FixedPlacer, Graph, NodeId, VarId, VariableScope};
use crate::tensor::DeviceSpec;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Every local replica keeps its own copy; the summed gradients are applied on every replica,
/// so the copies stay identical.
pub struct LocalReplicatedMgr {
    ctx: ClusterContext,
    all_reduce_spec: Option<AllReduceSpecTuple>,
    agg_small_grads_max_bytes: usize,
    agg_small_grads_max_group: usize,
    hierarchical_copy: bool,
    gradient_repacking: usize,
    check_inf_nan: bool,
    use_mean: bool,
}

impl LocalReplicatedMgr {
    pub fn new(config: &VariableMgrConfig, ctx: ClusterContext) -> Result<Self> {
        let all_reduce_spec = match config.all_reduce_spec() {
            Some(spec) => {
                let mut ranges = parse_all_reduce_spec(spec)?;
                if ranges.len() != 1 {
                    return Err(Error::Config(
                        "replicated mode does not support hybrid all-reduce strategies".into(),
                    ));
                }
                ranges.pop()
            }
            None => None,
        };
        if config.gradient_repacking > 0 && !config.hierarchical_copy {
            warn!(
                gradient_repacking = config.gradient_repacking,
                "gradient_repacking only applies with hierarchical_copy, ignoring it"
            );
        }
        Ok(Self {
            ctx,
            all_reduce_spec,
            agg_small_grads_max_bytes: config.agg_small_grads_max_bytes,
            agg_small_grads_max_group: config.agg_small_grads_max_group,
            hierarchical_copy: config.hierarchical_copy,
            gradient_repacking: config.gradient_repacking,
            check_inf_nan: config.enable_auto_loss_scale,
            use_mean: config.use_mean(),
        })
    }
}

impl VariableMgr for LocalReplicatedMgr {
    fn name(&self) -> &'static str {
        "replicated"
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
        let devices = &self.ctx.raw_devices;
        let (per_device, has_inf_nan) = if let Some(spec) = &self.all_reduce_spec {
            debug!(alg = %spec.alg, shards = spec.shards, "replicated all-reduce");
            let dev_prefixes = build_all_reduce_device_prefixes("localhost", 1)?;
            let flag = if self.check_inf_nan {
                non_finite_flag(graph, &device_grads, &devices[0])?
            } else {
                None
            };
            let reduced = sum_gradients_all_reduce(
                graph,
                &dev_prefixes,
                &device_grads,
                1,
                spec.alg,
                spec.shards,
                &self.ctx.gpu_indices,
                self.agg_small_grads_max_bytes,
                self.agg_small_grads_max_group,
            )?;
            let reduced = if self.use_mean {
                average_over_replicas(graph, reduced)?
            } else {
                reduced
            };
            (reduced, flag)
        } else if !self.hierarchical_copy {
            let aggregated = aggregate_gradients_using_copy_with_device_selection(
                graph,
                devices,
                &device_grads,
                self.use_mean,
                self.check_inf_nan,
            )?;
            (broadcast_to_replicas(&device_grads, &aggregated.grads), aggregated.has_inf_nan)
        } else if self.gradient_repacking == 0 {
            let aggregated =
                aggregate_gradients_using_hierarchical_copy(graph, devices, &device_grads, self.use_mean, self.check_inf_nan)?;
            (aggregated.device_grads, aggregated.has_inf_nan)
        } else {
            let aggregated = aggregate_gradients_with_repacking(
                graph,
                devices,
                &device_grads,
                self.gradient_repacking,
                self.use_mean,
                self.check_inf_nan,
            )?;
            (aggregated.device_grads, aggregated.has_inf_nan)
        };
        let state = GradientState {
            per_device,
            replica_grads: device_grads,
            has_inf_nan,
        };
        Ok((self.ctx.raw_devices.clone(), state))
    }

    fn post_init_sync_ops(&self, graph: &mut Graph) -> Result<Vec<NodeId>> {
        replicated_post_init_sync_ops(graph)
    }

    fn savable_variables(&self, graph: &Graph) -> Result<BTreeMap<String, VarId>> {
        Ok(replicated_savable_variables(graph))
    }
}
