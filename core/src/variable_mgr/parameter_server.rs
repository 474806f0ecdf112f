//! Fetch-from-parameter-server modes.
//!
//! One shared copy of every variable lives on the parameter device (locally) or is spread over
//! the parameter-server tasks (distributed). Replicas read it every step, optionally through a
//! [`StagingCache`], and the averaged gradients are applied once.

use super::{check_replica_count, replica_device, GradientState, VariableMgr};
use crate::cluster::ClusterContext;
use crate::config::LocalParameterDevice;
use crate::distributed::aggregation::{
    aggregate_gradients_using_copy, aggregate_gradients_using_copy_with_variable_colocation,
    AggregationTarget,
};
use crate::distributed::placement::{
    byte_size_load_fn, CachingDeviceOverride, GreedyLoadBalancingStrategy, ParamServerDeviceSetter,
    ReplicaDeviceSetter, SMALL_VARIABLE_SIZE_THRESHOLD,
};
use crate::distributed::staging::{StagedVariableInterceptor, StagingCache};
use crate::distributed::DeviceGradients;
use crate::error::Result;
use crate::graph::{BaseGetter, Graph, NodeId, ParamRef, VariablePlacer, VariableScope};
use crate::tensor::DeviceSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsMode {
    /// Variables on the local parameter device.
    Local,
    /// Variables on the `ps` job, balanced by byte size.
    Distributed,
}

pub struct FetchFromPsMgr {
    ctx: ClusterContext,
    mode: PsMode,
    staging: Option<StagingCache>,
    check_inf_nan: bool,
    use_mean: bool,
}

impl FetchFromPsMgr {
    pub fn new(ctx: ClusterContext, mode: PsMode, staged_vars: bool, check_inf_nan: bool) -> Self {
        let staging = staged_vars.then(|| {
            let cpu_device = match mode {
                PsMode::Local => None,
                PsMode::Distributed => Some(ctx.cpu_device.clone()),
            };
            StagingCache::new(ctx.raw_devices.clone(), cpu_device)
        });
        Self {
            ctx,
            mode,
            staging,
            check_inf_nan,
            use_mean: true,
        }
    }

    /// Whether the replicas' gradients are averaged (the default) or summed.
    pub fn with_use_mean(mut self, use_mean: bool) -> Self {
        self.use_mean = use_mean;
        self
    }

    fn placer(&self, worker_device: DeviceSpec) -> Box<dyn VariablePlacer> {
        match self.mode {
            PsMode::Local => match self.ctx.local_parameter_device {
                LocalParameterDevice::Gpu => Box::new(ParamServerDeviceSetter::new(
                    worker_device,
                    self.ctx.raw_devices.clone(),
                )),
                LocalParameterDevice::Cpu => Box::new(ReplicaDeviceSetter::single(
                    worker_device,
                    self.ctx.param_server_device.clone(),
                )),
            },
            PsMode::Distributed => Box::new(ReplicaDeviceSetter::for_cluster(
                worker_device,
                Box::new(GreedyLoadBalancingStrategy::new(self.ctx.ps_devices.len(), byte_size_load_fn)),
            )),
        }
    }
}

impl VariableMgr for FetchFromPsMgr {
    fn name(&self) -> &'static str {
        match (self.mode, self.staging.is_some()) {
            (PsMode::Local, false) => "parameter_server",
            (PsMode::Local, true) => "staged_parameter_server",
            (PsMode::Distributed, false) => "distributed_parameter_server",
            (PsMode::Distributed, true) => "staged_distributed_parameter_server",
        }
    }

    fn owns_replica_local_variables(&self) -> bool {
        false
    }

    fn supports_staged_vars(&self) -> bool {
        true
    }

    fn devices(&self) -> &[DeviceSpec] {
        &self.ctx.raw_devices
    }

    fn open_variable_scope(&mut self, replica: usize) -> Result<VariableScope<'_>> {
        let device = replica_device(&self.ctx.raw_devices, replica)?;
        let getter = BaseGetter::new(None, replica > 0, self.placer(device.clone()));
        let scope = VariableScope::new(replica, device, getter);
        if let Some(cache) = self.staging.as_mut() {
            return Ok(scope.with_interceptor(Box::new(StagedVariableInterceptor::new(replica, cache))));
        }
        if self.mode == PsMode::Distributed {
            let caching_devices = match self.ctx.local_parameter_device {
                LocalParameterDevice::Gpu => self.ctx.raw_devices.clone(),
                LocalParameterDevice::Cpu => vec![self.ctx.cpu_device.clone()],
            };
            return Ok(scope.with_interceptor(Box::new(CachingDeviceOverride::new(
                caching_devices,
                self.ctx.cpu_device.clone(),
                SMALL_VARIABLE_SIZE_THRESHOLD,
            ))));
        }
        Ok(scope)
    }

    fn preprocess(
        &mut self,
        graph: &mut Graph,
        device_grads: DeviceGradients,
    ) -> Result<(Vec<DeviceSpec>, GradientState)> {
        check_replica_count(&device_grads, &self.ctx.raw_devices)?;
        let aggregated = match self.mode {
            PsMode::Local => aggregate_gradients_using_copy_with_variable_colocation(
                graph,
                &device_grads,
                self.use_mean,
                self.check_inf_nan,
            )?,
            PsMode::Distributed => aggregate_gradients_using_copy(
                graph,
                &device_grads,
                AggregationTarget::Fixed(&self.ctx.param_server_device),
                self.use_mean,
                self.check_inf_nan,
            )?,
        };
        let state = GradientState {
            per_device: vec![aggregated.grads],
            replica_grads: device_grads,
            has_inf_nan: aggregated.has_inf_nan,
        };
        Ok((vec![self.ctx.param_server_device.clone()], state))
    }

    fn trainable_variables_on_device(
        &self,
        graph: &Graph,
        rel_device_num: usize,
        _abs_device_num: usize,
        writable: bool,
    ) -> Result<Vec<ParamRef>> {
        match &self.staging {
            Some(cache) => cache.trainable_variables_on_device(graph, rel_device_num, writable),
            None => Ok(graph
                .trainable_variables()
                .map(|v| ParamRef::Variable(v.id))
                .collect()),
        }
    }

    fn staging_put_ops(&self) -> Vec<NodeId> {
        self.staging.as_ref().map(StagingCache::put_ops).unwrap_or_default()
    }

    fn staging_cache(&self) -> Option<&StagingCache> {
        self.staging.as_ref()
    }
}
