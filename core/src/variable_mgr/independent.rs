use super::{check_replica_count, non_finite_flag, replica_device, GradientState, VariableMgr};
use crate::cluster::ClusterContext;
use crate::distributed::DeviceGradients;
use crate::error::Result;
use crate::graph::{replica_scope_name, BaseGetter, FixedPlacer, Graph, VariableScope};
use crate::tensor::DeviceSpec;
use tracing::warn;

/// Every replica trains its own copy of the model. Gradients are never combined.
pub struct IndependentMgr {
    ctx: ClusterContext,
    check_inf_nan: bool,
}

impl IndependentMgr {
    pub fn new(ctx: ClusterContext, check_inf_nan: bool) -> Self {
        Self { ctx, check_inf_nan }
    }
}

impl VariableMgr for IndependentMgr {
    fn name(&self) -> &'static str {
        "independent"
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
        // Only replica 0 is checked; the other replicas may still diverge.
        let has_inf_nan = if self.check_inf_nan && !device_grads.is_empty() {
            if device_grads.len() > 1 {
                warn!(
                    replicas = device_grads.len(),
                    "independent mode only checks replica 0 for non-finite gradients"
                );
            }
            non_finite_flag(graph, &device_grads[..1], &self.ctx.raw_devices[0])?
        } else {
            None
        };
        let state = GradientState {
            per_device: device_grads.clone(),
            replica_grads: device_grads,
            has_inf_nan,
        };
        Ok((self.ctx.raw_devices.clone(), state))
    }
}
