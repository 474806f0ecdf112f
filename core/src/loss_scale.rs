//! Hooking apply ops into automatic loss scaling.
//!
//! The numeric side of loss scaling (growing and shrinking the scale) belongs to the training
//! harness. This module only decides how the parameter updates of a step are attached to the
//! step's op list when a non-finite-gradient flag is available.

use crate::error::Result;
use crate::graph::{DType, Graph, NodeId, OpKind};

/// Receives the apply ops of a step together with the non-finite flag and returns the ops
/// to append instead.
pub trait LossScalePolicy {
    fn gate(&self, graph: &mut Graph, apply_ops: Vec<NodeId>, has_inf_nan: NodeId) -> Result<Vec<NodeId>>;
}

/// Applies the update whatever the flag says.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysApply;

impl LossScalePolicy for AlwaysApply {
    fn gate(&self, _graph: &mut Graph, apply_ops: Vec<NodeId>, _has_inf_nan: NodeId) -> Result<Vec<NodeId>> {
        Ok(apply_ops)
    }
}

/// Skips the whole update in steps whose gradients contain a NaN or an infinity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipNonFiniteUpdates;

impl LossScalePolicy for SkipNonFiniteUpdates {
    fn gate(&self, graph: &mut Graph, apply_ops: Vec<NodeId>, has_inf_nan: NodeId) -> Result<Vec<NodeId>> {
        let device = graph.device(has_inf_nan)?.clone();
        let gated = graph.add_node(
            "cond",
            OpKind::SkipIf { then_ops: apply_ops },
            vec![has_inf_nan],
            vec![],
            &device,
            vec![],
            DType::Unit,
        )?;
        Ok(vec![gated])
    }
}

#[derive(Clone, Copy)]
pub struct LossScaleParams<'a> {
    pub enabled: bool,
    /// Only the chief adjusts the loss scale.
    pub is_chief: bool,
    pub policy: &'a dyn LossScalePolicy,
}

impl Default for LossScaleParams<'_> {
    fn default() -> Self {
        Self {
            enabled: false,
            is_chief: true,
            policy: &AlwaysApply,
        }
    }
}

/// Appends `apply_ops` to `training_ops`, routed through the policy when loss scaling is on,
/// this is the chief, and a flag exists.
pub fn append_gradients_with_loss_scale(
    graph: &mut Graph,
    training_ops: &mut Vec<NodeId>,
    apply_ops: Vec<NodeId>,
    has_inf_nan: Option<NodeId>,
    params: &LossScaleParams<'_>,
) -> Result<()> {
    match has_inf_nan {
        Some(flag) if params.enabled && params.is_chief => {
            training_ops.extend(params.policy.gate(graph, apply_ops, flag)?);
        }
        _ => training_ops.extend(apply_ops),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DeviceSpec;

    fn setup() -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new();
        let cpu = DeviceSpec::cpu(0);
        let x = g.placeholder("x", &cpu, [2]);
        let flag = g.any_non_finite(&[x], &cpu).unwrap();
        let apply = g.group("apply", &[], &cpu).unwrap();
        (g, flag, apply)
    }

    #[test]
    fn test_disabled_appends_directly() {
        let (mut g, flag, apply) = setup();
        let mut ops = Vec::new();
        append_gradients_with_loss_scale(&mut g, &mut ops, vec![apply], Some(flag), &LossScaleParams::default())
            .unwrap();
        assert_eq!(ops, vec![apply]);
    }

    #[test]
    fn test_non_chief_appends_directly() {
        let (mut g, flag, apply) = setup();
        let params = LossScaleParams {
            enabled: true,
            is_chief: false,
            policy: &SkipNonFiniteUpdates,
        };
        let mut ops = Vec::new();
        append_gradients_with_loss_scale(&mut g, &mut ops, vec![apply], Some(flag), &params).unwrap();
        assert_eq!(ops, vec![apply]);
    }

    #[test]
    fn test_skip_policy_gates() {
        let (mut g, flag, apply) = setup();
        let params = LossScaleParams {
            enabled: true,
            is_chief: true,
            policy: &SkipNonFiniteUpdates,
        };
        let mut ops = Vec::new();
        append_gradients_with_loss_scale(&mut g, &mut ops, vec![apply], Some(flag), &params).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(g.node(ops[0]).unwrap().op, OpKind::SkipIf { .. }));
        assert!(g.depends_on(ops[0], apply));
        assert!(g.depends_on(ops[0], flag));
    }
}
