use super::Optimizer;
use crate::distributed::GradientEntry;
use crate::error::{Error, Result};
use crate::graph::{DType, Graph, NodeId, OpKind};
use crate::tensor::{self, Tensor, TensorError};

/// Stochastic Gradient Descent (SGD) optimizer.
///
/// Updates parameters using the rule:
/// `param = param - learning_rate * grad`
#[derive(Clone, Debug)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn apply_gradients(&self, graph: &mut Graph, grads: &[GradientEntry]) -> Result<Vec<NodeId>> {
        grads
            .iter()
            .map(|entry| {
                let var = entry.var.ok_or_else(|| {
                    Error::Config(format!("gradient {} has no variable to apply to", entry.grad))
                })?;
                let (name, device, shape) = {
                    let v = graph.variable(var)?;
                    (
                        format!("{}/ApplyGradientDescent", v.name),
                        v.device.clone(),
                        v.shape.clone(),
                    )
                };
                let grad_shape = graph.shape(entry.grad)?;
                if grad_shape != shape.as_slice() {
                    return Err(Error::Tensor(TensorError::ShapeMismatch {
                        expected: shape,
                        got: grad_shape.to_vec(),
                    }));
                }
                graph.add_node(
                    &name,
                    OpKind::ApplySgd {
                        var,
                        learning_rate: self.learning_rate,
                    },
                    vec![entry.grad],
                    vec![],
                    &device,
                    vec![],
                    DType::Unit,
                )
            })
            .collect()
    }
}

/// Host-side update used by the reference runtime.
pub fn sgd_update(param: &mut Tensor<f32>, grad: &Tensor<f32>, learning_rate: f32) -> tensor::Result<()> {
    param.axpy(-learning_rate, grad)
}
