pub mod sgd;
pub use sgd::Sgd;

use crate::distributed::GradientEntry;
use crate::error::Result;
use crate::graph::{Graph, NodeId};

/// A trait for optimizers (e.g., SGD, Adam).
///
/// Optimizers turn `(gradient, variable)` pairs into update operations appended to the graph.
/// The placement strategy decides which pairs each device applies and where; the optimizer only
/// decides what an update is.
pub trait Optimizer {
    /// Emits one update op per entry and returns them in input order.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry carries no variable or if the gradient shape differs from
    /// the variable shape.
    fn apply_gradients(&self, graph: &mut Graph, grads: &[GradientEntry]) -> Result<Vec<NodeId>>;
}
