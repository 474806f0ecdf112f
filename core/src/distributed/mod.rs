//! # Gradient aggregation for data-parallel training
//!
//! Data parallelism replicates the model on every device and splits the batch. After the
//! backward pass each replica holds its own gradient for every parameter; before the update
//! those gradients have to be combined. This module builds the graph fragments that do it.
//!
//! ## The gradient matrix
//!
//! The input to every aggregation is a [`DeviceGradients`] matrix:
//!
//! ```text
//!              param 0        param 1        param 2
//! replica 0   (g00, v0)      (g01, v1)      (g02, v2)
//! replica 1   (g10, v0')     (g11, v1')     (g12, v2')
//! ```
//!
//! Positional correspondence is the invariant everything relies on: column `i` holds the same
//! logical parameter in every row, with identical gradient shapes.
//!
//! ## Module Contents
//!
//! *   [`aggregation`]: direct-copy and hierarchical-copy reduction, with NaN/Inf detection.
//! *   [`repack`]: flatten-concat-split repacking into `K` chunks before reduction.
//! *   [`packing`]: batching of small gradients into one tensor.
//! *   [`allreduce`]: all-reduce spec parsing, partitioning by size, and the tree-reduction
//!     engine [`sum_gradients_all_reduce`](allreduce::sum_gradients_all_reduce).
//! *   [`collective`]: the reduction algorithms themselves (nccl, ring, recursive halving and
//!     doubling, shuffle, and their two-level hybrids).
//! *   [`placement`]: device setters and the variable interceptors used by placement strategies.
//! *   [`staging`]: the per-step staged-variable cache.
//! *   [`sync`]: queue-based barriers between workers.

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, VarId};

pub mod aggregation;
pub mod allreduce;
pub mod collective;
pub mod packing;
pub mod placement;
pub mod repack;
pub mod staging;
pub mod sync;

/// A gradient and the parameter it belongs to.
///
/// The parameter is absent for synthetic gradients (repacked chunks, packed small tensors).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GradientEntry {
    pub grad: NodeId,
    pub var: Option<VarId>,
}

impl GradientEntry {
    pub fn new(grad: NodeId, var: VarId) -> Self {
        Self {
            grad,
            var: Some(var),
        }
    }

    pub fn unbound(grad: NodeId) -> Self {
        Self { grad, var: None }
    }
}

/// `[replica][parameter]` gradient matrix.
pub type DeviceGradients = Vec<Vec<GradientEntry>>;

/// Checks that every replica row has the same length and that each column has one gradient
/// shape. Returns the number of parameters.
pub fn check_alignment(graph: &Graph, device_grads: &[Vec<GradientEntry>]) -> Result<usize> {
    let first = device_grads
        .first()
        .ok_or_else(|| Error::Config("gradient matrix has no replicas".into()))?;
    for (r, row) in device_grads.iter().enumerate() {
        if row.len() != first.len() {
            return Err(Error::Config(format!(
                "replica {r} has {} gradients, replica 0 has {}",
                row.len(),
                first.len()
            )));
        }
        for (i, (entry, reference)) in row.iter().zip(first).enumerate() {
            if graph.shape(entry.grad)? != graph.shape(reference.grad)? {
                return Err(Error::Config(format!(
                    "gradient {i} of replica {r} has shape {:?}, replica 0 has {:?}",
                    graph.shape(entry.grad)?,
                    graph.shape(reference.grad)?
                )));
            }
        }
    }
    Ok(first.len())
}

/// Column `i` of the matrix: parameter `i` across all replicas.
pub(crate) fn column(device_grads: &[Vec<GradientEntry>], i: usize) -> Vec<GradientEntry> {
    device_grads.iter().map(|row| row[i]).collect()
}
