//! Gradient repacking.
//!
//! Many small reductions are slower than a few large ones. Repacking flattens every replica's
//! gradients into one 1-D buffer, cuts that buffer into `K` chunks, reduces the chunks with
//! hierarchical copy, and then undoes the flatten/cut on every replica.
//!
//! ```text
//! replica r:  [g0 | g1 | g2 ...]  --concat-->  [..........total..........]
//!                                   --split-->  [c0][c1]...[c(K-1) + rest]
//! ```
//!
//! Chunks `0..K-1` hold `total / K` elements and the last chunk also takes the remainder, so it
//! can be up to `K - 1` elements larger than the others.

use super::aggregation::{aggregate_gradients_using_hierarchical_copy, AggregatedDeviceGrads};
use super::{check_alignment, GradientEntry};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::tensor::DeviceSpec;
use tracing::debug;

/// Sizes of the `k` chunks a buffer of `total` elements is cut into.
pub fn chunk_sizes(total: usize, k: usize) -> Vec<usize> {
    if k == 0 {
        return Vec::new();
    }
    let split = total / k;
    let mut sizes = vec![split; k - 1];
    sizes.push(total - split * (k - 1));
    sizes
}

/// Sums every replica's gradients after repacking them into `num_splits` chunks.
///
/// The result has the same shape as `device_grads`: every replica gets every parameter's
/// aggregated gradient in its original shape, paired with its own variable.
pub fn aggregate_gradients_with_repacking(
    graph: &mut Graph,
    devices: &[DeviceSpec],
    device_grads: &[Vec<GradientEntry>],
    num_splits: usize,
    use_mean: bool,
    check_inf_nan: bool,
) -> Result<AggregatedDeviceGrads> {
    if num_splits == 0 {
        return Err(Error::Config("gradient repacking needs at least one split".into()));
    }
    let num_params = check_alignment(graph, device_grads)?;
    if num_params == 0 {
        return Ok(AggregatedDeviceGrads {
            device_grads: device_grads.to_vec(),
            has_inf_nan: None,
        });
    }

    let shapes: Vec<Vec<usize>> = device_grads[0]
        .iter()
        .map(|e| graph.shape(e.grad).map(<[usize]>::to_vec))
        .collect::<Result<_>>()?;
    let sizes: Vec<usize> = shapes.iter().map(|s| s.iter().product()).collect();
    let total: usize = sizes.iter().sum();
    let split_sizes = chunk_sizes(total, num_splits);
    debug!(total, ?split_sizes, "repacking gradients");

    let mut packs = Vec::with_capacity(device_grads.len());
    for row in device_grads {
        let device = graph.device(row[0].grad)?.clone();
        let flat = row
            .iter()
            .map(|e| graph.flatten(e.grad, &device))
            .collect::<Result<Vec<_>>>()?;
        let concat = graph.concat(&flat, &device)?;
        let chunks = graph.split(concat, &split_sizes, &device)?;
        packs.push(chunks.into_iter().map(GradientEntry::unbound).collect::<Vec<_>>());
    }

    let summed =
        aggregate_gradients_using_hierarchical_copy(graph, devices, &packs, use_mean, check_inf_nan)?;

    let mut out = Vec::with_capacity(device_grads.len());
    for (summed_row, row) in summed.device_grads.iter().zip(device_grads) {
        let device = graph.device(summed_row[0].grad)?.clone();
        let chunks: Vec<_> = summed_row.iter().map(|e| e.grad).collect();
        let concat = graph.concat(&chunks, &device)?;
        let pieces = graph.split(concat, &sizes, &device)?;
        let restored = pieces
            .into_iter()
            .zip(&shapes)
            .zip(row)
            .map(|((piece, shape), entry)| {
                Ok(GradientEntry {
                    grad: graph.reshape(piece, shape.clone(), &device)?,
                    var: entry.var,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        out.push(restored);
    }
    Ok(AggregatedDeviceGrads {
        device_grads: out,
        has_inf_nan: summed.has_inf_nan,
    })
}
