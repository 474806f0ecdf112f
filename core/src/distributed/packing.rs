//! Small-gradient packing.
//!
//! Per-tensor all-reduce has a fixed cost, so runs of consecutive small gradients are
//! concatenated into one 1-D tensor before reduction and split back afterwards.
//!
//! A gradient is *small* when its byte size is at most `max_bytes`. Consecutive small gradients
//! form a pack whose total size stays within `max_bytes` and which holds at most `max_group`
//! members; a run of length one stays a single. After packing every replica row is
//! `[pack 0, pack 1, ..., single, single, ...]` with singles in their original order.

use super::{check_alignment, GradientEntry};
use crate::error::{Error, Result};
use crate::graph::{Graph, VarId};
use std::ops::RangeInclusive;
use tracing::debug;

/// How a gradient row was packed. Needed to undo the packing.
#[derive(Clone, Debug)]
pub struct Packing {
    /// Parameter index ranges packed together, in order.
    pub ranges: Vec<RangeInclusive<usize>>,
    /// Parameter indices left alone, in order.
    pub singles: Vec<usize>,
    /// Original gradient shape of every parameter.
    shapes: Vec<Vec<usize>>,
    /// Original variables, `[replica][parameter]`.
    vars: Vec<Vec<Option<VarId>>>,
}

impl Packing {
    pub fn num_packs(&self) -> usize {
        self.ranges.len()
    }
}

fn format_size(bytes: f64) -> String {
    let mut num = bytes;
    for unit in ["", "K", "M", "G", "T"] {
        if num.abs() < 1024.0 {
            return format!("{num:.1}{unit}");
        }
        num /= 1024.0;
    }
    format!("{num:.1}P")
}

/// Logs count, total, min, max and average of a list of tensor sizes.
pub fn log_size_stats(what: &str, sizes: &[usize]) {
    if sizes.is_empty() {
        return;
    }
    let total: usize = sizes.iter().sum();
    let min = sizes.iter().min().copied().unwrap_or(0);
    let max = sizes.iter().max().copied().unwrap_or(0);
    debug!(
        "{what}: {} tensors, total {}, min {}, max {}, avg {}",
        sizes.len(),
        format_size(total as f64),
        format_size(min as f64),
        format_size(max as f64),
        format_size(total as f64 / sizes.len() as f64),
    );
}

/// Splits `indices` (sorted) into runs of consecutive values. `sizes[i]` is the byte size of
/// parameter `i`; a run is closed before its total would exceed `max_bytes` or its length
/// `max_group`. Runs of one element are returned as singles.
pub fn extract_ranges(
    indices: &[usize],
    sizes: &[usize],
    max_bytes: usize,
    max_group: usize,
) -> (Vec<RangeInclusive<usize>>, Vec<usize>) {
    let mut ranges = Vec::new();
    let mut singles = Vec::new();
    let Some((&first, rest)) = indices.split_first() else {
        return (ranges, singles);
    };
    let mut close = |first: usize, last: usize| {
        if last > first {
            ranges.push(first..=last);
        } else {
            singles.push(first);
        }
    };
    let (mut start, mut last, mut bytes) = (first, first, sizes[first]);
    for &i in rest {
        let fits = bytes + sizes[i] <= max_bytes && last - start + 1 < max_group;
        if i == last + 1 && fits {
            last = i;
            bytes += sizes[i];
        } else {
            close(start, last);
            start = i;
            last = i;
            bytes = sizes[i];
        }
    }
    close(start, last);
    (ranges, singles)
}

/// Packs small gradients. Returns the matrix unchanged and `None` when nothing is packed.
pub fn pack_small_tensors(
    graph: &mut Graph,
    device_grads: &[Vec<GradientEntry>],
    max_bytes: usize,
    max_group: usize,
) -> Result<(Vec<Vec<GradientEntry>>, Option<Packing>)> {
    let num_params = check_alignment(graph, device_grads)?;
    let sizes = device_grads[0]
        .iter()
        .map(|e| graph.byte_size(e.grad))
        .collect::<Result<Vec<_>>>()?;
    log_size_stats("gradients before packing", &sizes);

    let small: Vec<usize> = (0..num_params).filter(|&i| sizes[i] <= max_bytes).collect();
    let (ranges, small_singles) = extract_ranges(&small, &sizes, max_bytes, max_group);
    if ranges.is_empty() {
        return Ok((device_grads.to_vec(), None));
    }
    let mut singles: Vec<usize> = (0..num_params)
        .filter(|&i| sizes[i] > max_bytes)
        .chain(small_singles)
        .collect();
    singles.sort_unstable();

    let shapes = device_grads[0]
        .iter()
        .map(|e| graph.shape(e.grad).map(<[usize]>::to_vec))
        .collect::<Result<Vec<_>>>()?;

    let mut packed = Vec::with_capacity(device_grads.len());
    for row in device_grads {
        let mut new_row = Vec::with_capacity(ranges.len() + singles.len());
        for range in &ranges {
            let members = row[range.clone()]
                .iter()
                .map(|e| {
                    let device = graph.device(e.grad)?.clone();
                    graph.flatten(e.grad, &device)
                })
                .collect::<Result<Vec<_>>>()?;
            let device = graph.device(members[0])?.clone();
            new_row.push(GradientEntry::unbound(graph.concat(&members, &device)?));
        }
        new_row.extend(singles.iter().map(|&i| row[i]));
        packed.push(new_row);
    }

    let packed_sizes: Vec<usize> = ranges
        .iter()
        .map(|r| r.clone().map(|i| sizes[i]).sum::<usize>())
        .chain(singles.iter().map(|&i| sizes[i]))
        .collect();
    log_size_stats("gradients after packing", &packed_sizes);

    let vars = device_grads
        .iter()
        .map(|row| row.iter().map(|e| e.var).collect())
        .collect();
    Ok((
        packed,
        Some(Packing {
            ranges,
            singles,
            shapes,
            vars,
        }),
    ))
}

/// Reverses [`pack_small_tensors`] on a reduced matrix with the same layout.
pub fn unpack_small_tensors(
    graph: &mut Graph,
    device_grads: Vec<Vec<GradientEntry>>,
    packing: Option<&Packing>,
) -> Result<Vec<Vec<GradientEntry>>> {
    let Some(packing) = packing else {
        return Ok(device_grads);
    };
    let num_packs = packing.num_packs();
    let num_params = packing.shapes.len();
    if device_grads.len() != packing.vars.len() {
        return Err(Error::Config(format!(
            "packed {} replicas but unpacking {}",
            packing.vars.len(),
            device_grads.len()
        )));
    }

    let mut out = Vec::with_capacity(device_grads.len());
    for (r, row) in device_grads.into_iter().enumerate() {
        if row.len() != num_packs + packing.singles.len() {
            return Err(Error::Config(format!(
                "replica {r} has {} gradients after reduction, expected {}",
                row.len(),
                num_packs + packing.singles.len()
            )));
        }
        let mut slots: Vec<Option<GradientEntry>> = vec![None; num_params];
        for (&i, &entry) in packing.singles.iter().zip(&row[num_packs..]) {
            slots[i] = Some(entry);
        }
        for (range, packed) in packing.ranges.iter().zip(&row[..num_packs]) {
            let device = graph.device(packed.grad)?.clone();
            let widths: Vec<usize> = range
                .clone()
                .map(|i| packing.shapes[i].iter().product())
                .collect();
            let pieces = graph.split(packed.grad, &widths, &device)?;
            for (i, piece) in range.clone().zip(pieces) {
                let grad = graph.reshape(piece, packing.shapes[i].clone(), &device)?;
                slots[i] = Some(GradientEntry {
                    grad,
                    var: packing.vars[r][i],
                });
            }
        }
        let restored = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| Error::Config(format!("parameter {i} lost while unpacking")))
            })
            .collect::<Result<Vec<_>>>()?;
        out.push(restored);
    }
    Ok(out)
}
