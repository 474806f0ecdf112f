//! Copy-based gradient aggregation.
//!
//! "Copy" means the reduction is a plain `AddN` on one device: every replica's gradient is
//! copied there, summed, and (for the mean) scaled by `1 / R`. Where that device is depends on
//! the caller:
//!
//! | Target                                   | Device for parameter `i`          |
//! |------------------------------------------|-----------------------------------|
//! | [`AggregationTarget::Fixed`]             | one device for everything         |
//! | [`AggregationTarget::RoundRobin`]        | `devices[i % devices.len()]`      |
//! | [`AggregationTarget::ColocateWithVariable`] | the variable's own device      |
//!
//! [`aggregate_gradients_using_hierarchical_copy`] instead splits the devices into two groups,
//! reduces inside each group, adds the two partial sums, and broadcasts the result back.
//!
//! All functions optionally emit a boolean scalar that is true iff any input gradient holds a
//! NaN or an infinity. The flag is advisory: nothing here branches on it.

use super::{check_alignment, column, GradientEntry};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::tensor::DeviceSpec;

/// Where copy aggregation places each parameter's reduction.
#[derive(Clone, Copy, Debug)]
pub enum AggregationTarget<'a> {
    Fixed(&'a DeviceSpec),
    RoundRobin(&'a [DeviceSpec]),
    ColocateWithVariable,
}

/// One aggregated gradient per parameter.
#[derive(Clone, Debug)]
pub struct AggregatedGrads {
    pub grads: Vec<GradientEntry>,
    pub has_inf_nan: Option<NodeId>,
}

/// One aggregated gradient per parameter, per replica.
#[derive(Clone, Debug)]
pub struct AggregatedDeviceGrads {
    pub device_grads: Vec<Vec<GradientEntry>>,
    pub has_inf_nan: Option<NodeId>,
}

/// Sums one parameter's gradients across replicas on `device`.
///
/// The variable of the first entry is carried to the result. `use_mean` divides by the number of
/// replicas when there is more than one.
pub fn aggregate_single_gradient_using_copy(
    graph: &mut Graph,
    grad_and_vars: &[GradientEntry],
    device: &DeviceSpec,
    use_mean: bool,
    check_inf_nan: bool,
) -> Result<(GradientEntry, Option<NodeId>)> {
    let first = grad_and_vars
        .first()
        .ok_or_else(|| Error::Config("cannot aggregate an empty gradient list".into()))?;
    let grads: Vec<NodeId> = grad_and_vars.iter().map(|e| e.grad).collect();
    let mut grad = graph.add_n(&grads, device)?;
    if use_mean && grads.len() > 1 {
        grad = graph.scale(grad, 1.0 / grads.len() as f32, device)?;
    }
    let has_inf_nan = if check_inf_nan {
        Some(graph.any_non_finite(&grads, device)?)
    } else {
        None
    };
    Ok((
        GradientEntry {
            grad,
            var: first.var,
        },
        has_inf_nan,
    ))
}

fn reduce_flags(graph: &mut Graph, flags: &[NodeId]) -> Result<Option<NodeId>> {
    match flags.first() {
        None => Ok(None),
        Some(&first) => {
            let device = graph.device(first)?.clone();
            Ok(Some(graph.logical_any(flags, &device)?))
        }
    }
}

/// Sums (or averages) every parameter across replicas. Returns one entry per parameter,
/// carrying replica 0's variable.
pub fn aggregate_gradients_using_copy(
    graph: &mut Graph,
    device_grads: &[Vec<GradientEntry>],
    target: AggregationTarget<'_>,
    use_mean: bool,
    check_inf_nan: bool,
) -> Result<AggregatedGrads> {
    let num_params = check_alignment(graph, device_grads)?;
    let mut grads = Vec::with_capacity(num_params);
    let mut flags = Vec::new();
    for i in 0..num_params {
        let single = column(device_grads, i);
        let device = match target {
            AggregationTarget::Fixed(device) => device.clone(),
            AggregationTarget::RoundRobin(devices) => {
                if devices.is_empty() {
                    return Err(Error::Config("round-robin aggregation needs devices".into()));
                }
                devices[i % devices.len()].clone()
            }
            AggregationTarget::ColocateWithVariable => {
                let var = single[0].var.ok_or_else(|| {
                    Error::Config(format!("gradient {i} has no variable to colocate with"))
                })?;
                if let Some(bad) = single.iter().position(|e| e.var != Some(var)) {
                    return Err(Error::Config(format!(
                        "replica {bad} pairs gradient {i} with a different variable than replica 0"
                    )));
                }
                graph.variable(var)?.device.clone()
            }
        };
        let (entry, flag) =
            aggregate_single_gradient_using_copy(graph, &single, &device, use_mean, check_inf_nan)?;
        grads.push(entry);
        flags.extend(flag);
    }
    Ok(AggregatedGrads {
        grads,
        has_inf_nan: reduce_flags(graph, &flags)?,
    })
}

/// Copy aggregation placed round-robin over `devices`.
pub fn aggregate_gradients_using_copy_with_device_selection(
    graph: &mut Graph,
    devices: &[DeviceSpec],
    device_grads: &[Vec<GradientEntry>],
    use_mean: bool,
    check_inf_nan: bool,
) -> Result<AggregatedGrads> {
    aggregate_gradients_using_copy(
        graph,
        device_grads,
        AggregationTarget::RoundRobin(devices),
        use_mean,
        check_inf_nan,
    )
}

/// Copy aggregation on each variable's device. Every replica must use the same variable.
pub fn aggregate_gradients_using_copy_with_variable_colocation(
    graph: &mut Graph,
    device_grads: &[Vec<GradientEntry>],
    use_mean: bool,
    check_inf_nan: bool,
) -> Result<AggregatedGrads> {
    aggregate_gradients_using_copy(
        graph,
        device_grads,
        AggregationTarget::ColocateWithVariable,
        use_mean,
        check_inf_nan,
    )
}

/// Two-level reduction for hosts whose devices form two fast islands.
///
/// Devices `[0, n/2)` form group 0, `[n/2, n)` group 1. For parameter `i` the root of its own
/// group is device `i % n`, and the root of the other group is the device at the same offset
/// there. Each group is summed on its root, the two partial sums are added on the first root,
/// copied to the second, and every device receives the result from its group's root.
///
/// `devices[r]` must be replica `r`'s device. With a single device the sum is just copied back.
pub fn aggregate_gradients_using_hierarchical_copy(
    graph: &mut Graph,
    devices: &[DeviceSpec],
    device_grads: &[Vec<GradientEntry>],
    use_mean: bool,
    check_inf_nan: bool,
) -> Result<AggregatedDeviceGrads> {
    let num_params = check_alignment(graph, device_grads)?;
    let n = device_grads.len();
    if devices.len() != n {
        return Err(Error::Config(format!(
            "hierarchical copy needs one device per replica: {} devices for {n} replicas",
            devices.len()
        )));
    }
    let half = n / 2;
    let group_of = |d: usize| usize::from(d >= half);
    let groups = [0..half, half..n];

    let mut per_param = Vec::with_capacity(num_params);
    let mut flags = Vec::new();
    for i in 0..num_params {
        let single = column(device_grads, i);
        let main = i % n;

        let bcast = if half == 0 {
            let (sum, _) =
                aggregate_single_gradient_using_copy(graph, &single, &devices[main], false, false)?;
            devices
                .iter()
                .map(|d| graph.identity(sum.grad, d))
                .collect::<Result<Vec<_>>>()?
        } else {
            let main_group = group_of(main);
            let other = &groups[1 - main_group];
            let offset = main - groups[main_group].start;
            let other_main = other.start + offset % other.len();

            let (g0, _) = aggregate_single_gradient_using_copy(
                graph,
                &single[groups[main_group].clone()],
                &devices[main],
                false,
                false,
            )?;
            let (g1, _) = aggregate_single_gradient_using_copy(
                graph,
                &single[other.clone()],
                &devices[other_main],
                false,
                false,
            )?;
            let (sum, _) =
                aggregate_single_gradient_using_copy(graph, &[g0, g1], &devices[main], false, false)?;

            let root_0 = graph.identity(sum.grad, &devices[main])?;
            let root_1 = graph.identity(sum.grad, &devices[other_main])?;
            devices
                .iter()
                .enumerate()
                .map(|(j, device)| {
                    let src = if group_of(j) == main_group { root_0 } else { root_1 };
                    graph.identity(src, device)
                })
                .collect::<Result<Vec<_>>>()?
        };
        per_param.push(finish(graph, devices, &single, bcast, use_mean)?);
        if check_inf_nan {
            let grads: Vec<NodeId> = single.iter().map(|e| e.grad).collect();
            flags.push(graph.any_non_finite(&grads, &devices[main])?);
        }
    }

    // per_param is [param][replica]; transpose to [replica][param].
    let device_grads = (0..n)
        .map(|r| per_param.iter().map(|col| col[r]).collect())
        .collect();
    Ok(AggregatedDeviceGrads {
        device_grads,
        has_inf_nan: reduce_flags(graph, &flags)?,
    })
}

/// Pairs each replica's copy of the sum with that replica's variable, scaling for the mean.
fn finish(
    graph: &mut Graph,
    devices: &[DeviceSpec],
    single: &[GradientEntry],
    bcast: Vec<NodeId>,
    use_mean: bool,
) -> Result<Vec<GradientEntry>> {
    let n = single.len();
    bcast
        .into_iter()
        .zip(single)
        .zip(devices)
        .map(|((g, entry), device)| {
            let grad = if use_mean && n > 1 {
                graph.scale(g, 1.0 / n as f32, device)?
            } else {
                g
            };
            Ok(GradientEntry {
                grad,
                var: entry.var,
            })
        })
        .collect()
}
