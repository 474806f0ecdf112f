//! All-reduce algorithms as graph fragments.
//!
//! Every builder takes one tensor per participating device (`inputs[d]` lives on `devices[d]`)
//! and returns one output per device, each holding the element-wise sum of all inputs.
//!
//! - **nccl**: a single collective primitive over GPUs of one host.
//! - **ring**: reduce-scatter then all-gather around a ring, optionally split into subchunks that
//!   travel rings rotated against each other.
//! - **recursive halving/doubling**: `log2(n)` pairwise exchange rounds.
//! - **shuffle**: every input is split into one shard per gather device; each gather device sums
//!   its shard and every destination concatenates the shards.
//! - **hybrids**: a first level inside each host, a second level across hosts over one
//!   representative per host, and a broadcast back inside each host.
//!
//! Inputs of any rank are flattened first and the outputs reshaped back on their devices.

use crate::error::{Error, Result};
use crate::graph::{DType, Graph, NodeId, OpKind};
use crate::tensor::DeviceSpec;

/// Splits `total` into `pieces` nearly equal sizes; the first `total % pieces` get one extra.
pub fn even_split_sizes(total: usize, pieces: usize) -> Vec<usize> {
    let base = total / pieces.max(1);
    let extra = total % pieces.max(1);
    (0..pieces).map(|i| base + usize::from(i < extra)).collect()
}

fn devices_of(graph: &Graph, inputs: &[NodeId]) -> Result<Vec<DeviceSpec>> {
    inputs.iter().map(|&i| graph.device(i).cloned()).collect()
}

/// Flattens the inputs; returns them with the original shape.
fn flatten_all(graph: &mut Graph, inputs: &[NodeId]) -> Result<(Vec<NodeId>, Vec<usize>)> {
    let shape = graph.shape(inputs[0])?.to_vec();
    if shape.len() == 1 {
        return Ok((inputs.to_vec(), shape));
    }
    let flat = inputs
        .iter()
        .map(|&i| {
            let device = graph.device(i)?.clone();
            graph.flatten(i, &device)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((flat, shape))
}

fn reshape_all(graph: &mut Graph, outputs: Vec<NodeId>, shape: &[usize]) -> Result<Vec<NodeId>> {
    if shape.len() == 1 {
        return Ok(outputs);
    }
    outputs
        .into_iter()
        .map(|o| {
            let device = graph.device(o)?.clone();
            graph.reshape(o, shape.to_vec(), &device)
        })
        .collect()
}

fn require_inputs(inputs: &[NodeId], what: &str) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::Config(format!("{what} all-reduce needs at least one input")));
    }
    Ok(())
}

/// Single-level collective sum over GPUs of one host.
pub fn build_nccl_all_reduce(graph: &mut Graph, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
    require_inputs(inputs, "nccl")?;
    let devices = devices_of(graph, inputs)?;
    if let Some(bad) = devices.iter().find(|d| !d.is_gpu()) {
        return Err(Error::Config(format!("nccl all-reduce needs GPU devices, got {bad}")));
    }
    if let Some(bad) = devices.iter().find(|d| !d.same_host(&devices[0])) {
        return Err(Error::Config(format!(
            "nccl all-reduce spans more than one host: {} and {bad}",
            devices[0]
        )));
    }
    let shape = graph.shape(inputs[0])?.to_vec();
    let group_key = graph.unique_name("nccl_all_reduce");
    devices
        .iter()
        .enumerate()
        .map(|(rank, device)| {
            graph.add_node(
                "NcclAllReduce",
                OpKind::CollectiveSum {
                    group_key: group_key.clone(),
                    rank,
                    group_size: inputs.len(),
                },
                inputs.to_vec(),
                vec![],
                device,
                shape.clone(),
                DType::F32,
            )
        })
        .collect()
}

/// Ring order for each subchunk: `perms[s][t]` is the device at ring position `t`.
///
/// Devices are numbered worker-major (`w * gpus_per_worker + gpu`). Within a worker the ring
/// visits GPUs in `gpu_perm` order, rotated by `s * max(1, gpus / subchunks)` for subchunk `s`.
pub fn ring_permutations(
    num_workers: usize,
    num_subchunks: usize,
    gpu_perm: &[usize],
) -> Result<Vec<Vec<usize>>> {
    let num_gpus = gpu_perm.len();
    if num_subchunks == 0 {
        return Err(Error::Config("ring all-reduce needs at least one subchunk".into()));
    }
    if num_subchunks > num_gpus {
        return Err(Error::Config(format!(
            "num_subchunks {num_subchunks} must be <= number of GPUs {num_gpus}"
        )));
    }
    let mut sorted = gpu_perm.to_vec();
    sorted.sort_unstable();
    if sorted != (0..num_gpus).collect::<Vec<_>>() {
        return Err(Error::Config(format!(
            "gpu indices {gpu_perm:?} are not a permutation of 0..{num_gpus}"
        )));
    }
    let rotation = (num_gpus / num_subchunks).max(1);
    Ok((0..num_subchunks)
        .map(|s| {
            let offset = (s * rotation) % num_gpus;
            (0..num_workers)
                .flat_map(|w| {
                    let order: Vec<usize> = gpu_perm.iter().map(|&g| w * num_gpus + g).collect();
                    let mut rotated = order[offset..].to_vec();
                    rotated.extend_from_slice(&order[..offset]);
                    rotated
                })
                .collect()
        })
        .collect())
}

/// Ring all-reduce over `num_workers * gpu_perm.len()` inputs ordered worker-major.
pub fn build_ring_all_reduce(
    graph: &mut Graph,
    inputs: &[NodeId],
    num_workers: usize,
    num_subchunks: usize,
    gpu_perm: &[usize],
) -> Result<Vec<NodeId>> {
    require_inputs(inputs, "ring")?;
    if inputs.len() == 1 {
        let device = graph.device(inputs[0])?.clone();
        return Ok(vec![graph.identity(inputs[0], &device)?]);
    }
    let n = inputs.len();
    if n != num_workers * gpu_perm.len() {
        return Err(Error::Config(format!(
            "ring over {num_workers} workers x {} GPUs cannot reduce {n} inputs",
            gpu_perm.len()
        )));
    }
    let perms = ring_permutations(num_workers, num_subchunks, gpu_perm)?;
    let mut rank = vec![vec![0; n]; num_subchunks];
    let mut pred = vec![vec![0; n]; num_subchunks];
    for (s, perm) in perms.iter().enumerate() {
        for (t, &d) in perm.iter().enumerate() {
            rank[s][d] = t;
            pred[s][d] = perm[(t + n - 1) % n];
        }
    }

    let (flat, shape) = flatten_all(graph, inputs)?;
    let devices = devices_of(graph, &flat)?;
    let total = graph.num_elements(flat[0])?;
    let num_chunks = n * num_subchunks;
    let sizes = even_split_sizes(total, num_chunks);
    let mut chunks: Vec<Vec<NodeId>> = Vec::with_capacity(n);
    for (d, &input) in flat.iter().enumerate() {
        chunks.push(graph.split(input, &sizes, &devices[d])?);
    }

    // Reduce-scatter: after n-1 ticks device of rank r holds the full sum of segment r.
    for tick in 0..n - 1 {
        let mut updates = Vec::with_capacity(n * num_subchunks);
        for d in 0..n {
            for s in 0..num_subchunks {
                let seg = (rank[s][d] + 2 * n - (2 + tick)) % n;
                let c = seg * num_subchunks + s;
                let sum = graph.add_n(&[chunks[pred[s][d]][c], chunks[d][c]], &devices[d])?;
                updates.push((d, c, sum));
            }
        }
        for (d, c, sum) in updates {
            chunks[d][c] = sum;
        }
    }

    // All-gather: pass completed segments along the ring.
    for tick in 0..n - 1 {
        let mut updates = Vec::with_capacity(n * num_subchunks);
        for d in 0..n {
            for s in 0..num_subchunks {
                let seg = (rank[s][d] + 2 * n - (1 + tick)) % n;
                let c = seg * num_subchunks + s;
                let copy = graph.identity(chunks[pred[s][d]][c], &devices[d])?;
                updates.push((d, c, copy));
            }
        }
        for (d, c, copy) in updates {
            chunks[d][c] = copy;
        }
    }

    let outputs = chunks
        .iter()
        .zip(&devices)
        .map(|(parts, device)| graph.concat(parts, device))
        .collect::<Result<Vec<_>>>()?;
    reshape_all(graph, outputs, &shape)
}

/// Recursive halving (reduce-scatter) then recursive doubling (all-gather).
///
/// With a device count that is not a power of two, the surplus devices first add their input
/// into a partner inside the power-of-two core and receive the result from it at the end.
pub fn build_recursive_hd_all_reduce(graph: &mut Graph, inputs: &[NodeId]) -> Result<Vec<NodeId>> {
    require_inputs(inputs, "recursive halving/doubling")?;
    let (flat, shape) = flatten_all(graph, inputs)?;
    let devices = devices_of(graph, &flat)?;
    let n = flat.len();
    let core = 1usize << (usize::BITS - 1 - n.leading_zeros());

    let mut chunks: Vec<NodeId> = flat[..core].to_vec();
    for extra in core..n {
        let partner = extra - core;
        chunks[partner] = graph.add_n(&[chunks[partner], flat[extra]], &devices[partner])?;
    }

    let hops = core.trailing_zeros() as usize;
    for h in 0..hops {
        let span = 1 << h;
        let group = span * 2;
        let mut next = chunks.clone();
        for d in (0..core).filter(|d| d % group < span) {
            let (left, right) = (d, d + span);
            let len = graph.num_elements(chunks[left])?;
            let halves = [len - len / 2, len / 2];
            let l = graph.split(chunks[left], &halves, &devices[left])?;
            let r = graph.split(chunks[right], &halves, &devices[right])?;
            next[left] = graph.add_n(&[l[0], r[0]], &devices[left])?;
            next[right] = graph.add_n(&[l[1], r[1]], &devices[right])?;
        }
        chunks = next;
    }

    for h in (0..hops).rev() {
        let span = 1 << h;
        let group = span * 2;
        let mut next = chunks.clone();
        for d in (0..core).filter(|d| d % group < span) {
            let (left, right) = (d, d + span);
            next[left] = graph.concat(&[chunks[left], chunks[right]], &devices[left])?;
            next[right] = graph.concat(&[chunks[left], chunks[right]], &devices[right])?;
        }
        chunks = next;
    }

    let mut outputs = chunks;
    for extra in core..n {
        let partner = extra - core;
        outputs.push(graph.identity(outputs[partner], &devices[extra])?);
    }
    reshape_all(graph, outputs, &shape)
}

/// Sums shard `k` of every (flat) input on `gather_devices[k]`.
fn build_shuffle_gather(
    graph: &mut Graph,
    inputs: &[NodeId],
    gather_devices: &[DeviceSpec],
) -> Result<Vec<NodeId>> {
    if gather_devices.is_empty() {
        return Err(Error::Config("shuffle all-reduce needs gather devices".into()));
    }
    let total = graph.num_elements(inputs[0])?;
    let sizes = even_split_sizes(total, gather_devices.len());
    let mut shards_by_source = Vec::with_capacity(inputs.len());
    for &input in inputs {
        let device = graph.device(input)?.clone();
        shards_by_source.push(graph.split(input, &sizes, &device)?);
    }
    gather_devices
        .iter()
        .enumerate()
        .map(|(k, device)| {
            let shard: Vec<NodeId> = shards_by_source.iter().map(|s| s[k]).collect();
            graph.add_n(&shard, device)
        })
        .collect()
}

fn build_shuffle_scatter(
    graph: &mut Graph,
    reduced_shards: &[NodeId],
    dst_devices: &[DeviceSpec],
) -> Result<Vec<NodeId>> {
    dst_devices
        .iter()
        .map(|device| graph.concat(reduced_shards, device))
        .collect()
}

/// Shuffle all-reduce through `gather_devices`.
pub fn build_shuffle_all_reduce(
    graph: &mut Graph,
    inputs: &[NodeId],
    gather_devices: &[DeviceSpec],
) -> Result<Vec<NodeId>> {
    require_inputs(inputs, "shuffle")?;
    let (flat, shape) = flatten_all(graph, inputs)?;
    let dst_devices = devices_of(graph, &flat)?;
    let reduced = build_shuffle_gather(graph, &flat, gather_devices)?;
    let outputs = build_shuffle_scatter(graph, &reduced, &dst_devices)?;
    reshape_all(graph, outputs, &shape)
}

/// Groups inputs by host, preserving order of first appearance.
fn split_by_host(devices: &[DeviceSpec], inputs: &[NodeId]) -> (Vec<Vec<DeviceSpec>>, Vec<Vec<NodeId>>) {
    let mut hosts: Vec<DeviceSpec> = Vec::new();
    let mut per_host_devices: Vec<Vec<DeviceSpec>> = Vec::new();
    let mut per_host_values: Vec<Vec<NodeId>> = Vec::new();
    for (device, &input) in devices.iter().zip(inputs) {
        let host = device.host();
        let w = match hosts.iter().position(|h| *h == host) {
            Some(w) => w,
            None => {
                hosts.push(host);
                per_host_devices.push(Vec::new());
                per_host_values.push(Vec::new());
                hosts.len() - 1
            }
        };
        per_host_devices[w].push(device.clone());
        per_host_values[w].push(input);
    }
    (per_host_devices, per_host_values)
}

/// Upper level of a two-level reduction, applied to one value per host.
pub enum UpperLevel<'a> {
    Ring,
    RecursiveHd,
    Shuffle { gather_devices: &'a [DeviceSpec] },
}

impl UpperLevel<'_> {
    fn build(&self, graph: &mut Graph, values: &[NodeId]) -> Result<Vec<NodeId>> {
        match self {
            // One participant per host: a ring over hosts with a single slot each.
            UpperLevel::Ring => build_ring_all_reduce(graph, values, values.len(), 1, &[0]),
            UpperLevel::RecursiveHd => build_recursive_hd_all_reduce(graph, values),
            UpperLevel::Shuffle { gather_devices } => {
                build_shuffle_all_reduce(graph, values, gather_devices)
            }
        }
    }
}

/// nccl inside each host, `upper` across hosts, broadcast back inside each host.
pub fn build_nccl_hybrid(
    graph: &mut Graph,
    inputs: &[NodeId],
    upper: UpperLevel<'_>,
) -> Result<Vec<NodeId>> {
    require_inputs(inputs, "nccl hybrid")?;
    let (flat, shape) = flatten_all(graph, inputs)?;
    let devices = devices_of(graph, &flat)?;
    let (per_host_devices, per_host_values) = split_by_host(&devices, &flat);

    let mut up_values = Vec::with_capacity(per_host_values.len());
    for values in &per_host_values {
        let reduced = build_nccl_all_reduce(graph, values)?;
        let device = graph.device(reduced[0])?.clone();
        let shape = graph.shape(reduced[0])?.to_vec();
        // Every member of the collective must run even though only one output moves on.
        let up = graph.add_node(
            "Identity",
            OpKind::Identity,
            vec![reduced[0]],
            reduced[1..].to_vec(),
            &device,
            shape,
            DType::F32,
        )?;
        up_values.push(up);
    }

    let level_2 = upper.build(graph, &up_values)?;

    let mut outputs = Vec::with_capacity(flat.len());
    for (host_devices, &value) in per_host_devices.iter().zip(&level_2) {
        let src = graph.identity(value, &host_devices[0])?;
        for device in host_devices {
            outputs.push(graph.identity(src, device)?);
        }
    }
    reshape_all(graph, outputs, &shape)
}

/// Shuffle inside each host through `first_gather_devices[host]`, `upper` across hosts, then
/// scatter inside each host.
pub fn build_shuffle_hybrid(
    graph: &mut Graph,
    inputs: &[NodeId],
    first_gather_devices: &[DeviceSpec],
    upper: UpperLevel<'_>,
) -> Result<Vec<NodeId>> {
    require_inputs(inputs, "shuffle hybrid")?;
    let (flat, shape) = flatten_all(graph, inputs)?;
    let devices = devices_of(graph, &flat)?;
    let (per_host_devices, per_host_values) = split_by_host(&devices, &flat);
    if first_gather_devices.len() != per_host_values.len() {
        return Err(Error::Config(format!(
            "shuffle hybrid needs one gather device per host: {} devices for {} hosts",
            first_gather_devices.len(),
            per_host_values.len()
        )));
    }

    let mut up_values = Vec::with_capacity(per_host_values.len());
    for (values, gather) in per_host_values.iter().zip(first_gather_devices) {
        let reduced = build_shuffle_gather(graph, values, std::slice::from_ref(gather))?;
        up_values.push(reduced[0]);
    }

    let level_2 = upper.build(graph, &up_values)?;

    let mut outputs = Vec::with_capacity(flat.len());
    for (host_devices, &value) in per_host_devices.iter().zip(&level_2) {
        outputs.extend(build_shuffle_scatter(graph, &[value], host_devices)?);
    }
    reshape_all(graph, outputs, &shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(g: &mut Graph, devices: &[DeviceSpec], shape: &[usize]) -> Vec<NodeId> {
        devices
            .iter()
            .map(|d| g.placeholder("x", d, shape.to_vec()))
            .collect()
    }

    #[test]
    fn test_even_split_sizes() {
        assert_eq!(even_split_sizes(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(even_split_sizes(2, 3), vec![1, 1, 0]);
    }

    #[test]
    fn test_ring_permutations_rotate_per_subchunk() {
        let perms = ring_permutations(1, 2, &[0, 1, 2, 3]).unwrap();
        assert_eq!(perms[0], vec![0, 1, 2, 3]);
        assert_eq!(perms[1], vec![2, 3, 0, 1]);

        let two_workers = ring_permutations(2, 1, &[1, 0]).unwrap();
        assert_eq!(two_workers[0], vec![1, 0, 3, 2]);
    }

    #[test]
    fn test_ring_permutations_validate() {
        assert!(ring_permutations(1, 3, &[0, 1]).is_err());
        assert!(ring_permutations(1, 1, &[0, 2]).is_err());
    }

    #[test]
    fn test_nccl_rejects_cross_host() {
        let mut g = Graph::new();
        let devices = [
            "/job:worker/task:0/gpu:0".parse().unwrap(),
            "/job:worker/task:1/gpu:0".parse().unwrap(),
        ];
        let xs = inputs(&mut g, &devices, &[4]);
        assert!(matches!(build_nccl_all_reduce(&mut g, &xs), Err(Error::Config(_))));
    }

    #[test]
    fn test_outputs_keep_shape_and_device() {
        let mut g = Graph::new();
        let devices: Vec<_> = (0..3).map(DeviceSpec::gpu).collect();
        let xs = inputs(&mut g, &devices, &[2, 5]);
        let outs = build_recursive_hd_all_reduce(&mut g, &xs).unwrap();
        assert_eq!(outs.len(), 3);
        for (o, d) in outs.iter().zip(&devices) {
            assert_eq!(g.shape(*o).unwrap(), &[2, 5]);
            assert_eq!(g.device(*o).unwrap(), d);
        }
    }

    #[test]
    fn test_shuffle_hybrid_needs_gather_device_per_host() {
        let mut g = Graph::new();
        let devices: Vec<_> = (0..2).map(DeviceSpec::gpu).collect();
        let xs = inputs(&mut g, &devices, &[4]);
        let gathers = [DeviceSpec::cpu(0), DeviceSpec::cpu(1)];
        assert!(build_shuffle_hybrid(
            &mut g,
            &xs,
            &gathers,
            UpperLevel::Shuffle {
                gather_devices: &gathers[..1]
            }
        )
        .is_err());
    }
}
