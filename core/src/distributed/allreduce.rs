//! All-reduce specs and the tree-reduction engine.
//!
//! An all-reduce spec picks the reduction algorithm per gradient size range:
//!
//! ```text
//! alg[#shards]:limit:alg[#shards]:limit:...:alg[#shards]
//! ```
//!
//! Gradients are consumed positionally: the first range takes the longest prefix of the
//! (remaining) gradient list whose total byte size fits in its limit, the next range continues
//! from there, and the last range (limit `-1`) takes whatever is left. Limits accept the
//! suffixes `k`/`K` (KiB), `M`, `G` and `T`.
//!
//! | Algorithm     | Meaning                                                     |
//! |---------------|-------------------------------------------------------------|
//! | `nccl`        | collective primitive across the GPUs of one host            |
//! | `xring`       | ring all-reduce, `#shards` subchunks                        |
//! | `rechd`       | recursive halving and doubling                              |
//! | `pscpu`       | shuffle through each host's CPU                             |
//! | `psgpu`       | shuffle through GPUs                                        |
//! | `nccl/xring`  | nccl inside hosts, ring across hosts                        |
//! | `nccl/rechd`  | nccl inside hosts, recursive halving/doubling across hosts  |
//! | `nccl/pscpu`  | nccl inside hosts, shuffle across hosts                     |
//! | `pscpu/pscpu` | shuffle inside hosts, shuffle across hosts                  |

use super::collective::{
    build_nccl_all_reduce, build_nccl_hybrid, build_recursive_hd_all_reduce,
    build_ring_all_reduce, build_shuffle_all_reduce, build_shuffle_hybrid, UpperLevel,
};
use super::packing::{pack_small_tensors, unpack_small_tensors};
use super::{check_alignment, column, GradientEntry};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::tensor::{DeviceSpec, DeviceType};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// A reduction algorithm named in an all-reduce spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllReduceAlg {
    Nccl,
    NcclXring,
    NcclRechd,
    NcclPscpu,
    Xring,
    Rechd,
    Pscpu,
    Psgpu,
    PscpuPscpu,
}

impl AllReduceAlg {
    pub const ALL: [AllReduceAlg; 9] = [
        AllReduceAlg::Nccl,
        AllReduceAlg::NcclXring,
        AllReduceAlg::NcclRechd,
        AllReduceAlg::NcclPscpu,
        AllReduceAlg::Xring,
        AllReduceAlg::Rechd,
        AllReduceAlg::Pscpu,
        AllReduceAlg::Psgpu,
        AllReduceAlg::PscpuPscpu,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AllReduceAlg::Nccl => "nccl",
            AllReduceAlg::NcclXring => "nccl/xring",
            AllReduceAlg::NcclRechd => "nccl/rechd",
            AllReduceAlg::NcclPscpu => "nccl/pscpu",
            AllReduceAlg::Xring => "xring",
            AllReduceAlg::Rechd => "rechd",
            AllReduceAlg::Pscpu => "pscpu",
            AllReduceAlg::Psgpu => "psgpu",
            AllReduceAlg::PscpuPscpu => "pscpu/pscpu",
        }
    }

    /// Two-level algorithms reduce inside hosts first.
    pub fn is_hierarchical(&self) -> bool {
        self.name().contains('/')
    }

    /// Algorithms that gather through auxiliary devices, grouped by `#shards`.
    pub fn uses_shuffle(&self) -> bool {
        matches!(
            self,
            AllReduceAlg::NcclPscpu | AllReduceAlg::Pscpu | AllReduceAlg::Psgpu | AllReduceAlg::PscpuPscpu
        )
    }
}

impl fmt::Display for AllReduceAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllReduceAlg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AllReduceAlg::ALL
            .into_iter()
            .find(|alg| alg.name() == s)
            .ok_or_else(|| Error::Config(format!("unsupported all_reduce alg: {s}")))
    }
}

/// One range of a parsed all-reduce spec. `limit < 0` means "all remaining gradients".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllReduceSpecTuple {
    pub alg: AllReduceAlg,
    pub shards: usize,
    pub limit: i64,
}

/// Parses a decimal integer with an optional `k`/`K`/`M`/`G`/`T` binary suffix.
///
/// Anything without a suffix may be negative; suffixed values may not.
pub fn parse_general_int(s: &str) -> Option<i64> {
    let multiplier: i64 = match s.chars().last()? {
        'k' | 'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        'T' => 1 << 40,
        _ => return s.parse().ok(),
    };
    let digits = &s[..s.len() - 1];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}

/// Parses `alg[#shards]:limit:...:alg[#shards]` into its ranges.
pub fn parse_all_reduce_spec(spec: &str) -> Result<Vec<AllReduceSpecTuple>> {
    let invalid = |reason: String| Error::InvalidAllReduceSpec {
        spec: spec.to_string(),
        reason,
    };
    let mut parts: Vec<&str> = spec.split(':').collect();
    parts.push("-1");
    if parts.len() % 2 != 0 {
        return Err(invalid("not well formed".into()));
    }

    let mut ranges = Vec::with_capacity(parts.len() / 2);
    for pair in parts.chunks(2) {
        let (alg_part, limit_part) = (pair[0], pair[1]);
        let (alg_name, shards) = match alg_part.split_once('#') {
            Some((name, shards)) => {
                let shards = shards
                    .parse::<usize>()
                    .map_err(|_| invalid(format!("contains non-integer shards {shards}")))?;
                (name, shards)
            }
            None => (alg_part, 1),
        };
        if shards == 0 {
            return Err(invalid(format!("contains zero shards in {alg_part}")));
        }
        let alg = alg_name
            .parse::<AllReduceAlg>()
            .map_err(|_| invalid(format!("contains invalid alg {alg_name}")))?;
        let limit = parse_general_int(limit_part)
            .ok_or_else(|| invalid(format!("contains non-integer range {limit_part}")))?;
        ranges.push(AllReduceSpecTuple { alg, shards, limit });
    }
    Ok(ranges)
}

/// One device prefix per task: `/job:<job>/task:<i>`, or `/job:localhost` for a single
/// in-process task.
pub fn build_all_reduce_device_prefixes(job_name: &str, num_tasks: usize) -> Result<Vec<DeviceSpec>> {
    if job_name == "localhost" {
        if num_tasks != 1 {
            return Err(Error::Config(format!(
                "job 'localhost' runs exactly one task, got num_tasks={num_tasks}"
            )));
        }
        return Ok(vec![DeviceSpec {
            job: Some(job_name.to_string()),
            ..DeviceSpec::default()
        }]);
    }
    Ok((0..num_tasks)
        .map(|task| DeviceSpec {
            job: Some(job_name.to_string()),
            task: Some(task),
            ..DeviceSpec::default()
        })
        .collect())
}

/// Deals `devices` round-robin into `ceil(n / group_size)` groups of exactly `group_size`,
/// wrapping around the device list when `group_size` does not divide `n`.
pub fn group_device_names(devices: &[DeviceSpec], group_size: usize) -> Result<Vec<Vec<DeviceSpec>>> {
    let num_devices = devices.len();
    if group_size == 0 {
        return Err(Error::Config("device group size must be positive".into()));
    }
    if group_size > num_devices {
        return Err(Error::Config(format!(
            "only {num_devices} devices, but group_size={group_size}"
        )));
    }
    let num_groups = num_devices.div_ceil(group_size);
    let mut groups = vec![Vec::with_capacity(group_size); num_groups];
    for i in 0..num_groups * group_size {
        groups[i % num_groups].push(devices[i % num_devices].clone());
    }
    Ok(groups)
}

/// Splits off the longest leading run of gradients whose total byte size is at most `limit`.
///
/// The split is the same for every replica and is decided on replica 0's sizes. A first
/// gradient larger than `limit` is still taken on its own, so every call makes progress.
/// A negative limit takes everything.
pub fn split_grads_by_size(
    graph: &Graph,
    limit: i64,
    device_grads: &[Vec<GradientEntry>],
) -> Result<(Vec<Vec<GradientEntry>>, Vec<Vec<GradientEntry>>)> {
    let num_params = check_alignment(graph, device_grads)?;
    let take = if limit < 0 {
        num_params
    } else {
        let limit = limit as usize;
        let mut total = 0;
        let mut take = 0;
        for entry in &device_grads[0] {
            let size = graph.byte_size(entry.grad)?;
            if take > 0 && total + size > limit {
                break;
            }
            total += size;
            take += 1;
        }
        take
    };
    let (this, rest) = device_grads
        .iter()
        .map(|row| (row[..take].to_vec(), row[take..].to_vec()))
        .unzip();
    Ok((this, rest))
}

/// Auxiliary devices the shuffle algorithms gather through.
fn aux_devices(alg: AllReduceAlg, dev_prefixes: &[DeviceSpec], gpu_indices: &[usize]) -> Vec<DeviceSpec> {
    match alg {
        AllReduceAlg::Pscpu | AllReduceAlg::NcclPscpu | AllReduceAlg::PscpuPscpu => dev_prefixes
            .iter()
            .map(|p| p.clone().with_device(DeviceType::Cpu, 0))
            .collect(),
        AllReduceAlg::Psgpu => (0..gpu_indices.len())
            .flat_map(|i| {
                dev_prefixes
                    .iter()
                    .map(move |p| p.clone().with_device(DeviceType::Gpu, i))
            })
            .collect(),
        _ => vec![DeviceSpec {
            job: Some("localhost".into()),
            ..DeviceSpec::cpu(0)
        }],
    }
}

fn sum_grad_and_var_all_reduce(
    graph: &mut Graph,
    grad_and_vars: &[GradientEntry],
    num_workers: usize,
    alg: AllReduceAlg,
    gpu_indices: &[usize],
    aux_devices: &[DeviceSpec],
    num_shards: usize,
) -> Result<Vec<GradientEntry>> {
    let grads: Vec<_> = grad_and_vars.iter().map(|e| e.grad).collect();
    let summed = match alg {
        AllReduceAlg::Nccl => build_nccl_all_reduce(graph, &grads)?,
        AllReduceAlg::Xring => {
            build_ring_all_reduce(graph, &grads, num_workers, num_shards, gpu_indices)?
        }
        AllReduceAlg::Rechd => build_recursive_hd_all_reduce(graph, &grads)?,
        AllReduceAlg::NcclXring => build_nccl_hybrid(graph, &grads, UpperLevel::Ring)?,
        AllReduceAlg::NcclRechd => build_nccl_hybrid(graph, &grads, UpperLevel::RecursiveHd)?,
        AllReduceAlg::NcclPscpu => build_nccl_hybrid(
            graph,
            &grads,
            UpperLevel::Shuffle {
                gather_devices: aux_devices,
            },
        )?,
        AllReduceAlg::PscpuPscpu => {
            let second = &aux_devices[..num_shards.min(aux_devices.len())];
            build_shuffle_hybrid(
                graph,
                &grads,
                aux_devices,
                UpperLevel::Shuffle {
                    gather_devices: second,
                },
            )?
        }
        AllReduceAlg::Pscpu | AllReduceAlg::Psgpu => {
            build_shuffle_all_reduce(graph, &grads, aux_devices)?
        }
    };
    Ok(summed
        .into_iter()
        .zip(grad_and_vars)
        .map(|(grad, entry)| GradientEntry { grad, var: entry.var })
        .collect())
}

/// Sums every parameter across all replicas with `alg`.
///
/// `device_grads` is the `[replica][parameter]` matrix over all workers. The result has the same
/// layout; every replica receives the full sum paired with its own variable. When both
/// `agg_small_grads_max_bytes` and `agg_small_grads_max_group` are positive, small gradients are
/// packed before the reduction and unpacked after it.
#[allow(clippy::too_many_arguments)]
pub fn sum_gradients_all_reduce(
    graph: &mut Graph,
    dev_prefixes: &[DeviceSpec],
    device_grads: &[Vec<GradientEntry>],
    num_workers: usize,
    alg: AllReduceAlg,
    num_shards: usize,
    gpu_indices: &[usize],
    agg_small_grads_max_bytes: usize,
    agg_small_grads_max_group: usize,
) -> Result<Vec<Vec<GradientEntry>>> {
    check_alignment(graph, device_grads)?;
    let aux = aux_devices(alg, dev_prefixes, gpu_indices);
    let group_size = if alg.uses_shuffle() { num_shards } else { 1 };
    let aux_groups = group_device_names(&aux, group_size)?;
    debug!(%alg, num_shards, aux_groups = aux_groups.len(), "building all-reduce");

    let (grads, packing) = if agg_small_grads_max_bytes > 0 && agg_small_grads_max_group > 0 {
        pack_small_tensors(graph, device_grads, agg_small_grads_max_bytes, agg_small_grads_max_group)?
    } else {
        (device_grads.to_vec(), None)
    };

    let num_params = grads[0].len();
    let mut reduced_columns = Vec::with_capacity(num_params);
    for i in 0..num_params {
        let group = if alg.is_hierarchical() {
            &aux
        } else {
            &aux_groups[i % aux_groups.len()]
        };
        reduced_columns.push(sum_grad_and_var_all_reduce(
            graph,
            &column(&grads, i),
            num_workers,
            alg,
            gpu_indices,
            group,
            num_shards,
        )?);
    }

    let transposed: Vec<Vec<GradientEntry>> = (0..grads.len())
        .map(|r| reduced_columns.iter().map(|col| col[r]).collect())
        .collect();
    unpack_small_tensors(graph, transposed, packing.as_ref())
}

/// Settings shared by every range of an all-reduce spec.
#[derive(Clone, Debug)]
pub struct AllReduceContext<'a> {
    pub dev_prefixes: &'a [DeviceSpec],
    pub num_workers: usize,
    pub gpu_indices: &'a [usize],
    pub agg_small_grads_max_bytes: usize,
    pub agg_small_grads_max_group: usize,
}

/// Reduces the gradient matrix range by range as described by `spec`.
///
/// Every replica row of the result lists the reduced gradients of the first range, then of the
/// second, and so on. Gradients left over after the last range are an error.
pub fn reduce_by_spec(
    graph: &mut Graph,
    spec: &[AllReduceSpecTuple],
    ctx: &AllReduceContext<'_>,
    device_grads: &[Vec<GradientEntry>],
) -> Result<Vec<Vec<GradientEntry>>> {
    if spec.is_empty() {
        return Err(Error::Config("all-reduce spec has no ranges".into()));
    }
    let num_params = check_alignment(graph, device_grads)?;
    let mut remaining = device_grads.to_vec();
    let mut aggregated: Vec<Vec<GradientEntry>> = vec![Vec::with_capacity(num_params); device_grads.len()];
    for range in spec {
        let (this_grads, rest) = split_grads_by_size(graph, range.limit, &remaining)?;
        remaining = rest;
        if this_grads[0].is_empty() {
            continue;
        }
        info!(
            alg = %range.alg,
            shards = range.shards,
            limit = range.limit,
            gradients = this_grads[0].len(),
            "all-reduce range"
        );
        let reduced = sum_gradients_all_reduce(
            graph,
            ctx.dev_prefixes,
            &this_grads,
            ctx.num_workers,
            range.alg,
            range.shards,
            ctx.gpu_indices,
            ctx.agg_small_grads_max_bytes,
            ctx.agg_small_grads_max_group,
        )?;
        for (row, part) in aggregated.iter_mut().zip(reduced) {
            row.extend(part);
        }
    }
    if !remaining[0].is_empty() {
        return Err(Error::Config(format!(
            "{} gradients left over after the last all-reduce range",
            remaining[0].len()
        )));
    }
    Ok(aggregated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_general_int() {
        assert_eq!(parse_general_int("32"), Some(32));
        assert_eq!(parse_general_int("32k"), Some(32 * 1024));
        assert_eq!(parse_general_int("32K"), Some(32 * 1024));
        assert_eq!(parse_general_int("2M"), Some(2 << 20));
        assert_eq!(parse_general_int("1G"), Some(1 << 30));
        assert_eq!(parse_general_int("1T"), Some(1 << 40));
        assert_eq!(parse_general_int("-1"), Some(-1));
        assert_eq!(parse_general_int("-1k"), None);
        assert_eq!(parse_general_int("abc"), None);
        assert_eq!(parse_general_int("K"), None);
    }

    #[test]
    fn test_parse_single_alg() {
        let spec = parse_all_reduce_spec("xring").unwrap();
        assert_eq!(
            spec,
            vec![AllReduceSpecTuple {
                alg: AllReduceAlg::Xring,
                shards: 1,
                limit: -1
            }]
        );
    }

    #[test]
    fn test_parse_ranges_and_shards() {
        let spec = parse_all_reduce_spec("pscpu#4:32k:nccl/xring#2").unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0].alg, AllReduceAlg::Pscpu);
        assert_eq!(spec[0].shards, 4);
        assert_eq!(spec[0].limit, 32 * 1024);
        assert_eq!(spec[1].alg, AllReduceAlg::NcclXring);
        assert_eq!(spec[1].shards, 2);
        assert_eq!(spec[1].limit, -1);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "xring:10", "ring", "xring#x", "xring:abc:nccl", "xring#0"] {
            assert!(
                matches!(parse_all_reduce_spec(bad), Err(Error::InvalidAllReduceSpec { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_device_prefixes() {
        let p = build_all_reduce_device_prefixes("worker", 2).unwrap();
        assert_eq!(p[1].to_string(), "/job:worker/task:1");
        let local = build_all_reduce_device_prefixes("localhost", 1).unwrap();
        assert_eq!(local[0].to_string(), "/job:localhost");
        assert!(build_all_reduce_device_prefixes("localhost", 2).is_err());
    }

    #[test]
    fn test_group_device_names() {
        let devices: Vec<_> = (0..5).map(DeviceSpec::gpu).collect();
        let groups = group_device_names(&devices, 2).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![DeviceSpec::gpu(0), DeviceSpec::gpu(3)]);
        assert_eq!(groups[1], vec![DeviceSpec::gpu(1), DeviceSpec::gpu(4)]);
        assert_eq!(groups[2], vec![DeviceSpec::gpu(2), DeviceSpec::gpu(0)]);
        assert!(group_device_names(&devices, 6).is_err());
    }

    fn matrix(g: &mut Graph, sizes: &[usize]) -> Vec<Vec<GradientEntry>> {
        (0..2)
            .map(|r| {
                sizes
                    .iter()
                    .map(|&n| GradientEntry::unbound(g.placeholder("g", &DeviceSpec::gpu(r), [n])))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_split_grads_by_size_is_positional() {
        let mut g = Graph::new();
        // 40, 40, 400, 4 bytes
        let m = matrix(&mut g, &[10, 10, 100, 1]);
        let (this, rest) = split_grads_by_size(&g, 100, &m).unwrap();
        assert_eq!(this[0].len(), 2);
        assert_eq!(rest[1].len(), 2);
        assert_eq!(this[1], m[1][..2].to_vec());

        // An oversized head is taken alone.
        let (this, rest) = split_grads_by_size(&g, 100, &rest).unwrap();
        assert_eq!(this[0].len(), 1);
        assert_eq!(rest[0].len(), 1);

        let (all, none) = split_grads_by_size(&g, -1, &m).unwrap();
        assert_eq!(all, m);
        assert!(none.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_aux_devices() {
        let prefixes = build_all_reduce_device_prefixes("worker", 2).unwrap();
        let cpu = aux_devices(AllReduceAlg::Pscpu, &prefixes, &[0, 1]);
        assert_eq!(cpu[1].to_string(), "/job:worker/task:1/device:CPU:0");
        let gpu = aux_devices(AllReduceAlg::Psgpu, &prefixes, &[0, 1]);
        assert_eq!(gpu.len(), 4);
        assert_eq!(gpu[1].to_string(), "/job:worker/task:1/device:GPU:0");
        let default = aux_devices(AllReduceAlg::Xring, &prefixes, &[0, 1]);
        assert_eq!(default[0].to_string(), "/job:localhost/device:CPU:0");
    }

    #[test]
    fn test_reduce_by_spec_concatenates_ranges() {
        let mut g = Graph::new();
        let m = matrix(&mut g, &[10, 10, 100]);
        let prefixes = build_all_reduce_device_prefixes("localhost", 1).unwrap();
        let spec = parse_all_reduce_spec("pscpu:80:xring").unwrap();
        let ctx = AllReduceContext {
            dev_prefixes: &prefixes,
            num_workers: 1,
            gpu_indices: &[0, 1],
            agg_small_grads_max_bytes: 0,
            agg_small_grads_max_group: 10,
        };
        let out = reduce_by_spec(&mut g, &spec, &ctx, &m).unwrap();
        for row in &out {
            let sizes: Vec<_> = row.iter().map(|e| g.num_elements(e.grad).unwrap()).collect();
            assert_eq!(sizes, vec![10, 10, 100]);
        }
    }
}
