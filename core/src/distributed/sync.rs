//! Cross-worker barriers built from shared FIFO queues.
//!
//! A barrier named `p` owns one queue per worker, `p0 .. p(W-1)`, all with the same shared
//! names on every worker. When worker `t` passes the barrier it puts a token into every other
//! worker's queue and then takes `W - 1` tokens out of its own: it can only leave once every
//! other worker has arrived.
//!
//! Barriers are placed on the sync-queue devices round-robin so that many barriers (one per
//! parameter in distributed replicated mode) spread over the parameter servers.

use crate::error::{Error, Result};
use crate::graph::{DType, Graph, NodeId, OpKind};
use crate::tensor::DeviceSpec;

#[derive(Clone, Debug)]
pub struct SyncQueues {
    devices: Vec<DeviceSpec>,
    counter: usize,
    num_workers: usize,
    task_index: usize,
}

impl SyncQueues {
    pub fn new(devices: Vec<DeviceSpec>, num_workers: usize, task_index: usize) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Config("barriers need at least one sync queue device".into()));
        }
        if task_index >= num_workers {
            return Err(Error::Config(format!(
                "task_index {task_index} is out of range for {num_workers} workers"
            )));
        }
        Ok(Self {
            devices,
            counter: 0,
            num_workers,
            task_index,
        })
    }

    /// Number of barriers built so far.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Builds a barrier that completes once every op in `enqueue_after` has run on this
    /// worker and every other worker has reached the barrier with the same `name_prefix`.
    pub fn add_sync_queues_and_barrier(
        &mut self,
        graph: &mut Graph,
        name_prefix: &str,
        enqueue_after: &[NodeId],
    ) -> Result<NodeId> {
        let device = self.devices[self.counter % self.devices.len()].clone();
        self.counter += 1;

        let capacity = self.num_workers;
        let mut queue_ops = Vec::with_capacity(self.num_workers + 1);
        for i in 0..self.num_workers {
            let op = if i == self.task_index {
                graph.add_node("NoOp", OpKind::NoOp, vec![], enqueue_after.to_vec(), &device, vec![], DType::Unit)?
            } else {
                graph.add_node(
                    &format!("{name_prefix}{i}/enqueue"),
                    OpKind::QueueEnqueue {
                        shared_name: format!("{name_prefix}{i}"),
                        capacity,
                    },
                    vec![],
                    enqueue_after.to_vec(),
                    &device,
                    vec![],
                    DType::Unit,
                )?
            };
            queue_ops.push(op);
        }
        let own = format!("{name_prefix}{}", self.task_index);
        queue_ops.push(graph.add_node(
            &format!("{own}/dequeue_many"),
            OpKind::QueueDequeueMany {
                shared_name: own.clone(),
                capacity,
                count: self.num_workers - 1,
            },
            vec![],
            vec![],
            &device,
            vec![],
            DType::Unit,
        )?);
        graph.group(name_prefix, &queue_ops, &device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ClusterResources, Session};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ps_devices(n: usize) -> Vec<DeviceSpec> {
        (0..n)
            .map(|i| format!("/job:ps/task:{i}/cpu:0").parse().unwrap())
            .collect()
    }

    #[test]
    fn test_barrier_structure() {
        let mut g = Graph::new();
        let before = g.group("apply", &[], &DeviceSpec::cpu(0)).unwrap();
        let mut sync = SyncQueues::new(ps_devices(2), 3, 1).unwrap();
        let barrier = sync.add_sync_queues_and_barrier(&mut g, "replicate_variable_0", &[before]).unwrap();
        assert!(g.depends_on(barrier, before));

        let enqueues = g.find_nodes(|op| matches!(op, OpKind::QueueEnqueue { .. }));
        let names: Vec<_> = enqueues
            .iter()
            .map(|&id| match &g.node(id).unwrap().op {
                OpKind::QueueEnqueue { shared_name, .. } => shared_name.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["replicate_variable_00", "replicate_variable_02"]);
        assert_eq!(g.device(barrier).unwrap(), &ps_devices(2)[0]);

        let second = sync.add_sync_queues_and_barrier(&mut g, "replicate_variable_1", &[]).unwrap();
        assert_eq!(g.device(second).unwrap(), &ps_devices(2)[1]);
        assert_eq!(sync.counter(), 2);
    }

    #[test]
    fn test_single_worker_barrier_passes() {
        let mut g = Graph::new();
        let mut sync = SyncQueues::new(ps_devices(1), 1, 0).unwrap();
        let barrier = sync.add_sync_queues_and_barrier(&mut g, "sync", &[]).unwrap();
        let mut sess = Session::with_resources(&g, Arc::new(ClusterResources::new()));
        sess.run(&[barrier], &HashMap::new()).unwrap();
    }

    #[test]
    fn test_rejects_bad_task_index() {
        assert!(SyncQueues::new(ps_devices(1), 2, 2).is_err());
        assert!(SyncQueues::new(vec![], 2, 0).is_err());
    }
}
