//! A reference executor for [`Graph`]s.
//!
//! The placement layer only *builds* graphs; a real deployment hands them to a device runtime.
//! [`Session`] is the smallest runtime that gives those graphs meaning on one host:
//!
//! - every node is evaluated on the CPU regardless of its device tag,
//! - each [`Session::run`] is one step: every node reachable from the targets runs at most once,
//! - staging buffers are emptied at the start of a step, so a staged read sees the value the
//!   variable had when its `StagePut` ran in the same step,
//! - variables on the parameter-server job and barrier queues live in a [`ClusterResources`]
//!   that several worker sessions (one per thread) can share.
//!
//! ```rust
//! use std::collections::HashMap;
//! use varmgr_rs::graph::Graph;
//! use varmgr_rs::runtime::Session;
//! use varmgr_rs::tensor::{DeviceSpec, Tensor};
//!
//! let mut g = Graph::new();
//! let a = g.placeholder("a", &DeviceSpec::gpu(0), [2]);
//! let b = g.placeholder("b", &DeviceSpec::gpu(1), [2]);
//! let sum = g.add_n(&[a, b], &DeviceSpec::gpu(0)).unwrap();
//!
//! let mut sess = Session::new(&g);
//! let feeds = HashMap::from([
//!     (a, Tensor::full([2], 1.0)),
//!     (b, Tensor::full([2], 2.0)),
//! ]);
//! let out = sess.run(&[sum], &feeds).unwrap();
//! assert_eq!(out[0].as_tensor().unwrap().data(), &[3.0, 3.0]);
//! ```

use crate::error::{Error, Result};
use crate::graph::{Graph, Node, NodeId, OpKind, StagingKey, VarId};
use crate::optim::sgd::sgd_update;
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub mod resources;

pub use resources::ClusterResources;

/// Output of a node.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Tensor(Tensor<f32>),
    Flag(bool),
    Unit,
}

impl Value {
    pub fn as_tensor(&self) -> Result<&Tensor<f32>> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(Error::Runtime(format!("expected a tensor, got {other:?}"))),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor<f32>> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(Error::Runtime(format!("expected a tensor, got {other:?}"))),
        }
    }

    pub fn as_flag(&self) -> Result<bool> {
        match self {
            Value::Flag(b) => Ok(*b),
            other => Err(Error::Runtime(format!("expected a flag, got {other:?}"))),
        }
    }
}

/// Counters for the last step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub nodes_executed: usize,
    pub variable_reads: usize,
    /// Reads whose node is not on the variable's device.
    pub remote_variable_reads: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Pending,
}

pub struct Session<'g> {
    graph: &'g Graph,
    local: HashMap<VarId, Tensor<f32>>,
    resources: Arc<ClusterResources>,
    staging: HashMap<StagingKey, Tensor<f32>>,
    stats: RunStats,
}

impl<'g> Session<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self::with_resources(graph, Arc::new(ClusterResources::new()))
    }

    /// A session for one worker of a cluster whose shared state is `resources`.
    pub fn with_resources(graph: &'g Graph, resources: Arc<ClusterResources>) -> Self {
        Self {
            graph,
            local: HashMap::new(),
            resources,
            staging: HashMap::new(),
            stats: RunStats::default(),
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Sets every variable to its initial value. Shared variables are only initialized by the
    /// first worker that gets here.
    pub fn initialize(&mut self) -> Result<()> {
        for var in self.graph.variables() {
            if ClusterResources::is_shared(var) {
                self.resources.init_variable(&var.name, &var.initial_value)?;
            } else {
                self.local.insert(var.id, var.initial_value.clone());
            }
        }
        debug!(variables = self.graph.variables().len(), "session initialized");
        Ok(())
    }

    pub fn last_run_stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn variable_value(&self, var: VarId) -> Result<Tensor<f32>> {
        let v = self.graph.variable(var)?;
        if ClusterResources::is_shared(v) {
            self.resources.read_variable(&v.name)
        } else {
            self.local
                .get(&var)
                .cloned()
                .ok_or_else(|| Error::Runtime(format!("variable {} is not initialized", v.name)))
        }
    }

    pub fn variable_value_by_name(&self, name: &str) -> Result<Tensor<f32>> {
        let var = self
            .graph
            .variable_by_name(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        self.variable_value(var)
    }

    pub fn assign_variable(&mut self, var: VarId, value: Tensor<f32>) -> Result<()> {
        let graph = self.graph;
        let v = graph.variable(var)?;
        if value.shape() != v.shape.as_slice() {
            return Err(Error::Runtime(format!(
                "cannot assign {:?} to {} of shape {:?}",
                value.shape(),
                v.name,
                v.shape
            )));
        }
        if ClusterResources::is_shared(v) {
            self.resources.assign_variable(&v.name, value)
        } else {
            self.local.insert(var, value);
            Ok(())
        }
    }

    /// Runs one step and returns the values of `targets`, in order.
    pub fn run(
        &mut self,
        targets: &[NodeId],
        feeds: &HashMap<NodeId, Tensor<f32>>,
    ) -> Result<Vec<Value>> {
        self.staging.clear();
        self.stats = RunStats::default();
        let mut memo: Vec<Option<Value>> = vec![None; self.graph.len()];
        for &t in targets {
            self.ensure(t, &mut memo, feeds)?;
        }
        targets
            .iter()
            .map(|t| {
                memo.get(t.0)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| Error::Runtime(format!("{t} produced no value")))
            })
            .collect()
    }

    /// Evaluates `root` and everything it depends on, post-order.
    fn ensure(
        &mut self,
        root: NodeId,
        memo: &mut Vec<Option<Value>>,
        feeds: &HashMap<NodeId, Tensor<f32>>,
    ) -> Result<()> {
        let graph = self.graph;
        let mut visit = vec![Visit::New; graph.len()];
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            let node = graph.node(id)?;
            if memo[id.0].is_some() {
                continue;
            }
            if expanded {
                let value = self.execute(node, memo, feeds)?;
                memo[id.0] = Some(value);
                continue;
            }
            if visit[id.0] == Visit::Pending {
                return Err(Error::Runtime(format!("cycle through {}", node.name)));
            }
            visit[id.0] = Visit::Pending;
            stack.push((id, true));
            // Reversed so that control inputs run in the order they were added.
            for &dep in node.control_inputs.iter().rev().chain(node.inputs.iter().rev()) {
                if memo[dep.0].is_none() {
                    stack.push((dep, false));
                }
            }
        }
        Ok(())
    }

    fn read_var(&self, var: VarId) -> Result<Tensor<f32>> {
        self.variable_value(var)
    }

    fn execute(
        &mut self,
        node: &'g Node,
        memo: &mut Vec<Option<Value>>,
        feeds: &HashMap<NodeId, Tensor<f32>>,
    ) -> Result<Value> {
        self.stats.nodes_executed += 1;
        let value = match &node.op {
            OpKind::Placeholder => Value::Tensor(
                feeds
                    .get(&node.id)
                    .cloned()
                    .ok_or_else(|| Error::Runtime(format!("placeholder {} was not fed", node.name)))?,
            ),
            OpKind::Constant(t) => Value::Tensor(t.clone()),
            OpKind::ReadVariable(var) => {
                self.stats.variable_reads += 1;
                if self.graph.variable(*var)?.device != node.device {
                    self.stats.remote_variable_reads += 1;
                }
                Value::Tensor(self.read_var(*var)?)
            }
            OpKind::Identity => input(memo, node, 0)?.clone(),
            OpKind::AddN | OpKind::CollectiveSum { .. } => {
                let ts = input_tensors(memo, node)?;
                Value::Tensor(Tensor::add_n(&ts)?)
            }
            OpKind::Scale(factor) => Value::Tensor(input(memo, node, 0)?.as_tensor()?.scale(*factor)),
            OpKind::Reshape => Value::Tensor(
                input(memo, node, 0)?
                    .as_tensor()?
                    .clone()
                    .reshape(node.shape.clone())?,
            ),
            OpKind::Concat => Value::Tensor(Tensor::concat(&input_tensors(memo, node)?)),
            OpKind::Split { sizes, index } => {
                let piece = input(memo, node, 0)?
                    .as_tensor()?
                    .split(sizes)?
                    .into_iter()
                    .nth(*index)
                    .ok_or_else(|| Error::Runtime(format!("{}: split index {index} out of range", node.name)))?;
                Value::Tensor(piece)
            }
            OpKind::AnyNonFinite => {
                let ts = input_tensors(memo, node)?;
                Value::Flag(ts.par_iter().any(|t| !t.all_finite()))
            }
            OpKind::LogicalAny => {
                let mut any = false;
                for i in 0..node.inputs.len() {
                    any |= input(memo, node, i)?.as_flag()?;
                }
                Value::Flag(any)
            }
            OpKind::Assign(var) => {
                let value = input(memo, node, 0)?.as_tensor()?.clone();
                self.assign_variable(*var, value)?;
                Value::Unit
            }
            OpKind::ApplySgd { var, learning_rate } => {
                let grad = input(memo, node, 0)?.as_tensor()?;
                self.apply_sgd(*var, *learning_rate, grad)?;
                Value::Unit
            }
            OpKind::StagePut(key) => {
                let value = input(memo, node, 0)?.as_tensor()?.clone();
                self.staging.insert(key.clone(), value);
                Value::Unit
            }
            OpKind::StageGet(key) => Value::Tensor(self.staging.get(key).cloned().ok_or_else(|| {
                Error::Runtime(format!(
                    "staging area for replica {} / {} is empty",
                    key.replica, key.name
                ))
            })?),
            OpKind::QueueEnqueue {
                shared_name,
                capacity,
            } => {
                self.resources.enqueue(shared_name, *capacity, false)?;
                Value::Unit
            }
            OpKind::QueueDequeueMany {
                shared_name,
                capacity,
                count,
            } => {
                self.resources.dequeue_many(shared_name, *capacity, *count)?;
                Value::Unit
            }
            OpKind::SkipIf { then_ops } => {
                if !input(memo, node, 0)?.as_flag()? {
                    for &op in then_ops {
                        self.ensure(op, memo, feeds)?;
                    }
                }
                Value::Unit
            }
            OpKind::NoOp => Value::Unit,
        };
        Ok(value)
    }

    fn apply_sgd(&mut self, var: VarId, learning_rate: f32, grad: &Tensor<f32>) -> Result<()> {
        let graph = self.graph;
        let v = graph.variable(var)?;
        if ClusterResources::is_shared(v) {
            self.resources
                .update_variable(&v.name, |p| Ok(sgd_update(p, grad, learning_rate)?))
        } else {
            let p = self
                .local
                .get_mut(&var)
                .ok_or_else(|| Error::Runtime(format!("variable {} is not initialized", v.name)))?;
            Ok(sgd_update(p, grad, learning_rate)?)
        }
    }
}

fn input<'m>(memo: &'m [Option<Value>], node: &Node, i: usize) -> Result<&'m Value> {
    let id = node
        .inputs
        .get(i)
        .ok_or_else(|| Error::Runtime(format!("{} is missing input {i}", node.name)))?;
    memo[id.0]
        .as_ref()
        .ok_or_else(|| Error::Runtime(format!("input {id} of {} was not evaluated", node.name)))
}

fn input_tensors<'m>(memo: &'m [Option<Value>], node: &Node) -> Result<Vec<&'m Tensor<f32>>> {
    (0..node.inputs.len())
        .map(|i| input(memo, node, i)?.as_tensor())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Collection, VariableDef};
    use crate::tensor::DeviceSpec;

    fn var(g: &mut Graph, name: &str, value: Tensor<f32>, device: DeviceSpec) -> VarId {
        g.create_variable(VariableDef {
            name: name.into(),
            device,
            initial_value: value,
            trainable: true,
            collection: Collection::Global,
            caching_device: None,
        })
        .unwrap()
    }

    #[test]
    fn test_split_concat_reshape() {
        let mut g = Graph::new();
        let d = DeviceSpec::cpu(0);
        let c = g.constant("c", Tensor::new((0..6).map(|x| x as f32).collect(), [2, 3]).unwrap(), &d);
        let flat = g.flatten(c, &d).unwrap();
        let parts = g.split(flat, &[4, 2], &d).unwrap();
        let swapped = g.concat(&[parts[1], parts[0]], &d).unwrap();
        let back = g.reshape(swapped, [3, 2], &d).unwrap();

        let mut sess = Session::new(&g);
        let out = sess.run(&[back], &HashMap::new()).unwrap();
        let t = out[0].as_tensor().unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), &[4.0, 5.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_missing_feed_is_an_error() {
        let mut g = Graph::new();
        let p = g.placeholder("p", &DeviceSpec::cpu(0), [1]);
        let mut sess = Session::new(&g);
        assert!(matches!(sess.run(&[p], &HashMap::new()), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_assign_and_read() {
        let mut g = Graph::new();
        let d = DeviceSpec::gpu(0);
        let w = var(&mut g, "w", Tensor::zeros([2]), d.clone());
        let c = g.constant("c", Tensor::full([2], 7.0), &d);
        let assign = g.assign(w, c).unwrap();

        let mut sess = Session::new(&g);
        sess.initialize().unwrap();
        sess.run(&[assign], &HashMap::new()).unwrap();
        assert_eq!(sess.variable_value(w).unwrap().data(), &[7.0, 7.0]);
    }

    #[test]
    fn test_each_node_runs_once_per_step() {
        let mut g = Graph::new();
        let d = DeviceSpec::gpu(0);
        let w = var(&mut g, "w", Tensor::full([1], 1.0), d.clone());
        let read = g.read_variable(w, &DeviceSpec::gpu(1)).unwrap();
        let a = g.identity(read, &d).unwrap();
        let b = g.identity(read, &d).unwrap();
        let sum = g.add_n(&[a, b], &d).unwrap();

        let mut sess = Session::new(&g);
        sess.initialize().unwrap();
        let out = sess.run(&[sum], &HashMap::new()).unwrap();
        assert_eq!(out[0].as_tensor().unwrap().data(), &[2.0]);
        assert_eq!(sess.last_run_stats().variable_reads, 1);
        assert_eq!(sess.last_run_stats().remote_variable_reads, 1);
    }

    #[test]
    fn test_skip_if_gates_updates() {
        let mut g = Graph::new();
        let d = DeviceSpec::cpu(0);
        let w = var(&mut g, "w", Tensor::full([1], 1.0), d.clone());
        let grad = g.placeholder("g", &d, [1]);
        let flag = g.any_non_finite(&[grad], &d).unwrap();
        let apply = g
            .add_node(
                "apply",
                OpKind::ApplySgd {
                    var: w,
                    learning_rate: 1.0,
                },
                vec![grad],
                vec![],
                &d,
                vec![],
                crate::graph::DType::Unit,
            )
            .unwrap();
        let gated = g
            .add_node(
                "cond",
                OpKind::SkipIf {
                    then_ops: vec![apply],
                },
                vec![flag],
                vec![],
                &d,
                vec![],
                crate::graph::DType::Unit,
            )
            .unwrap();

        let mut sess = Session::new(&g);
        sess.initialize().unwrap();
        let bad = HashMap::from([(grad, Tensor::full([1], f32::NAN))]);
        sess.run(&[gated], &bad).unwrap();
        assert_eq!(sess.variable_value(w).unwrap().data(), &[1.0]);

        let good = HashMap::from([(grad, Tensor::full([1], 0.5))]);
        sess.run(&[gated], &good).unwrap();
        assert_eq!(sess.variable_value(w).unwrap().data(), &[0.5]);
    }

    #[test]
    fn test_shared_variables_between_sessions() {
        let resources = Arc::new(ClusterResources::new());
        let ps = DeviceSpec::task("ps", 0).with_device(crate::tensor::DeviceType::Cpu, 0);

        let mut g0 = Graph::new();
        let w0 = var(&mut g0, "w", Tensor::full([1], 1.0), ps.clone());
        let c0 = g0.constant("c", Tensor::full([1], 3.0), &ps);
        let assign = g0.assign(w0, c0).unwrap();

        let mut g1 = Graph::new();
        let w1 = var(&mut g1, "w", Tensor::full([1], 9.0), ps);

        let mut s0 = Session::with_resources(&g0, resources.clone());
        let mut s1 = Session::with_resources(&g1, resources);
        s0.initialize().unwrap();
        s1.initialize().unwrap();
        assert_eq!(s1.variable_value(w1).unwrap().data(), &[1.0]);

        s0.run(&[assign], &HashMap::new()).unwrap();
        assert_eq!(s1.variable_value(w1).unwrap().data(), &[3.0]);
    }
}
