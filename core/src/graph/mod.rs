//! The static computation graph this crate builds.
//!
//! # Why a graph?
//!
//! Variable managers do not move data. They decide *which* operations a training step consists
//! of and *where* each one runs; an external runtime schedules the result, running independent
//! replica subgraphs in parallel and respecting data and control dependencies.
//!
//! A [`Graph`] is therefore a plain arena of [`Node`]s:
//!
//! - every node has a [`DeviceSpec`], a static shape and dtype,
//! - **data inputs** carry tensors,
//! - **control inputs** only order execution ("run after"),
//!
//! plus a registry of named [`Variable`]s split into a global and a local collection.
//!
//! ```rust
//! use varmgr_rs::graph::Graph;
//! use varmgr_rs::tensor::DeviceSpec;
//!
//! let mut g = Graph::new();
//! let a = g.placeholder("a", &DeviceSpec::gpu(0), [2]);
//! let b = g.placeholder("b", &DeviceSpec::gpu(1), [2]);
//! let sum = g.add_n(&[a, b], &DeviceSpec::gpu(0)).unwrap();
//! assert!(g.depends_on(sum, b));
//! ```

use crate::error::{Error, Result};
use crate::tensor::{num_elements, DeviceSpec, Tensor};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub mod scope;

pub use scope::{
    replica_scope_name, BaseGetter, FixedPlacer, ParamRef, VarHandle, VariableInterceptor,
    VariablePlacer, VariableRequest, VariableScope,
};

/// Handle to a node of a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Handle to a variable registered in a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

impl VarId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Element type of a node's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    Bool,
    /// Operations with no output value (assignments, queue ops, groups).
    Unit,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Bool => 1,
            DType::Unit => 0,
        }
    }
}

/// Identifies one staging buffer: the cached copy of variable `name` on replica `replica`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StagingKey {
    pub replica: usize,
    pub name: String,
}

/// The operation performed by a node.
#[derive(Clone, Debug)]
pub enum OpKind {
    /// A value fed at run time (per-replica gradients in tests).
    Placeholder,
    Constant(Tensor<f32>),
    ReadVariable(VarId),
    /// Copy of the input onto the node's device.
    Identity,
    AddN,
    Scale(f32),
    /// Reshape to the node's static shape.
    Reshape,
    /// Rank-1 concatenation of the inputs, in order.
    Concat,
    /// Piece `index` of splitting the rank-1 input into `sizes`.
    Split { sizes: Vec<usize>, index: usize },
    /// True iff any element of any input is NaN or infinite.
    AnyNonFinite,
    /// Logical OR of boolean inputs.
    LogicalAny,
    /// Collective all-reduce primitive. Each member lists every participant's input so the
    /// dependency on all of them is explicit; `rank` is the member this node produces.
    CollectiveSum {
        group_key: String,
        rank: usize,
        group_size: usize,
    },
    Assign(VarId),
    ApplySgd {
        var: VarId,
        learning_rate: f32,
    },
    /// Write handle of a staging buffer.
    StagePut(StagingKey),
    /// Read handle of a staging buffer.
    StageGet(StagingKey),
    QueueEnqueue {
        shared_name: String,
        capacity: usize,
    },
    QueueDequeueMany {
        shared_name: String,
        capacity: usize,
        count: usize,
    },
    /// Runs `then_ops` only if the boolean input is false.
    SkipIf { then_ops: Vec<NodeId> },
    /// Groups control inputs.
    NoOp,
}

impl OpKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            OpKind::Placeholder => "Placeholder",
            OpKind::Constant(_) => "Const",
            OpKind::ReadVariable(_) => "ReadVariableOp",
            OpKind::Identity => "Identity",
            OpKind::AddN => "AddN",
            OpKind::Scale(_) => "Mul",
            OpKind::Reshape => "Reshape",
            OpKind::Concat => "ConcatV2",
            OpKind::Split { .. } => "SplitV",
            OpKind::AnyNonFinite => "AnyNonFinite",
            OpKind::LogicalAny => "Any",
            OpKind::CollectiveSum { .. } => "CollectiveReduce",
            OpKind::Assign(_) => "AssignVariableOp",
            OpKind::ApplySgd { .. } => "ResourceApplyGradientDescent",
            OpKind::StagePut(_) => "Stage",
            OpKind::StageGet(_) => "Unstage",
            OpKind::QueueEnqueue { .. } => "QueueEnqueueV2",
            OpKind::QueueDequeueMany { .. } => "QueueDequeueManyV2",
            OpKind::SkipIf { .. } => "If",
            OpKind::NoOp => "NoOp",
        }
    }
}

/// One operation of the graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    pub control_inputs: Vec<NodeId>,
    pub device: DeviceSpec,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Node {
    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }
}

/// Which variable collection a variable belongs to.
///
/// Global variables are shared by every worker of a cluster; local variables exist per worker
/// process (replica-owned copies in distributed-replicated training).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    Global,
    Local,
}

/// A persistent, named value.
#[derive(Clone, Debug)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub shape: Vec<usize>,
    pub device: DeviceSpec,
    pub trainable: bool,
    pub collection: Collection,
    pub initial_value: Tensor<f32>,
    /// Device that reads of this variable are served from, if not the variable's own device.
    pub caching_device: Option<DeviceSpec>,
}

impl Variable {
    /// The name of the variable's output tensor, `<name>:0`.
    pub fn output_name(&self) -> String {
        format!("{}:0", self.name)
    }

    pub fn byte_size(&self) -> usize {
        num_elements(&self.shape) * DType::F32.size_in_bytes()
    }
}

/// Arguments for [`Graph::create_variable`].
#[derive(Clone, Debug)]
pub struct VariableDef {
    pub name: String,
    pub device: DeviceSpec,
    pub initial_value: Tensor<f32>,
    pub trainable: bool,
    pub collection: Collection,
    pub caching_device: Option<DeviceSpec>,
}

/// Arena of nodes plus the variable registry.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    variables: Vec<Variable>,
    var_by_name: HashMap<String, VarId>,
    name_counts: HashMap<String, usize>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::Graph(format!("no such node {id}")))
    }

    pub fn shape(&self, id: NodeId) -> Result<&[usize]> {
        Ok(&self.node(id)?.shape)
    }

    pub fn device(&self, id: NodeId) -> Result<&DeviceSpec> {
        Ok(&self.node(id)?.device)
    }

    pub fn num_elements(&self, id: NodeId) -> Result<usize> {
        Ok(self.node(id)?.num_elements())
    }

    pub fn byte_size(&self, id: NodeId) -> Result<usize> {
        Ok(self.node(id)?.byte_size())
    }

    /// Returns a name not used by any earlier node: `base`, then `base_1`, `base_2`, ...
    pub fn unique_name(&mut self, base: &str) -> String {
        let count = self.name_counts.entry(base.to_string()).or_insert(0);
        let name = if *count == 0 {
            base.to_string()
        } else {
            format!("{base}_{count}")
        };
        *count += 1;
        name
    }

    fn check_ids(&self, ids: &[NodeId]) -> Result<()> {
        match ids.iter().find(|id| id.0 >= self.nodes.len()) {
            Some(bad) => Err(Error::Graph(format!("no such node {bad}"))),
            None => Ok(()),
        }
    }

    /// Appends a node. All other builders go through here.
    #[allow(clippy::too_many_arguments)]
    pub fn add_node(
        &mut self,
        name: &str,
        op: OpKind,
        inputs: Vec<NodeId>,
        control_inputs: Vec<NodeId>,
        device: &DeviceSpec,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<NodeId> {
        self.check_ids(&inputs)?;
        self.check_ids(&control_inputs)?;
        let id = NodeId(self.nodes.len());
        let name = self.unique_name(name);
        self.nodes.push(Node {
            id,
            name,
            op,
            inputs,
            control_inputs,
            device: device.clone(),
            shape,
            dtype,
        });
        Ok(id)
    }

    /// Adds `deps` as control inputs of an existing node.
    pub fn add_control_inputs(&mut self, id: NodeId, deps: &[NodeId]) -> Result<()> {
        self.check_ids(deps)?;
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| Error::Graph(format!("no such node {id}")))?;
        for &d in deps {
            if !node.control_inputs.contains(&d) {
                node.control_inputs.push(d);
            }
        }
        Ok(())
    }

    pub fn placeholder(
        &mut self,
        name: &str,
        device: &DeviceSpec,
        shape: impl Into<Vec<usize>>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = self.unique_name(name);
        self.nodes.push(Node {
            id,
            name,
            op: OpKind::Placeholder,
            inputs: Vec::new(),
            control_inputs: Vec::new(),
            device: device.clone(),
            shape: shape.into(),
            dtype: DType::F32,
        });
        id
    }

    pub fn constant(&mut self, name: &str, value: Tensor<f32>, device: &DeviceSpec) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = self.unique_name(name);
        let shape = value.shape().to_vec();
        self.nodes.push(Node {
            id,
            name,
            op: OpKind::Constant(value),
            inputs: Vec::new(),
            control_inputs: Vec::new(),
            device: device.clone(),
            shape,
            dtype: DType::F32,
        });
        id
    }

    /// Copies `input` onto `device`.
    pub fn identity(&mut self, input: NodeId, device: &DeviceSpec) -> Result<NodeId> {
        let (shape, dtype) = {
            let n = self.node(input)?;
            (n.shape.clone(), n.dtype)
        };
        self.add_node("Identity", OpKind::Identity, vec![input], vec![], device, shape, dtype)
    }

    /// Element-wise sum of tensors with identical shapes.
    pub fn add_n(&mut self, inputs: &[NodeId], device: &DeviceSpec) -> Result<NodeId> {
        let first = *inputs
            .first()
            .ok_or_else(|| Error::Graph("AddN needs at least one input".into()))?;
        let shape = self.shape(first)?.to_vec();
        for &i in inputs {
            if self.shape(i)? != shape.as_slice() {
                return Err(Error::Graph(format!(
                    "AddN shape mismatch: {:?} vs {:?}",
                    shape,
                    self.shape(i)?
                )));
            }
        }
        self.add_node("AddN", OpKind::AddN, inputs.to_vec(), vec![], device, shape, DType::F32)
    }

    pub fn scale(&mut self, input: NodeId, factor: f32, device: &DeviceSpec) -> Result<NodeId> {
        let shape = self.shape(input)?.to_vec();
        self.add_node("mul", OpKind::Scale(factor), vec![input], vec![], device, shape, DType::F32)
    }

    pub fn reshape(
        &mut self,
        input: NodeId,
        shape: impl Into<Vec<usize>>,
        device: &DeviceSpec,
    ) -> Result<NodeId> {
        let shape = shape.into();
        let have = self.num_elements(input)?;
        if num_elements(&shape) != have {
            return Err(Error::Graph(format!(
                "cannot reshape {have} elements into {shape:?}"
            )));
        }
        self.add_node("Reshape", OpKind::Reshape, vec![input], vec![], device, shape, DType::F32)
    }

    /// Flattens `input` to rank 1.
    pub fn flatten(&mut self, input: NodeId, device: &DeviceSpec) -> Result<NodeId> {
        let n = self.num_elements(input)?;
        self.reshape(input, [n], device)
    }

    /// Rank-1 concatenation.
    pub fn concat(&mut self, inputs: &[NodeId], device: &DeviceSpec) -> Result<NodeId> {
        if inputs.is_empty() {
            return Err(Error::Graph("Concat needs at least one input".into()));
        }
        let mut total = 0;
        for &i in inputs {
            let shape = self.shape(i)?;
            if shape.len() != 1 {
                return Err(Error::Graph(format!("Concat input must be rank 1, got {shape:?}")));
            }
            total += shape[0];
        }
        self.add_node("concat", OpKind::Concat, inputs.to_vec(), vec![], device, vec![total], DType::F32)
    }

    /// Splits a rank-1 tensor into consecutive pieces of `sizes` elements.
    pub fn split(
        &mut self,
        input: NodeId,
        sizes: &[usize],
        device: &DeviceSpec,
    ) -> Result<Vec<NodeId>> {
        let shape = self.shape(input)?;
        let total: usize = sizes.iter().sum();
        if shape.len() != 1 || shape[0] != total {
            return Err(Error::Graph(format!(
                "cannot split tensor of shape {shape:?} into {sizes:?}"
            )));
        }
        sizes
            .iter()
            .enumerate()
            .map(|(index, &size)| {
                self.add_node(
                    "split",
                    OpKind::Split {
                        sizes: sizes.to_vec(),
                        index,
                    },
                    vec![input],
                    vec![],
                    device,
                    vec![size],
                    DType::F32,
                )
            })
            .collect()
    }

    /// Boolean scalar, true iff any input contains a NaN or an infinity.
    pub fn any_non_finite(&mut self, inputs: &[NodeId], device: &DeviceSpec) -> Result<NodeId> {
        if inputs.is_empty() {
            return Err(Error::Graph("AnyNonFinite needs at least one input".into()));
        }
        self.add_node("has_inf_nan", OpKind::AnyNonFinite, inputs.to_vec(), vec![], device, vec![], DType::Bool)
    }

    /// Logical OR of boolean scalars.
    pub fn logical_any(&mut self, flags: &[NodeId], device: &DeviceSpec) -> Result<NodeId> {
        for &f in flags {
            if self.node(f)?.dtype != DType::Bool {
                return Err(Error::Graph(format!("LogicalAny input {f} is not boolean")));
            }
        }
        self.add_node("reduce_any", OpKind::LogicalAny, flags.to_vec(), vec![], device, vec![], DType::Bool)
    }

    pub fn read_variable(&mut self, var: VarId, device: &DeviceSpec) -> Result<NodeId> {
        let v = self.variable(var)?;
        let name = format!("{}/read", v.name);
        let shape = v.shape.clone();
        self.add_node(&name, OpKind::ReadVariable(var), vec![], vec![], device, shape, DType::F32)
    }

    /// Assigns `value` to `var`. Runs on the variable's device.
    pub fn assign(&mut self, var: VarId, value: NodeId) -> Result<NodeId> {
        let (name, device, shape) = {
            let v = self.variable(var)?;
            (format!("{}/Assign", v.name), v.device.clone(), v.shape.clone())
        };
        if self.shape(value)? != shape.as_slice() {
            return Err(Error::Graph(format!(
                "cannot assign {:?} to variable of shape {:?}",
                self.shape(value)?,
                shape
            )));
        }
        self.add_node(&name, OpKind::Assign(var), vec![value], vec![], &device, vec![], DType::Unit)
    }

    /// A no-op that completes once every op in `deps` has.
    pub fn group(&mut self, name: &str, deps: &[NodeId], device: &DeviceSpec) -> Result<NodeId> {
        self.add_node(name, OpKind::NoOp, vec![], deps.to_vec(), device, vec![], DType::Unit)
    }

    pub fn create_variable(&mut self, def: VariableDef) -> Result<VarId> {
        if self.var_by_name.contains_key(&def.name) {
            return Err(Error::DuplicateVariable(def.name));
        }
        let id = VarId(self.variables.len());
        self.var_by_name.insert(def.name.clone(), id);
        self.variables.push(Variable {
            id,
            name: def.name,
            shape: def.initial_value.shape().to_vec(),
            device: def.device,
            trainable: def.trainable,
            collection: def.collection,
            initial_value: def.initial_value,
            caching_device: def.caching_device,
        });
        Ok(id)
    }

    pub fn variable(&self, id: VarId) -> Result<&Variable> {
        self.variables
            .get(id.0)
            .ok_or_else(|| Error::Graph(format!("no such variable #{}", id.0)))
    }

    pub fn variable_by_name(&self, name: &str) -> Option<VarId> {
        self.var_by_name.get(name).copied()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn global_variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables
            .iter()
            .filter(|v| v.collection == Collection::Global)
    }

    pub fn local_variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables
            .iter()
            .filter(|v| v.collection == Collection::Local)
    }

    pub fn trainable_variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| v.trainable)
    }

    /// True if `node` (transitively) depends on `ancestor` through data or control inputs.
    pub fn depends_on(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let Some(n) = self.nodes.get(id.0) else {
                continue;
            };
            for &p in n.inputs.iter().chain(&n.control_inputs) {
                if p == ancestor {
                    return true;
                }
                if seen.insert(p) {
                    stack.push(p);
                }
            }
            if let OpKind::SkipIf { then_ops } = &n.op {
                for &p in then_ops {
                    if p == ancestor {
                        return true;
                    }
                    if seen.insert(p) {
                        stack.push(p);
                    }
                }
            }
        }
        false
    }

    /// Ids of all nodes whose op matches `pred`.
    pub fn find_nodes(&self, pred: impl Fn(&OpKind) -> bool) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| pred(&n.op))
            .map(|n| n.id)
            .collect()
    }
}
