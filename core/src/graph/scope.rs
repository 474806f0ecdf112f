//! Replica variable scopes.
//!
//! Model-construction code never creates variables directly. It asks the [`VariableScope`] it
//! was handed for each replica, and the scope decides:
//!
//! - the full name (`replica-<n>/<name>` for replica-owned storage, `<name>` for shared storage),
//! - whether the variable is created or reused (shared scopes reuse from replica 1 on),
//! - the device, through a [`VariablePlacer`],
//! - what a read looks like, through an optional [`VariableInterceptor`].
//!
//! The interceptor is an explicit object owned by the scope, so each placement strategy plugs in
//! its own creation policy (staging, caching devices, collection overrides) without any global
//! state.

use super::{Collection, Graph, NodeId, VarId, VariableDef};
use crate::error::{Error, Result};
use crate::tensor::{DeviceSpec, Tensor};

/// What the model asks for.
#[derive(Clone, Debug)]
pub struct VariableRequest {
    /// Name relative to the scope.
    pub name: String,
    pub initial_value: Tensor<f32>,
    pub trainable: bool,
    /// `None` means the global collection.
    pub collection: Option<Collection>,
    /// Explicit device; skips the placer.
    pub device: Option<DeviceSpec>,
    pub caching_device: Option<DeviceSpec>,
}

impl VariableRequest {
    pub fn new(name: impl Into<String>, initial_value: Tensor<f32>) -> Self {
        Self {
            name: name.into(),
            initial_value,
            trainable: true,
            collection: None,
            device: None,
            caching_device: None,
        }
    }

    /// Non-trainable state such as batch-norm moving averages.
    pub fn non_trainable(mut self) -> Self {
        self.trainable = false;
        self
    }

    pub fn on_device(mut self, device: DeviceSpec) -> Self {
        self.device = Some(device);
        self
    }

    pub fn byte_size(&self) -> usize {
        self.initial_value.numel() * 4
    }
}

/// A variable together with the node the replica should read it through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarHandle {
    pub var: VarId,
    pub value: NodeId,
}

/// A trainable parameter as seen from one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamRef {
    /// The variable itself, writable.
    Variable(VarId),
    /// A staged read of the variable on the replica's device.
    Staged { var: VarId, read: NodeId },
}

impl ParamRef {
    pub fn var(&self) -> VarId {
        match *self {
            ParamRef::Variable(var) | ParamRef::Staged { var, .. } => var,
        }
    }
}

/// Chooses the device for a new variable.
pub trait VariablePlacer {
    fn place(&mut self, graph: &Graph, full_name: &str, request: &VariableRequest) -> DeviceSpec;
}

impl<P: VariablePlacer + ?Sized> VariablePlacer for &mut P {
    fn place(&mut self, graph: &Graph, full_name: &str, request: &VariableRequest) -> DeviceSpec {
        (**self).place(graph, full_name, request)
    }
}

/// Places every variable on one device.
#[derive(Clone, Debug)]
pub struct FixedPlacer(pub DeviceSpec);

impl VariablePlacer for FixedPlacer {
    fn place(&mut self, _graph: &Graph, _full_name: &str, _request: &VariableRequest) -> DeviceSpec {
        self.0.clone()
    }
}

/// The default creation path: prefix, reuse rules, placement and a plain read.
pub struct BaseGetter<'a> {
    prefix: Option<String>,
    reuse: bool,
    placer: Box<dyn VariablePlacer + 'a>,
}

impl<'a> BaseGetter<'a> {
    pub fn new(prefix: Option<String>, reuse: bool, placer: Box<dyn VariablePlacer + 'a>) -> Self {
        Self {
            prefix,
            reuse,
            placer,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn reuse(&self) -> bool {
        self.reuse
    }

    pub fn full_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_string(),
        }
    }

    /// Creates the variable, or returns the existing one when the scope reuses variables.
    /// Reads are served from the caching device if one is set, else from the variable's device.
    pub fn get(&mut self, graph: &mut Graph, request: VariableRequest) -> Result<VarHandle> {
        let full_name = self.full_name(&request.name);
        let var = match (graph.variable_by_name(&full_name), self.reuse) {
            (Some(var), true) => var,
            (Some(_), false) => return Err(Error::DuplicateVariable(full_name)),
            (None, true) => return Err(Error::UnknownVariable(full_name)),
            (None, false) => {
                let device = match &request.device {
                    Some(device) => device.clone(),
                    None => self.placer.place(graph, &full_name, &request),
                };
                graph.create_variable(VariableDef {
                    name: full_name,
                    device,
                    initial_value: request.initial_value,
                    trainable: request.trainable,
                    collection: request.collection.unwrap_or(Collection::Global),
                    caching_device: request.caching_device,
                })?
            }
        };
        let read_device = {
            let v = graph.variable(var)?;
            v.caching_device.clone().unwrap_or_else(|| v.device.clone())
        };
        let value = graph.read_variable(var, &read_device)?;
        Ok(VarHandle { var, value })
    }
}

/// Hook around variable creation. Implementations may rewrite the request, call the base
/// getter, and return a different read node.
pub trait VariableInterceptor {
    fn intercept(
        &mut self,
        graph: &mut Graph,
        request: VariableRequest,
        getter: &mut BaseGetter<'_>,
    ) -> Result<VarHandle>;
}

/// The scope a replica's model is built in.
pub struct VariableScope<'a> {
    replica: usize,
    device: DeviceSpec,
    getter: BaseGetter<'a>,
    interceptor: Option<Box<dyn VariableInterceptor + 'a>>,
}

impl<'a> VariableScope<'a> {
    pub fn new(replica: usize, device: DeviceSpec, getter: BaseGetter<'a>) -> Self {
        Self {
            replica,
            device,
            getter,
            interceptor: None,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Box<dyn VariableInterceptor + 'a>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Device the replica's computation runs on.
    pub fn device(&self) -> &DeviceSpec {
        &self.device
    }

    pub fn prefix(&self) -> Option<&str> {
        self.getter.prefix()
    }

    pub fn reuse(&self) -> bool {
        self.getter.reuse()
    }

    pub fn get_variable(&mut self, graph: &mut Graph, request: VariableRequest) -> Result<VarHandle> {
        match self.interceptor.as_mut() {
            Some(interceptor) => interceptor.intercept(graph, request, &mut self.getter),
            None => self.getter.get(graph, request),
        }
    }
}

/// Name of the replica-owned scope for replica `n`.
pub fn replica_scope_name(n: usize) -> String {
    format!("replica-{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;

    fn request(name: &str) -> VariableRequest {
        VariableRequest::new(name, Tensor::zeros([2, 2]))
    }

    #[test]
    fn test_prefixed_scope_creates_and_reads() {
        let mut g = Graph::new();
        let getter = BaseGetter::new(
            Some(replica_scope_name(1)),
            false,
            Box::new(FixedPlacer(DeviceSpec::gpu(1))),
        );
        let mut scope = VariableScope::new(1, DeviceSpec::gpu(1), getter);
        let h = scope.get_variable(&mut g, request("conv/w")).unwrap();
        let var = g.variable(h.var).unwrap();
        assert_eq!(var.name, "replica-1/conv/w");
        assert_eq!(var.device, DeviceSpec::gpu(1));
        assert!(matches!(g.node(h.value).unwrap().op, OpKind::ReadVariable(v) if v == h.var));
    }

    #[test]
    fn test_duplicate_without_reuse() {
        let mut g = Graph::new();
        let mut getter = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        getter.get(&mut g, request("w")).unwrap();
        assert!(matches!(
            getter.get(&mut g, request("w")),
            Err(Error::DuplicateVariable(_))
        ));
    }

    #[test]
    fn test_reuse_requires_existing() {
        let mut g = Graph::new();
        let mut first = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        let created = first.get(&mut g, request("w")).unwrap();

        let mut again = BaseGetter::new(None, true, Box::new(FixedPlacer(DeviceSpec::gpu(3))));
        let reused = again.get(&mut g, request("w")).unwrap();
        assert_eq!(reused.var, created.var);
        assert_ne!(reused.value, created.value);
        assert_eq!(g.variable(reused.var).unwrap().device, DeviceSpec::cpu(0));
        assert!(matches!(
            again.get(&mut g, request("missing")),
            Err(Error::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_caching_device_serves_reads() {
        let mut g = Graph::new();
        let mut getter = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        let mut req = request("w");
        req.caching_device = Some(DeviceSpec::gpu(0));
        let h = getter.get(&mut g, req).unwrap();
        assert_eq!(g.device(h.value).unwrap(), &DeviceSpec::gpu(0));
    }

    struct ForceLocal;

    impl VariableInterceptor for ForceLocal {
        fn intercept(
            &mut self,
            graph: &mut Graph,
            mut request: VariableRequest,
            getter: &mut BaseGetter<'_>,
        ) -> Result<VarHandle> {
            request.collection = Some(Collection::Local);
            getter.get(graph, request)
        }
    }

    #[test]
    fn test_interceptor_rewrites_request() {
        let mut g = Graph::new();
        let getter = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        let mut scope =
            VariableScope::new(0, DeviceSpec::gpu(0), getter).with_interceptor(Box::new(ForceLocal));
        let h = scope.get_variable(&mut g, request("w")).unwrap();
        assert_eq!(g.variable(h.var).unwrap().collection, Collection::Local);
    }
}
