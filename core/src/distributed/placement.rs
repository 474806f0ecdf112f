//! Variable placement policies.
//!
//! Placers decide where a new variable lives; interceptors adjust the creation request on its
//! way to the [`BaseGetter`].
//!
//! | Type                          | Used by                              | Rule                                   |
//! |-------------------------------|--------------------------------------|----------------------------------------|
//! | [`ParamServerDeviceSetter`]   | local fetch-from-PS, GPU params      | least-loaded GPU by element count      |
//! | [`ReplicaDeviceSetter`]       | fetch-from-PS (local and distributed)| a PS device chosen by a [`PsStrategy`] |
//! | [`CachingDeviceOverride`]     | distributed fetch-from-PS            | sets the device reads are cached on    |
//! | [`LocalVariableOverride`]     | distributed replicated               | replica variables go to the local set  |

use crate::error::Result;
use crate::graph::{
    BaseGetter, Collection, Graph, VarHandle, VariableInterceptor, VariablePlacer, VariableRequest,
};
use crate::runtime::resources::PS_JOB;
use crate::tensor::{DeviceSpec, DeviceType};

/// Name prefix of the shadow copies the distributed replicated mode keeps on the PS.
pub const PS_SHADOW_VAR_PREFIX: &str = "ps_var";

/// Variables with fewer elements than this are cached on the worker CPU.
pub const SMALL_VARIABLE_SIZE_THRESHOLD: usize = 64 * 1024;

fn least_loaded(loads: &[usize]) -> usize {
    loads
        .iter()
        .enumerate()
        .min_by_key(|&(_, load)| *load)
        .map_or(0, |(i, _)| i)
}

/// Places each new variable on the parameter device with the fewest elements so far.
#[derive(Clone, Debug)]
pub struct ParamServerDeviceSetter {
    worker_device: DeviceSpec,
    ps_devices: Vec<DeviceSpec>,
    ps_sizes: Vec<usize>,
}

impl ParamServerDeviceSetter {
    pub fn new(worker_device: DeviceSpec, ps_devices: Vec<DeviceSpec>) -> Self {
        let ps_sizes = vec![0; ps_devices.len()];
        Self {
            worker_device,
            ps_devices,
            ps_sizes,
        }
    }

    /// Device non-variable operations run on.
    pub fn worker_device(&self) -> &DeviceSpec {
        &self.worker_device
    }

    /// Elements placed on each parameter device so far.
    pub fn loads(&self) -> &[usize] {
        &self.ps_sizes
    }
}

impl VariablePlacer for ParamServerDeviceSetter {
    fn place(&mut self, _graph: &Graph, _full_name: &str, request: &VariableRequest) -> DeviceSpec {
        if self.ps_devices.is_empty() {
            return self.worker_device.clone();
        }
        let i = least_loaded(&self.ps_sizes);
        self.ps_sizes[i] += request.initial_value.numel();
        self.ps_devices[i].clone()
    }
}

/// Picks the PS task for a new variable.
pub trait PsStrategy {
    fn choose(&mut self, request: &VariableRequest) -> usize;
}

/// Cycles through the PS tasks.
#[derive(Clone, Debug)]
pub struct RoundRobinStrategy {
    num_tasks: usize,
    next: usize,
}

impl RoundRobinStrategy {
    pub fn new(num_tasks: usize) -> Self {
        Self { num_tasks, next: 0 }
    }
}

impl PsStrategy for RoundRobinStrategy {
    fn choose(&mut self, _request: &VariableRequest) -> usize {
        let task = self.next;
        self.next = (self.next + 1) % self.num_tasks.max(1);
        task
    }
}

/// Load of one variable, as seen by [`GreedyLoadBalancingStrategy`].
pub type LoadFn = fn(&VariableRequest) -> usize;

/// Byte size of the variable's initial value.
pub fn byte_size_load_fn(request: &VariableRequest) -> usize {
    request.byte_size()
}

/// Places each variable on the PS task with the smallest accumulated load.
#[derive(Clone, Debug)]
pub struct GreedyLoadBalancingStrategy {
    loads: Vec<usize>,
    load_fn: LoadFn,
}

impl GreedyLoadBalancingStrategy {
    pub fn new(num_tasks: usize, load_fn: LoadFn) -> Self {
        Self {
            loads: vec![0; num_tasks.max(1)],
            load_fn,
        }
    }

    pub fn loads(&self) -> &[usize] {
        &self.loads
    }
}

impl PsStrategy for GreedyLoadBalancingStrategy {
    fn choose(&mut self, request: &VariableRequest) -> usize {
        let task = least_loaded(&self.loads);
        self.loads[task] += (self.load_fn)(request);
        task
    }
}

/// Sends variables to parameter-server devices; everything else stays on the worker device.
pub struct ReplicaDeviceSetter {
    worker_device: DeviceSpec,
    target: PsTarget,
}

enum PsTarget {
    Single(DeviceSpec),
    Cluster(Box<dyn PsStrategy>),
}

impl ReplicaDeviceSetter {
    /// All variables on `ps_device`.
    pub fn single(worker_device: DeviceSpec, ps_device: DeviceSpec) -> Self {
        Self {
            worker_device,
            target: PsTarget::Single(ps_device),
        }
    }

    /// Variables spread over the CPUs of the `ps` job, task chosen by `strategy`.
    pub fn for_cluster(worker_device: DeviceSpec, strategy: Box<dyn PsStrategy>) -> Self {
        Self {
            worker_device,
            target: PsTarget::Cluster(strategy),
        }
    }

    pub fn worker_device(&self) -> &DeviceSpec {
        &self.worker_device
    }
}

impl VariablePlacer for ReplicaDeviceSetter {
    fn place(&mut self, _graph: &Graph, _full_name: &str, request: &VariableRequest) -> DeviceSpec {
        match &mut self.target {
            PsTarget::Single(device) => device.clone(),
            PsTarget::Cluster(strategy) => {
                DeviceSpec::task(PS_JOB, strategy.choose(request)).with_device(DeviceType::Cpu, 0)
            }
        }
    }
}

/// Sets the caching device of new variables: small ones on `device_for_small_variables`, the
/// rest on whichever of `devices` has cached the fewest elements.
#[derive(Clone, Debug)]
pub struct CachingDeviceOverride {
    devices: Vec<DeviceSpec>,
    sizes: Vec<usize>,
    device_for_small_variables: DeviceSpec,
    small_variable_size_threshold: usize,
}

impl CachingDeviceOverride {
    pub fn new(
        devices: Vec<DeviceSpec>,
        device_for_small_variables: DeviceSpec,
        small_variable_size_threshold: usize,
    ) -> Self {
        let sizes = vec![0; devices.len()];
        Self {
            devices,
            sizes,
            device_for_small_variables,
            small_variable_size_threshold,
        }
    }

    fn caching_device(&mut self, size: usize) -> DeviceSpec {
        if size < self.small_variable_size_threshold || self.devices.is_empty() {
            return self.device_for_small_variables.clone();
        }
        let i = least_loaded(&self.sizes);
        self.sizes[i] += size;
        self.devices[i].clone()
    }
}

impl VariableInterceptor for CachingDeviceOverride {
    fn intercept(
        &mut self,
        graph: &mut Graph,
        mut request: VariableRequest,
        getter: &mut BaseGetter<'_>,
    ) -> Result<VarHandle> {
        let size = request.initial_value.numel();
        request.caching_device = Some(self.caching_device(size));
        getter.get(graph, request)
    }
}

/// Puts every variable except the PS shadow copies into the local collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalVariableOverride;

impl VariableInterceptor for LocalVariableOverride {
    fn intercept(
        &mut self,
        graph: &mut Graph,
        mut request: VariableRequest,
        getter: &mut BaseGetter<'_>,
    ) -> Result<VarHandle> {
        if !request.name.starts_with(PS_SHADOW_VAR_PREFIX) {
            request.collection = Some(Collection::Local);
        }
        getter.get(graph, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FixedPlacer;
    use crate::tensor::Tensor;

    fn request(n: usize) -> VariableRequest {
        VariableRequest::new("w", Tensor::zeros([n]))
    }

    #[test]
    fn test_param_server_setter_balances_elements() {
        let g = Graph::new();
        let gpus: Vec<_> = (0..2).map(DeviceSpec::gpu).collect();
        let mut setter = ParamServerDeviceSetter::new(DeviceSpec::gpu(0), gpus.clone());
        assert_eq!(setter.place(&g, "a", &request(100)), gpus[0]);
        assert_eq!(setter.place(&g, "b", &request(10)), gpus[1]);
        assert_eq!(setter.place(&g, "c", &request(10)), gpus[1]);
        assert_eq!(setter.place(&g, "d", &request(10)), gpus[1]);
        assert_eq!(setter.loads(), &[100, 30]);
    }

    #[test]
    fn test_greedy_strategy_uses_byte_size() {
        let mut greedy = GreedyLoadBalancingStrategy::new(2, byte_size_load_fn);
        assert_eq!(greedy.choose(&request(8)), 0);
        assert_eq!(greedy.choose(&request(2)), 1);
        assert_eq!(greedy.choose(&request(2)), 1);
        assert_eq!(greedy.loads(), &[32, 16]);
    }

    #[test]
    fn test_round_robin_strategy() {
        let mut rr = RoundRobinStrategy::new(3);
        let tasks: Vec<_> = (0..4).map(|_| rr.choose(&request(1))).collect();
        assert_eq!(tasks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_replica_device_setter_cluster() {
        let g = Graph::new();
        let mut setter = ReplicaDeviceSetter::for_cluster(
            DeviceSpec::gpu(0),
            Box::new(GreedyLoadBalancingStrategy::new(2, byte_size_load_fn)),
        );
        let a = setter.place(&g, "a", &request(4));
        let b = setter.place(&g, "b", &request(4));
        assert_eq!(a.to_string(), "/job:ps/replica:0/task:0/device:CPU:0");
        assert_eq!(b.task, Some(1));
    }

    #[test]
    fn test_caching_device_threshold() {
        let mut g = Graph::new();
        let cpu = DeviceSpec::cpu(0);
        let gpus: Vec<_> = (0..2).map(DeviceSpec::gpu).collect();
        let mut interceptor =
            CachingDeviceOverride::new(gpus.clone(), cpu.clone(), SMALL_VARIABLE_SIZE_THRESHOLD);
        let mut getter = BaseGetter::new(None, false, Box::new(FixedPlacer(cpu.clone())));

        let small = VariableRequest::new("small", Tensor::zeros([SMALL_VARIABLE_SIZE_THRESHOLD - 1]));
        let big = VariableRequest::new("big", Tensor::zeros([SMALL_VARIABLE_SIZE_THRESHOLD]));
        let small = interceptor.intercept(&mut g, small, &mut getter).unwrap();
        let big = interceptor.intercept(&mut g, big, &mut getter).unwrap();
        assert_eq!(g.variable(small.var).unwrap().caching_device, Some(cpu));
        assert_eq!(g.variable(big.var).unwrap().caching_device, Some(gpus[0].clone()));
        assert_eq!(g.device(big.value).unwrap(), &gpus[0]);
    }

    #[test]
    fn test_local_variable_override() {
        let mut g = Graph::new();
        let mut getter = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        let mut interceptor = LocalVariableOverride;
        let local = interceptor.intercept(&mut g, request(2), &mut getter).unwrap();
        let shadow = VariableRequest::new("ps_var/w", Tensor::zeros([2]));
        let shadow = interceptor.intercept(&mut g, shadow, &mut getter).unwrap();
        assert_eq!(g.variable(local.var).unwrap().collection, Collection::Local);
        assert_eq!(g.variable(shadow.var).unwrap().collection, Collection::Global);
    }
}
