//! Staged variable reads.
//!
//! A staged variable is read once per step into a buffer on the replica's device, and every
//! use in that step reads the buffer instead of the variable. The cache hands out one
//! `(put, get)` pair per `(replica, variable name)`:
//!
//! ```text
//!  variable ──read──> [host copy] ──StagePut──> buffer(replica) ──StageGet──> model
//! ```
//!
//! With a host device configured, the variable crosses the network once per step and all
//! replicas of the worker stage from the same host copy. Without one, each replica reads the
//! variable directly.
//!
//! `StageGet` carries a control dependency on its `StagePut`, so a get never sees a stale buffer.
//! The put ops must also be run every step; [`StagingCache::put_ops`] lists them.

use crate::error::{Error, Result};
use crate::graph::{
    BaseGetter, DType, Graph, NodeId, OpKind, ParamRef, StagingKey, VarHandle, VarId,
    VariableInterceptor, VariableRequest,
};
use crate::tensor::DeviceSpec;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Write and read handles of one staging buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedPair {
    pub put: NodeId,
    pub get: NodeId,
}

#[derive(Clone, Debug)]
pub struct StagingCache {
    devices: Vec<DeviceSpec>,
    cpu_device: Option<DeviceSpec>,
    entries: BTreeMap<StagingKey, StagedPair>,
    host_reads: HashMap<String, NodeId>,
}

impl StagingCache {
    /// `devices[r]` holds replica `r`'s buffers. `cpu_device` enables the shared host copy.
    pub fn new(devices: Vec<DeviceSpec>, cpu_device: Option<DeviceSpec>) -> Self {
        Self {
            devices,
            cpu_device,
            entries: BTreeMap::new(),
            host_reads: HashMap::new(),
        }
    }

    pub fn lookup(&self, replica: usize, name: &str) -> Option<StagedPair> {
        self.entries
            .get(&StagingKey {
                replica,
                name: name.to_string(),
            })
            .copied()
    }

    /// Returns the buffer for `var` on `replica`, creating it on first use.
    pub fn get_or_create(&mut self, graph: &mut Graph, replica: usize, var: VarId) -> Result<StagedPair> {
        let (name, shape) = {
            let v = graph.variable(var)?;
            (v.name.clone(), v.shape.clone())
        };
        if let Some(pair) = self.lookup(replica, &name) {
            return Ok(pair);
        }
        let device = self
            .devices
            .get(replica)
            .cloned()
            .ok_or(Error::DeviceIndexOutOfRange {
                index: replica,
                len: self.devices.len(),
            })?;

        let source = match &self.cpu_device {
            Some(cpu) => match self.host_reads.get(&name) {
                Some(&read) => read,
                None => {
                    let read = graph.read_variable(var, cpu)?;
                    self.host_reads.insert(name.clone(), read);
                    read
                }
            },
            None => graph.read_variable(var, &device)?,
        };

        let key = StagingKey { replica, name };
        let put = graph.add_node(
            &format!("{}/StagePut", key.name),
            OpKind::StagePut(key.clone()),
            vec![source],
            vec![],
            &device,
            vec![],
            DType::Unit,
        )?;
        let get = graph.add_node(
            &format!("{}/StageGet", key.name),
            OpKind::StageGet(key.clone()),
            vec![],
            vec![put],
            &device,
            shape,
            DType::F32,
        )?;
        debug!(replica, name = %key.name, "staged variable");
        let pair = StagedPair { put, get };
        self.entries.insert(key, pair);
        Ok(pair)
    }

    /// Every put op, ordered by replica then name.
    pub fn put_ops(&self) -> Vec<NodeId> {
        self.entries.values().map(|p| p.put).collect()
    }

    /// Put ops of one replica.
    pub fn put_ops_for(&self, replica: usize) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(k, _)| k.replica == replica)
            .map(|(_, p)| p.put)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trainable variables as replica `replica` sees them: the variables themselves when
    /// `writable`, otherwise their staged reads.
    pub fn trainable_variables_on_device(
        &self,
        graph: &Graph,
        replica: usize,
        writable: bool,
    ) -> Result<Vec<ParamRef>> {
        graph
            .trainable_variables()
            .map(|v| {
                if writable {
                    return Ok(ParamRef::Variable(v.id));
                }
                let pair = self
                    .lookup(replica, &v.name)
                    .ok_or_else(|| Error::UnknownVariable(format!("{} (not staged on replica {replica})", v.name)))?;
                Ok(ParamRef::Staged {
                    var: v.id,
                    read: pair.get,
                })
            })
            .collect()
    }
}

/// Serves a replica's variable reads from the staging cache.
pub struct StagedVariableInterceptor<'a> {
    replica: usize,
    cache: &'a mut StagingCache,
}

impl<'a> StagedVariableInterceptor<'a> {
    pub fn new(replica: usize, cache: &'a mut StagingCache) -> Self {
        Self { replica, cache }
    }
}

impl VariableInterceptor for StagedVariableInterceptor<'_> {
    fn intercept(
        &mut self,
        graph: &mut Graph,
        request: VariableRequest,
        getter: &mut BaseGetter<'_>,
    ) -> Result<VarHandle> {
        let full_name = getter.full_name(&request.name);
        if let (Some(pair), Some(var)) = (
            self.cache.lookup(self.replica, &full_name),
            graph.variable_by_name(&full_name),
        ) {
            return Ok(VarHandle {
                var,
                value: pair.get,
            });
        }
        let handle = getter.get(graph, request)?;
        let pair = self.cache.get_or_create(graph, self.replica, handle.var)?;
        Ok(VarHandle {
            var: handle.var,
            value: pair.get,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FixedPlacer;
    use crate::tensor::Tensor;

    fn var(g: &mut Graph, name: &str) -> VarId {
        let mut getter = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        getter
            .get(g, VariableRequest::new(name, Tensor::zeros([3])))
            .unwrap()
            .var
    }

    #[test]
    fn test_get_or_create_is_cached() {
        let mut g = Graph::new();
        let w = var(&mut g, "w");
        let mut cache = StagingCache::new(vec![DeviceSpec::gpu(0), DeviceSpec::gpu(1)], None);
        let a = cache.get_or_create(&mut g, 0, w).unwrap();
        let b = cache.get_or_create(&mut g, 0, w).unwrap();
        let c = cache.get_or_create(&mut g, 1, w).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.put_ops_for(1), vec![c.put]);
        assert_eq!(cache.put_ops(), vec![a.put, c.put]);
        assert_eq!(g.device(c.get).unwrap(), &DeviceSpec::gpu(1));
        assert!(g.depends_on(a.get, a.put));
    }

    #[test]
    fn test_host_copy_shared_between_replicas() {
        let mut g = Graph::new();
        let w = var(&mut g, "w");
        let mut cache = StagingCache::new(
            vec![DeviceSpec::gpu(0), DeviceSpec::gpu(1)],
            Some(DeviceSpec::cpu(0)),
        );
        let a = cache.get_or_create(&mut g, 0, w).unwrap();
        let b = cache.get_or_create(&mut g, 1, w).unwrap();
        assert_eq!(g.node(a.put).unwrap().inputs, g.node(b.put).unwrap().inputs);
        assert_eq!(g.find_nodes(|op| matches!(op, OpKind::ReadVariable(_))).len(), 2);
    }

    #[test]
    fn test_unknown_replica() {
        let mut g = Graph::new();
        let w = var(&mut g, "w");
        let mut cache = StagingCache::new(vec![DeviceSpec::gpu(0)], None);
        assert!(matches!(
            cache.get_or_create(&mut g, 3, w),
            Err(Error::DeviceIndexOutOfRange { index: 3, len: 1 })
        ));
    }

    #[test]
    fn test_interceptor_returns_staged_read() {
        let mut g = Graph::new();
        let mut cache = StagingCache::new(vec![DeviceSpec::gpu(0)], None);
        let mut getter = BaseGetter::new(None, false, Box::new(FixedPlacer(DeviceSpec::cpu(0))));
        let handle = {
            let mut interceptor = StagedVariableInterceptor::new(0, &mut cache);
            interceptor
                .intercept(&mut g, VariableRequest::new("w", Tensor::zeros([2])), &mut getter)
                .unwrap()
        };
        assert!(matches!(g.node(handle.value).unwrap().op, OpKind::StageGet(_)));
        let params = cache.trainable_variables_on_device(&g, 0, false).unwrap();
        assert_eq!(params, vec![ParamRef::Staged { var: handle.var, read: handle.value }]);
        let writable = cache.trainable_variables_on_device(&g, 0, true).unwrap();
        assert_eq!(writable, vec![ParamRef::Variable(handle.var)]);
    }
}
