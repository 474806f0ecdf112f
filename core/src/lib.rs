//! # varmgr-rs
//!
//! `varmgr-rs` decides where the trainable parameters of a data-parallel training job live, how
//! per-replica gradients are combined, and how the combined result reaches every copy of a
//! parameter.
//!
//! It works on a dataflow [`graph`]: model code builds each replica's forward/backward pass
//! inside the [`graph::VariableScope`] a [`variable_mgr::VariableMgr`] hands out, then passes the
//! `[replica][parameter]` gradient matrix back to the manager, which appends the aggregation and
//! update ops. The reference [`runtime`] executes such graphs on the CPU so every strategy can be
//! checked end to end.
//!
//! ## Modules
//!
//! - [`variable_mgr`]: the placement strategies (independent, parameter server, replicated, ...).
//! - [`distributed`]: aggregation primitives, all-reduce algorithms, device setters, staging and
//!   cross-worker barriers.
//! - [`graph`]: the graph IR, variable registry and replica scopes.
//! - [`runtime`]: reference executor.
//! - [`config`] / [`cluster`]: settings and the device layout derived from them.
//! - [`checkpoint`]: `safetensors` checkpoints of the savable variables.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use varmgr_rs::config::{VariableMgrConfig, VariableUpdate};
//! use varmgr_rs::distributed::GradientEntry;
//! use varmgr_rs::graph::{Graph, VariableRequest};
//! use varmgr_rs::runtime::Session;
//! use varmgr_rs::tensor::Tensor;
//! use varmgr_rs::{create_variable_mgr, ClusterContext, LossScaleParams, Sgd};
//!
//! let config = VariableMgrConfig {
//!     variable_update: VariableUpdate::Replicated,
//!     num_gpus: 2,
//!     ..VariableMgrConfig::default()
//! };
//! let ctx = ClusterContext::from_config(&config).unwrap();
//! let mut mgr = create_variable_mgr(&config, &ctx).unwrap();
//!
//! let mut graph = Graph::new();
//! let mut device_grads = Vec::new();
//! for replica in 0..2 {
//!     let mut scope = mgr.open_variable_scope(replica).unwrap();
//!     let w = scope
//!         .get_variable(&mut graph, VariableRequest::new("w", Tensor::zeros([2])))
//!         .unwrap();
//!     let device = scope.device().clone();
//!     let grad = graph.placeholder(&format!("grad_{replica}"), &device, [2]);
//!     device_grads.push(vec![GradientEntry::new(grad, w.var)]);
//! }
//!
//! let (apply_devices, state) = mgr.preprocess(&mut graph, device_grads.clone()).unwrap();
//! let mut train_ops = Vec::new();
//! for d in 0..apply_devices.len() {
//!     let grads = mgr.gradients_for(&state, d).unwrap();
//!     train_ops.extend(
//!         mgr.build_apply_ops(&mut graph, &state, d, &grads, &Sgd::new(1.0), &LossScaleParams::default())
//!             .unwrap(),
//!     );
//! }
//!
//! let mut session = Session::new(&graph);
//! session.initialize().unwrap();
//! let mut feeds = HashMap::new();
//! feeds.insert(device_grads[0][0].grad, Tensor::new(vec![1.0, 2.0], [2]).unwrap());
//! feeds.insert(device_grads[1][0].grad, Tensor::new(vec![3.0, 4.0], [2]).unwrap());
//! session.run(&train_ops, &feeds).unwrap();
//!
//! // Both copies received the summed gradient.
//! let w0 = session.variable_value_by_name("replica-0/w").unwrap();
//! assert_eq!(w0.data(), &[-4.0, -6.0]);
//! ```

pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod distributed;
pub mod error;
pub mod graph;
pub mod loss_scale;
pub mod optim;
pub mod runtime;
pub mod tensor;
pub mod variable_mgr;

pub use cluster::ClusterContext;
pub use config::{VariableMgrConfig, VariableUpdate};
pub use error::{Error, Result};
pub use loss_scale::{LossScaleParams, LossScalePolicy};
pub use optim::{Optimizer, Sgd};
pub use tensor::{DeviceSpec, Tensor, TensorError};
pub use variable_mgr::{create_variable_mgr, GradientState, VariableMgr};
