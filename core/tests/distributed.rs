use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use varmgr_rs::config::{VariableMgrConfig, VariableUpdate};
use varmgr_rs::distributed::{DeviceGradients, GradientEntry};
use varmgr_rs::graph::{Graph, NodeId, OpKind, VariableRequest};
use varmgr_rs::runtime::{ClusterResources, Session};
use varmgr_rs::tensor::Tensor;
use varmgr_rs::{create_variable_mgr, ClusterContext, LossScaleParams, Sgd};

struct Worker {
    graph: Graph,
    device_grads: DeviceGradients,
    post_init: Vec<NodeId>,
    train_ops: Vec<NodeId>,
}

fn build_worker(task_index: usize, num_workers: usize, num_gpus: usize) -> Worker {
    let config = VariableMgrConfig {
        variable_update: VariableUpdate::DistributedReplicated,
        job_name: Some("worker".into()),
        num_workers,
        task_index,
        num_ps: 2,
        num_gpus,
        ..VariableMgrConfig::default()
    };
    let ctx = ClusterContext::from_config(&config).unwrap();
    let mut mgr = create_variable_mgr(&config, &ctx).unwrap();

    let mut graph = Graph::new();
    let mut device_grads = Vec::new();
    for r in 0..num_gpus {
        let mut scope = mgr.open_variable_scope(r).unwrap();
        let device = scope.device().clone();
        let mut row = Vec::new();
        for (i, shape) in [vec![3], vec![2, 2]].into_iter().enumerate() {
            let h = scope
                .get_variable(&mut graph, VariableRequest::new(format!("w{i}"), Tensor::full(shape.clone(), 1.0)))
                .unwrap();
            let grad = graph.placeholder(&format!("tower_{r}/grad_{i}"), &device, shape);
            row.push(GradientEntry::new(grad, h.var));
        }
        device_grads.push(row);
    }

    let (apply_devices, state) = mgr.preprocess(&mut graph, device_grads.clone()).unwrap();
    assert_eq!(apply_devices, vec![ctx.param_server_device.clone()]);
    let grads = mgr.gradients_for(&state, 0).unwrap();
    let train_ops = mgr
        .build_apply_ops(&mut graph, &state, 0, &grads, &Sgd::new(1.0), &LossScaleParams::default())
        .unwrap();
    let post_init = mgr.post_init_sync_ops(&mut graph).unwrap();
    Worker {
        graph,
        device_grads,
        post_init,
        train_ops,
    }
}

fn feeds(worker: &Worker, value: f32) -> HashMap<NodeId, Tensor<f32>> {
    worker
        .device_grads
        .iter()
        .flatten()
        .map(|e| {
            let shape = worker.graph.shape(e.grad).unwrap().to_vec();
            (e.grad, Tensor::full(shape, value))
        })
        .collect()
}

#[test]
fn test_broadcast_waits_for_barrier() {
    let worker = build_worker(0, 2, 2);
    let g = &worker.graph;
    let applies = g.find_nodes(|op| matches!(op, OpKind::ApplySgd { .. }));
    let dequeues = g.find_nodes(|op| matches!(op, OpKind::QueueDequeueMany { .. }));
    let enqueues = g.find_nodes(|op| matches!(op, OpKind::QueueEnqueue { .. }));
    assert_eq!(applies.len(), 2);
    assert_eq!(dequeues.len(), 2);
    assert_eq!(enqueues.len(), 2);

    // One assign per (parameter, replica), parameter-major.
    assert_eq!(worker.train_ops.len(), 4);
    for (k, &op) in worker.train_ops.iter().enumerate() {
        let i = k / 2;
        assert!(matches!(g.node(op).unwrap().op, OpKind::Assign(_)));
        assert!(g.depends_on(op, applies[i]));
        assert!(g.depends_on(op, dequeues[i]));
        assert!(g.depends_on(enqueues[i], applies[i]));
    }
    assert!(!g.depends_on(applies[1], dequeues[0]));
}

#[test]
fn test_two_workers_share_shadow_variables() {
    let workers: Vec<Worker> = (0..2).map(|t| build_worker(t, 2, 1)).collect();
    let resources = Arc::new(ClusterResources::new().with_queue_timeout(Duration::from_secs(10)));

    let results: Vec<Vec<Vec<f32>>> = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter()
            .enumerate()
            .map(|(t, worker)| {
                let resources = Arc::clone(&resources);
                s.spawn(move |_| {
                    let mut session = Session::with_resources(&worker.graph, resources);
                    session.initialize().unwrap();
                    session.run(&worker.post_init, &HashMap::new()).unwrap();
                    // Worker t feeds gradient t + 1.
                    session.run(&worker.train_ops, &feeds(worker, (t + 1) as f32)).unwrap();
                    (0..2)
                        .map(|i| {
                            session
                                .variable_value_by_name(&format!("replica-0/w{i}"))
                                .unwrap()
                                .into_data()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    // 1.0 - 1.0 (worker 0) - 2.0 (worker 1), seen by both workers.
    for worker_values in &results {
        for values in worker_values {
            assert!(values.iter().all(|&x| (x + 2.0).abs() < 1e-5), "{values:?}");
        }
    }
    let shadow = Session::with_resources(&workers[0].graph, resources)
        .variable_value_by_name("ps_var/replica-0/w1")
        .unwrap();
    assert_eq!(shadow.data(), &[-2.0; 4]);
}
