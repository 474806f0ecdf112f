use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;
use varmgr_rs::distributed::aggregation::aggregate_gradients_using_hierarchical_copy;
use varmgr_rs::distributed::allreduce::{build_all_reduce_device_prefixes, sum_gradients_all_reduce, AllReduceAlg};
use varmgr_rs::distributed::{DeviceGradients, GradientEntry};
use varmgr_rs::graph::{Graph, NodeId};
use varmgr_rs::runtime::Session;
use varmgr_rs::tensor::{DeviceSpec, Tensor};

const NUM_REPLICAS: usize = 8;
const SIZES: [usize; 4] = [4096, 1024, 64, 1];

fn setup() -> (Graph, Vec<DeviceSpec>, DeviceGradients, HashMap<NodeId, Tensor<f32>>) {
    let mut graph = Graph::new();
    let devices: Vec<DeviceSpec> = (0..NUM_REPLICAS).map(DeviceSpec::gpu).collect();
    let mut device_grads = Vec::new();
    let mut feeds = HashMap::new();
    for (r, device) in devices.iter().enumerate() {
        let row = SIZES
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let grad = graph.placeholder(&format!("tower_{r}/grad_{i}"), device, [n]);
                feeds.insert(grad, Tensor::full([n], 1.0));
                GradientEntry::unbound(grad)
            })
            .collect();
        device_grads.push(row);
    }
    (graph, devices, device_grads, feeds)
}

fn benchmark_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");
    let prefixes = build_all_reduce_device_prefixes("localhost", 1).unwrap();
    let gpu_indices: Vec<usize> = (0..NUM_REPLICAS).collect();

    for alg in [AllReduceAlg::Xring, AllReduceAlg::Rechd, AllReduceAlg::Pscpu] {
        group.bench_function(format!("build_{alg}_8x4"), |b| {
            b.iter(|| {
                let (mut graph, _, device_grads, _) = setup();
                black_box(
                    sum_gradients_all_reduce(&mut graph, &prefixes, &device_grads, 1, alg, 1, &gpu_indices, 0, 0)
                        .unwrap(),
                );
            })
        });

        let (mut graph, _, device_grads, feeds) = setup();
        let reduced =
            sum_gradients_all_reduce(&mut graph, &prefixes, &device_grads, 1, alg, 1, &gpu_indices, 0, 0).unwrap();
        let fetches: Vec<NodeId> = reduced.iter().flatten().map(|e| e.grad).collect();
        group.bench_function(format!("run_{alg}_8x4"), |b| {
            let mut session = Session::new(&graph);
            b.iter(|| black_box(session.run(&fetches, &feeds).unwrap()))
        });
    }

    let (mut graph, devices, device_grads, feeds) = setup();
    let agg = aggregate_gradients_using_hierarchical_copy(&mut graph, &devices, &device_grads, false, false).unwrap();
    let fetches: Vec<NodeId> = agg.device_grads.iter().flatten().map(|e| e.grad).collect();
    group.bench_function("run_hierarchical_copy_8x4", |b| {
        let mut session = Session::new(&graph);
        b.iter(|| black_box(session.run(&fetches, &feeds).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, benchmark_aggregation);
criterion_main!(benches);
