//! Device layout of the process building the graph.
//!
//! [`ClusterContext`] turns a [`VariableMgrConfig`] into the concrete device names the variable
//! managers use. Three layouts exist:
//!
//! | Layout                     | `raw_devices`                                   | `cpu_device`          |
//! |----------------------------|-------------------------------------------------|-----------------------|
//! | local                      | `/gpu:i`                                        | `/cpu:0`              |
//! | distributed all-reduce     | `/job:J/replica:0/task:t/gpu:i`, every task     | task 0's CPU          |
//! | other distributed modes    | `/job:worker/replica:0/task:T/gpu:i`, own task  | own CPU               |
//!
//! In the distributed all-reduce layout one graph covers every worker, so `raw_devices` lists the
//! GPUs of all tasks, worker-major.

use crate::config::{LocalParameterDevice, VariableMgrConfig, VariableUpdate};
use crate::error::Result;
use crate::runtime::resources::PS_JOB;
use crate::tensor::{DeviceSpec, DeviceType};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterContext {
    /// Job the all-reduce device prefixes are built for.
    pub job_name: String,
    pub num_workers: usize,
    pub task_index: usize,
    /// One device per replica.
    pub raw_devices: Vec<DeviceSpec>,
    /// Where shared parameters (or, in distributed modes, their non-variable ops) live.
    pub param_server_device: DeviceSpec,
    /// This worker's host CPU.
    pub cpu_device: DeviceSpec,
    /// GPU indices on each worker, in ring order.
    pub gpu_indices: Vec<usize>,
    /// Devices barrier queues are placed on.
    pub sync_queue_devices: Vec<DeviceSpec>,
    /// CPUs of the parameter-server tasks.
    pub ps_devices: Vec<DeviceSpec>,
    pub local_parameter_device: LocalParameterDevice,
}

impl ClusterContext {
    pub fn from_config(config: &VariableMgrConfig) -> Result<Self> {
        config.validate()?;
        let gpu_indices: Vec<usize> = (0..config.num_gpus).collect();
        let ps_devices: Vec<DeviceSpec> = (0..config.num_ps)
            .map(|i| DeviceSpec {
                job: Some(PS_JOB.to_string()),
                task: Some(i),
                ..DeviceSpec::cpu(0)
            })
            .collect();

        let ctx = if config.variable_update == VariableUpdate::DistributedAllReduce {
            let job = if config.num_workers > 1 { "worker" } else { "localhost" };
            let raw_devices = (0..config.num_workers)
                .flat_map(|t| {
                    gpu_indices
                        .iter()
                        .map(move |&i| DeviceSpec::task(job, t).with_device(DeviceType::Gpu, i))
                })
                .collect();
            let cpu_device = DeviceSpec::task(job, 0).with_device(DeviceType::Cpu, 0);
            Self {
                job_name: job.to_string(),
                num_workers: config.num_workers,
                task_index: config.task_index,
                raw_devices,
                param_server_device: cpu_device.clone(),
                sync_queue_devices: vec![cpu_device.clone()],
                cpu_device,
                gpu_indices,
                ps_devices,
                local_parameter_device: config.local_parameter_device,
            }
        } else if let Some(job) = &config.job_name {
            let worker = DeviceSpec::task("worker", config.task_index);
            let cpu_device = worker.clone().with_device(DeviceType::Cpu, 0);
            let sync_queue_devices = if ps_devices.is_empty() {
                vec![DeviceSpec {
                    job: Some("worker".into()),
                    task: Some(0),
                    ..DeviceSpec::cpu(0)
                }]
            } else {
                ps_devices.clone()
            };
            Self {
                job_name: job.clone(),
                num_workers: config.num_workers,
                task_index: config.task_index,
                raw_devices: gpu_indices
                    .iter()
                    .map(|&i| worker.clone().with_device(DeviceType::Gpu, i))
                    .collect(),
                param_server_device: cpu_device.clone(),
                cpu_device,
                gpu_indices,
                sync_queue_devices,
                ps_devices,
                local_parameter_device: config.local_parameter_device,
            }
        } else {
            let param_server_device = match config.local_parameter_device {
                LocalParameterDevice::Cpu => DeviceSpec::cpu(0),
                LocalParameterDevice::Gpu => DeviceSpec::gpu(0),
            };
            Self {
                job_name: "localhost".to_string(),
                num_workers: 1,
                task_index: 0,
                raw_devices: gpu_indices.iter().map(|&i| DeviceSpec::gpu(i)).collect(),
                sync_queue_devices: vec![param_server_device.clone()],
                param_server_device,
                cpu_device: DeviceSpec::cpu(0),
                gpu_indices,
                ps_devices,
                local_parameter_device: config.local_parameter_device,
            }
        };
        debug!(
            devices = ctx.raw_devices.len(),
            param_server_device = %ctx.param_server_device,
            cpu_device = %ctx.cpu_device,
            "cluster layout"
        );
        Ok(ctx)
    }
}
