use varmgr_rs::config::{LocalParameterDevice, VariableMgrConfig, VariableUpdate};
use varmgr_rs::tensor::{DeviceSpec, DeviceType};
use varmgr_rs::{create_variable_mgr, ClusterContext};

#[test]
fn test_json_fills_missing_fields_with_defaults() {
    let config: VariableMgrConfig = serde_json::from_str(
        r#"{"variable_update": "ps", "num_gpus": 4, "local_parameter_device": "gpu"}"#,
    )
    .unwrap();
    assert_eq!(config.variable_update, VariableUpdate::ParameterServer);
    assert_eq!(config.num_gpus, 4);
    assert_eq!(config.local_parameter_device, LocalParameterDevice::Gpu);
    assert_eq!(config.agg_small_grads_max_group, 10);
    assert_eq!(config.num_workers, 1);
    assert!(config.job_name.is_none());

    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains(r#""variable_update":"parameter_server""#));
    let back: VariableMgrConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn test_unknown_mode_is_rejected() {
    assert!(serde_json::from_str::<VariableMgrConfig>(r#"{"variable_update": "mirrored"}"#).is_err());
}

#[test]
fn test_local_cluster_context() {
    let config = VariableMgrConfig {
        variable_update: VariableUpdate::ParameterServer,
        num_gpus: 3,
        local_parameter_device: LocalParameterDevice::Gpu,
        ..VariableMgrConfig::default()
    };
    let ctx = ClusterContext::from_config(&config).unwrap();
    assert_eq!(ctx.raw_devices, vec![DeviceSpec::gpu(0), DeviceSpec::gpu(1), DeviceSpec::gpu(2)]);
    assert_eq!(ctx.param_server_device, DeviceSpec::gpu(0));
    assert_eq!(ctx.cpu_device, DeviceSpec::cpu(0));
    assert_eq!(ctx.gpu_indices, vec![0, 1, 2]);
    assert!(ctx.ps_devices.is_empty());
}

#[test]
fn test_distributed_cluster_context() {
    let config = VariableMgrConfig {
        variable_update: VariableUpdate::DistributedReplicated,
        job_name: Some("worker".into()),
        num_workers: 3,
        task_index: 2,
        num_ps: 2,
        num_gpus: 2,
        ..VariableMgrConfig::default()
    };
    let ctx = ClusterContext::from_config(&config).unwrap();
    let worker = DeviceSpec::task("worker", 2);
    assert_eq!(ctx.cpu_device, worker.clone().with_device(DeviceType::Cpu, 0));
    assert_eq!(ctx.raw_devices[1], worker.with_device(DeviceType::Gpu, 1));
    assert_eq!(ctx.ps_devices.len(), 2);
    assert_eq!(ctx.sync_queue_devices, ctx.ps_devices);
    assert!(ctx.ps_devices.iter().all(|d| d.job.as_deref() == Some("ps")));
}

#[test]
fn test_distributed_all_reduce_spans_every_worker() {
    let config = VariableMgrConfig {
        variable_update: VariableUpdate::DistributedAllReduce,
        all_reduce_spec: Some("xring".into()),
        job_name: Some("worker".into()),
        num_workers: 2,
        num_gpus: 4,
        ..VariableMgrConfig::default()
    };
    let ctx = ClusterContext::from_config(&config).unwrap();
    assert_eq!(ctx.raw_devices.len(), 8);
    assert_eq!(ctx.raw_devices[5], DeviceSpec::task("worker", 1).with_device(DeviceType::Gpu, 1));
    let mgr = create_variable_mgr(&config, &ctx).unwrap();
    assert_eq!(mgr.name(), "distributed_all_reduce");
    assert_eq!(mgr.devices().len(), 8);
}

#[test]
fn test_mode_names() {
    let cases = [
        (VariableUpdate::Independent, false, None, "independent"),
        (VariableUpdate::ParameterServer, false, None, "parameter_server"),
        (VariableUpdate::ParameterServer, true, None, "staged_parameter_server"),
        (VariableUpdate::ParameterServer, false, Some("worker"), "distributed_parameter_server"),
        (VariableUpdate::ParameterServer, true, Some("worker"), "staged_distributed_parameter_server"),
        (VariableUpdate::Replicated, false, None, "replicated"),
        (VariableUpdate::DistributedReplicated, false, Some("worker"), "distributed_replicated"),
    ];
    for (variable_update, staged_vars, job, expected) in cases {
        let config = VariableMgrConfig {
            variable_update,
            staged_vars,
            job_name: job.map(str::to_string),
            num_ps: usize::from(job.is_some()),
            num_gpus: 2,
            ..VariableMgrConfig::default()
        };
        let ctx = ClusterContext::from_config(&config).unwrap();
        let mgr = create_variable_mgr(&config, &ctx).unwrap();
        assert_eq!(mgr.name(), expected);
        assert_eq!(mgr.supports_staged_vars(), variable_update == VariableUpdate::ParameterServer);
    }
}
