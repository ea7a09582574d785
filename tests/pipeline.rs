use kernelpipe::accel::{
    dispatch, AccelerationPipeline, Context, Device, DeviceBuffer, Kernel, PipelineError,
    PipelineSettings, Program, SquareOp, Stage, WorkPartition,
};
use kernelpipe::runtime::{
    AccessMode, DeviceClass, DeviceSpec, FaultInjector, HostRuntime, RuntimeError, RuntimeOp,
};

fn run_on(runtime: &HostRuntime, input: &[f32]) -> Result<Vec<f32>, PipelineError> {
    AccelerationPipeline::new(runtime, PipelineSettings::default())
        .run(input)
        .map(|outcome| outcome.output)
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_count_four_squares_exactly() {
    let rt = HostRuntime::default();
    let outcome = AccelerationPipeline::new(&rt, PipelineSettings::default())
        .run(&[2.0, -3.0, 0.5, 0.0])
        .unwrap();
    assert_eq!(outcome.output, vec![4.0, 9.0, 0.25, 0.0]);
    assert_eq!(outcome.report.correct, 4);
    assert_eq!(outcome.report.count, 4);
    assert_eq!(outcome.report.to_string(), "Computed 4/4 correct values!");
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_round_trip_on_random_input() {
    let rt = HostRuntime::default();
    let input = kernelpipe::input::random_samples(1024, Some(42));
    let output = run_on(&rt, &input).unwrap();
    for (x, y) in input.iter().zip(&output) {
        assert_eq!(*y, x * x);
    }
}

#[test]
fn test_corrupted_device_counts_mismatch_without_failing() {
    let rt = FaultInjector::new(HostRuntime::default()).corrupt_read(3, 1.0);
    let outcome = AccelerationPipeline::new(&rt, PipelineSettings::default())
        .run(&[2.0, -3.0, 0.5, 0.0])
        .unwrap();
    assert_eq!(outcome.output, vec![4.0, 9.0, 0.25, 1.0]);
    assert_eq!(outcome.report.correct, 3);
    assert!(!outcome.report.all_correct());
    assert_eq!(outcome.report.to_string(), "Computed 3/4 correct values!");
    assert_eq!(rt.inner().live_objects(), 0);
}

#[test]
fn test_invalid_source_stops_at_build() {
    let rt = FaultInjector::new(HostRuntime::default());
    let settings = PipelineSettings {
        kernel_source: "__kernel void square(__global float* input {".to_string(),
        ..PipelineSettings::default()
    };
    let err = AccelerationPipeline::new(&rt, settings).run(&[1.0; 8]).unwrap_err();
    match &err {
        PipelineError::BuildFailed { log } => assert!(!log.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.stage(), Stage::ProgramBuild);

    let journal = rt.journal();
    for op in [
        RuntimeOp::CreateKernel,
        RuntimeOp::SetKernelArg,
        RuntimeOp::CreateBuffer,
        RuntimeOp::WriteBuffer,
        RuntimeOp::EnqueueKernel,
    ] {
        assert!(!journal.contains(&op), "{op} called after a failed build");
    }
    assert_eq!(rt.inner().live_objects(), 0);
}

#[test]
fn test_unknown_kernel_name() {
    let rt = HostRuntime::default();
    let settings = PipelineSettings { kernel_name: "cube".to_string(), ..PipelineSettings::default() };
    let err = AccelerationPipeline::new(&rt, settings).run(&[1.0; 4]).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::KernelNotFound { source: RuntimeError::InvalidKernelName(_), .. }
    ));
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_missing_device_class() {
    let rt = HostRuntime::new(vec![DeviceSpec::general_purpose()]);
    let err = run_on(&rt, &[1.0; 4]).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NoDeviceAvailable { class: DeviceClass::Accelerator }
    ));
}

#[test]
fn test_unavailable_device_fails_context_creation() {
    let rt = HostRuntime::new(vec![DeviceSpec { available: false, ..DeviceSpec::accelerator() }]);
    let err = run_on(&rt, &[1.0; 4]).unwrap_err();
    assert!(matches!(err, PipelineError::ContextCreationFailed(_)));
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_empty_input_fails_allocation() {
    let rt = HostRuntime::default();
    let err = run_on(&rt, &[]).unwrap_err();
    assert!(matches!(err, PipelineError::AllocationFailed { size: 0, .. }));
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_out_of_memory_fails_allocation() {
    let rt = HostRuntime::new(vec![DeviceSpec { global_mem_bytes: 4096, ..DeviceSpec::accelerator() }]);
    let err = run_on(&rt, &[0.5; 1024]).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::AllocationFailed { source: RuntimeError::OutOfResources { .. }, .. }
    ));
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_unguarded_kernel_faults_at_wait() {
    let rt = HostRuntime::default();
    let settings = PipelineSettings {
        kernel_source: "__kernel void square(__global float* input, __global float* output, \
                        const unsigned long count) {\n\
                        size_t i = get_global_id(0);\n\
                        output[i] = input[i] * input[i];\n}\n"
            .to_string(),
        group_size: Some(256),
        ..PipelineSettings::default()
    };
    // 1000 elements pad to 1024 work-items; the last 24 index past the end.
    let err = AccelerationPipeline::new(&rt, settings).run(&[1.0; 1000]).unwrap_err();
    assert!(matches!(err, PipelineError::LaunchFailed { .. }));
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_group_size_override_is_used() {
    let rt = HostRuntime::default();
    let settings = PipelineSettings { group_size: Some(64), ..PipelineSettings::default() };
    let outcome = AccelerationPipeline::new(&rt, settings).run(&[3.0; 100]).unwrap();
    assert_eq!(outcome.report.group_size, 64);
    assert_eq!(outcome.report.global_size, 128);
    assert!(outcome.output.iter().all(|&v| v == 9.0));
}

// ---------------------------------------------------------------------------
// Stage-failure isolation
// ---------------------------------------------------------------------------

fn expect_stage(op: RuntimeOp, check: fn(&PipelineError) -> bool) {
    let rt = FaultInjector::new(HostRuntime::default()).fail_on(op);
    let err = AccelerationPipeline::new(&rt, PipelineSettings::default())
        .run(&[1.0, 2.0, 3.0, 4.0])
        .unwrap_err();
    assert!(check(&err), "fault in {op} surfaced as {err:?}");

    let journal = rt.journal();
    let failed_at = journal.iter().position(|&o| o == op).unwrap();
    for later in &journal[failed_at + 1..] {
        let allowed = *later == RuntimeOp::Release
            || (op == RuntimeOp::BuildProgram && *later == RuntimeOp::BuildLog);
        assert!(allowed, "{later} called after fault in {op}");
    }
    assert_eq!(rt.inner().live_objects(), 0, "leak after fault in {op}");
}

#[test]
fn test_each_runtime_fault_maps_to_its_stage() {
    expect_stage(RuntimeOp::QueryDevices, |e| matches!(e, PipelineError::NoDeviceAvailable { .. }));
    expect_stage(RuntimeOp::DeviceInfo, |e| matches!(e, PipelineError::NoDeviceAvailable { .. }));
    expect_stage(RuntimeOp::CreateContext, |e| matches!(e, PipelineError::ContextCreationFailed(_)));
    expect_stage(RuntimeOp::CreateQueue, |e| matches!(e, PipelineError::QueueCreationFailed(_)));
    expect_stage(RuntimeOp::CreateProgram, |e| matches!(e, PipelineError::BuildFailed { .. }));
    expect_stage(RuntimeOp::BuildProgram, |e| matches!(e, PipelineError::BuildFailed { .. }));
    expect_stage(RuntimeOp::CreateKernel, |e| matches!(e, PipelineError::KernelNotFound { .. }));
    expect_stage(RuntimeOp::KernelArgCount, |e| matches!(e, PipelineError::KernelNotFound { .. }));
    expect_stage(RuntimeOp::CreateBuffer, |e| matches!(e, PipelineError::AllocationFailed { .. }));
    expect_stage(RuntimeOp::WriteBuffer, |e| matches!(e, PipelineError::TransferFailed { .. }));
    expect_stage(RuntimeOp::SetKernelArg, |e| {
        matches!(e, PipelineError::InvalidArgument { index: 0, .. })
    });
    expect_stage(RuntimeOp::QueryWorkGroupSize, |e| matches!(e, PipelineError::QueryFailed(_)));
    expect_stage(RuntimeOp::EnqueueKernel, |e| matches!(e, PipelineError::LaunchFailed { .. }));
    expect_stage(RuntimeOp::Finish, |e| matches!(e, PipelineError::LaunchFailed { .. }));
    expect_stage(RuntimeOp::ReadBuffer, |e| matches!(e, PipelineError::TransferFailed { .. }));
}

#[test]
fn test_stage_names_are_distinct() {
    let errors = [
        PipelineError::NoDeviceAvailable { class: DeviceClass::Accelerator },
        PipelineError::ContextCreationFailed(RuntimeError::InvalidGlobalWorkSize),
        PipelineError::QueueCreationFailed(RuntimeError::InvalidGlobalWorkSize),
        PipelineError::BuildFailed { log: "x".into() },
        PipelineError::KernelNotFound {
            name: "x".into(),
            source: RuntimeError::InvalidKernelName("x".into()),
        },
        PipelineError::InvalidArgument { index: 0, reason: "x".into() },
        PipelineError::AllocationFailed { size: 0, source: RuntimeError::InvalidBufferSize(0) },
        PipelineError::TransferFailed {
            direction: kernelpipe::accel::Direction::HostToDevice,
            reason: "x".into(),
        },
        PipelineError::QueryFailed(RuntimeError::InvalidGlobalWorkSize),
        PipelineError::LaunchFailed { reason: "x".into() },
    ];
    let mut names: Vec<String> = errors.iter().map(|e| e.stage().to_string()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), errors.len());
}

// ---------------------------------------------------------------------------
// Component-level behaviour
// ---------------------------------------------------------------------------

#[test]
fn test_rebinding_uses_the_latest_value() {
    let rt = HostRuntime::default();
    let device = Device::select(&rt, DeviceClass::Accelerator).unwrap();
    let context = Context::create(&device).unwrap();
    let queue = context.create_queue().unwrap();
    let program = Program::build(&context, kernelpipe::accel::ops::SQUARE_KERNEL_SOURCE).unwrap();
    let mut kernel = Kernel::extract(&program, "square").unwrap();

    let input = [1.0f32, 2.0, 3.0, 4.0];
    let mut input_buf = DeviceBuffer::for_f32(&context, 4, AccessMode::ReadOnly).unwrap();
    let output_buf = DeviceBuffer::for_f32(&context, 4, AccessMode::WriteOnly).unwrap();
    input_buf.write(&queue, &input).unwrap();

    SquareOp::bind(&mut kernel, &input_buf, &output_buf, 2).unwrap();
    kernel.bind_scalar(SquareOp::COUNT, 4u64).unwrap();

    dispatch::dispatch(&queue, &kernel, WorkPartition::padded(4, 4).unwrap()).unwrap();
    dispatch::wait(&queue).unwrap();
    let mut output = [0.0f32; 4];
    output_buf.read(&queue, &mut output).unwrap();
    assert_eq!(output, [1.0, 4.0, 9.0, 16.0]);
}

#[test]
fn test_non_dividing_partition_never_reaches_runtime() {
    let rt = FaultInjector::new(HostRuntime::default());
    {
        let device = Device::select(&rt, DeviceClass::Accelerator).unwrap();
        let context = Context::create(&device).unwrap();
        let queue = context.create_queue().unwrap();
        let program = Program::build(&context, kernelpipe::accel::ops::SQUARE_KERNEL_SOURCE).unwrap();
        let mut kernel = Kernel::extract(&program, "square").unwrap();
        let mut input_buf = DeviceBuffer::for_f32(&context, 6, AccessMode::ReadOnly).unwrap();
        let output_buf = DeviceBuffer::for_f32(&context, 6, AccessMode::WriteOnly).unwrap();
        input_buf.write(&queue, &[1.0; 6]).unwrap();
        SquareOp::bind(&mut kernel, &input_buf, &output_buf, 6).unwrap();

        let err = dispatch::dispatch(&queue, &kernel, WorkPartition::new(6, 4)).unwrap_err();
        assert!(matches!(err, PipelineError::LaunchFailed { .. }));
    }
    assert!(!rt.journal().contains(&RuntimeOp::EnqueueKernel));
    assert_eq!(rt.inner().live_objects(), 0);
}

#[test]
fn test_dispatch_rejects_unbound_arguments() {
    let rt = HostRuntime::default();
    let device = Device::select(&rt, DeviceClass::Accelerator).unwrap();
    let context = Context::create(&device).unwrap();
    let queue = context.create_queue().unwrap();
    let program = Program::build(&context, kernelpipe::accel::ops::SQUARE_KERNEL_SOURCE).unwrap();
    let kernel = Kernel::extract(&program, "square").unwrap();
    let err = dispatch::dispatch(&queue, &kernel, WorkPartition::new(4, 4)).unwrap_err();
    match err {
        PipelineError::LaunchFailed { reason } => assert!(reason.contains("argument 0"), "{reason}"),
        other => panic!("unexpected error: {other}"),
    }
}
