use std::fs;
use std::thread;
use std::time::Duration;

use batchflash::sim::{Script, ScriptedRunner, SimulatedBus};
use batchflash::{
    AttemptOutcome, BatchConfig, BatchController, BatchReport, BatchState, CancelToken,
    DeviceInfo, DeviceMonitor, DeviceSlot, FlashExecutor, FlashJob, RetryPolicy, ToolRunner,
    UsbSignature,
};

const VID: u16 = 0x2207;
const PID: u16 = 0x350a;

fn job(dir: &tempfile::TempDir) -> FlashJob {
    fs::write(dir.path().join("os.img"), b"image").unwrap();
    FlashJob::builder("upgrade_tool", dir.path())
        .file("image", "os.img")
        .step(["wl", "0", "{image}"])
        .build()
        .unwrap()
}

fn run_batch(
    bus: &SimulatedBus,
    runner: impl ToolRunner + 'static,
    config: BatchConfig,
) -> BatchReport {
    let dir = tempfile::tempdir().unwrap();
    let mut monitor = DeviceMonitor::new(Box::new(bus.clone()), vec![UsbSignature::new(VID, PID)]);
    monitor.settle_window(Duration::ZERO);
    monitor.poll_interval(Duration::from_millis(1));

    let mut executor = FlashExecutor::new(Box::new(runner));
    executor.attempt_timeout(Duration::from_secs(5));

    BatchController::new(job(&dir), monitor, executor, config).run()
}

fn config(max_retries: u32) -> BatchConfig {
    BatchConfig {
        retry: RetryPolicy {
            max_retries,
            retry_verification: false,
        },
        device_wait: Some(Duration::from_millis(50)),
        disconnect_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    }
}

#[test]
fn three_devices_all_succeed() {
    let bus = SimulatedBus::with_boards(3, VID, PID);
    let runner = ScriptedRunner::new().unplugs_from(bus.clone());

    let report = run_batch(&bus, runner.clone(), config(0));

    assert_eq!(report.final_state, BatchState::Done);
    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(report.summary.devices.len(), 3);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(runner.calls(), vec!["1-1", "1-2", "1-3"]);
    assert!(report.to_string().contains("3/3 devices succeeded"));
}

#[test]
fn every_attachment_gets_exactly_one_attempt_on_its_own_slot() {
    for n in [0usize, 1, 4, 7] {
        let bus = SimulatedBus::with_boards(n, VID, PID);
        let runner = ScriptedRunner::new().unplugs_from(bus.clone());
        let report = run_batch(&bus, runner, config(0));

        let attempts = &report.summary.attempts;
        assert_eq!(attempts.len(), n);
        let mut indices: Vec<usize> = attempts.iter().map(|a| a.device_index()).collect();
        indices.dedup();
        assert_eq!(indices, (1..=n).collect::<Vec<_>>());
        assert_eq!(bus.pending(), 0);
    }
}

#[test]
fn flapping_devices_are_flashed_once_and_never_concurrently() {
    let bus = SimulatedBus::new();
    for i in 1..=4 {
        bus.queue_flapping(
            DeviceInfo {
                id: format!("1-{}", i),
                vid: VID,
                pid: PID,
                bus: 1,
                address: i as u8 + 1,
                serial: None,
            },
            5,
        );
    }
    let runner = ScriptedRunner::new()
        .unplugs_from(bus.clone())
        .delay(Duration::from_millis(5));

    let dir = tempfile::tempdir().unwrap();
    let mut monitor = DeviceMonitor::new(Box::new(bus.clone()), vec![UsbSignature::new(VID, PID)]);
    monitor.settle_window(Duration::from_millis(3));
    monitor.poll_interval(Duration::from_millis(1));
    let executor = FlashExecutor::new(Box::new(runner.clone()));
    let report = BatchController::new(job(&dir), monitor, executor, config(0)).run();

    assert_eq!(report.summary.succeeded, 4);
    assert_eq!(runner.calls().len(), 4);
    assert_eq!(runner.max_in_flight(), 1);
}

#[test]
fn executors_on_separate_threads_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(&dir);
    let runner = ScriptedRunner::new().delay(Duration::from_millis(30));

    let workers: Vec<_> = (1..=2)
        .map(|i| {
            let job = job.clone();
            let runner = runner.clone();
            thread::spawn(move || {
                let executor = FlashExecutor::new(Box::new(runner));
                let mut slot = DeviceSlot::new(DeviceInfo {
                    id: format!("{}-1", i),
                    vid: VID,
                    pid: PID,
                    bus: i,
                    address: 2,
                    serial: None,
                });
                for number in 1..=3 {
                    executor.run(&job, &mut slot, number).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(runner.calls().len(), 6);
    assert_eq!(runner.max_in_flight(), 1);
}

#[test]
fn interrupt_while_waiting_ends_the_batch_cleanly() {
    let bus = SimulatedBus::new();
    let dir = tempfile::tempdir().unwrap();
    let mut monitor = DeviceMonitor::new(Box::new(bus), vec![UsbSignature::new(VID, PID)]);
    monitor.poll_interval(Duration::from_millis(1));
    let executor = FlashExecutor::new(Box::new(ScriptedRunner::new()));

    let mut controller = BatchController::new(job(&dir), monitor, executor, config(0));
    let cancel = CancelToken::new();
    controller.cancel_token(cancel.clone());
    cancel.cancel();
    let report = controller.run();

    assert_eq!(
        report.transitions,
        vec![BatchState::Idle, BatchState::AwaitingDevice, BatchState::Done]
    );
    assert!(report.summary.attempts.is_empty());
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn interrupt_mid_flash_skips_the_device_and_stops() {
    let bus = SimulatedBus::with_boards(2, VID, PID);
    let runner = ScriptedRunner::new()
        .unplugs_from(bus.clone())
        .delay(Duration::from_millis(300));

    let dir = tempfile::tempdir().unwrap();
    let mut monitor = DeviceMonitor::new(Box::new(bus.clone()), vec![UsbSignature::new(VID, PID)]);
    monitor.settle_window(Duration::ZERO);
    monitor.poll_interval(Duration::from_millis(1));
    let executor = FlashExecutor::new(Box::new(runner.clone()));

    let mut controller = BatchController::new(job(&dir), monitor, executor, config(3));
    let cancel = CancelToken::new();
    controller.cancel_token(cancel.clone());

    let operator = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };
    let report = controller.run();
    operator.join().unwrap();

    assert_eq!(
        report.transitions,
        vec![
            BatchState::Idle,
            BatchState::AwaitingDevice,
            BatchState::Flashing,
            BatchState::Done
        ]
    );
    assert_eq!(runner.calls(), vec!["1-1"]);
    assert_eq!(report.summary.attempts[0].outcome(), AttemptOutcome::Interrupted);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.failed, 0);
    assert_eq!(report.final_state, BatchState::Done);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn tool_error_then_success_is_retried_on_the_same_slot() {
    let bus = SimulatedBus::with_boards(1, VID, PID);
    let runner = ScriptedRunner::new()
        .unplugs_from(bus.clone())
        .script("1-1", vec![Script::fail("Download Boot Fail"), Script::ok()]);

    let report = run_batch(&bus, runner, config(1));

    let device = &report.summary.devices[0];
    assert_eq!(device.outcome, AttemptOutcome::Success);
    assert_eq!(device.attempts, 2);
    let outcomes: Vec<_> = report
        .summary
        .attempts_for(1)
        .map(|a| a.outcome())
        .collect();
    assert_eq!(outcomes, vec![AttemptOutcome::ToolError, AttemptOutcome::Success]);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn verification_failure_is_not_retried() {
    let bus = SimulatedBus::with_boards(1, VID, PID);
    let runner = ScriptedRunner::new()
        .unplugs_from(bus.clone())
        .script("1-1", vec![Script::fail("Write LBA failed!"), Script::ok()]);

    let report = run_batch(&bus, runner.clone(), config(3));

    assert_eq!(runner.calls().len(), 1);
    assert_eq!(
        report.summary.devices[0].outcome,
        AttemptOutcome::VerificationFailure
    );
    assert!(report.transitions.contains(&BatchState::AttemptFailed));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn device_two_times_out_twice() {
    let bus = SimulatedBus::with_boards(3, VID, PID);
    let runner = ScriptedRunner::new()
        .unplugs_from(bus.clone())
        .script("1-2", vec![Script::Timeout, Script::Timeout]);

    let report = run_batch(&bus, runner.clone(), config(1));

    let outcomes: Vec<_> = report.summary.devices.iter().map(|d| d.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Success,
            AttemptOutcome::Timeout,
            AttemptOutcome::Success
        ]
    );
    assert_eq!(report.summary.devices[1].attempts, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(runner.live_processes(), 0);
    assert_ne!(report.exit_code(), 0);
}

#[test]
fn missing_tool_aborts_before_any_device_is_flashed() {
    let bus = SimulatedBus::with_boards(3, VID, PID);
    let runner = ScriptedRunner::new().script("1-1", vec![Script::Missing]);

    let report = run_batch(&bus, runner.clone(), config(2));

    assert_eq!(report.final_state, BatchState::Aborted);
    assert!(report.abort_reason.as_deref().unwrap().contains("upgrade_tool"));
    assert!(report.summary.attempts.is_empty());
    assert!(runner.calls().is_empty());
    assert_eq!(report.exit_code(), 2);
}

#[test]
fn repeated_tool_errors_abort_the_batch() {
    let bus = SimulatedBus::with_boards(5, VID, PID);
    let mut runner = ScriptedRunner::new().unplugs_from(bus.clone());
    for i in 1..=5 {
        runner = runner.script(&format!("1-{}", i), vec![Script::fail("error")]);
    }
    let mut cfg = config(0);
    cfg.abort_after = 2;

    let report = run_batch(&bus, runner, cfg);

    assert_eq!(report.final_state, BatchState::Aborted);
    assert_eq!(report.summary.attempts.len(), 2);
}

#[test]
fn device_limit_ends_the_batch() {
    let bus = SimulatedBus::with_boards(5, VID, PID);
    let runner = ScriptedRunner::new().unplugs_from(bus.clone());
    let mut cfg = config(0);
    cfg.device_limit = Some(2);

    let report = run_batch(&bus, runner, cfg);

    assert_eq!(report.summary.devices.len(), 2);
    assert_eq!(report.final_state, BatchState::Done);
}

#[test]
fn device_that_stays_plugged_in_is_not_flashed_twice() {
    let bus = SimulatedBus::with_boards(1, VID, PID);
    // No unplugging: the board stays attached after flashing
    let runner = ScriptedRunner::new();

    let report = run_batch(&bus, runner.clone(), config(0));

    assert_eq!(runner.calls().len(), 1);
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn state_machine_walks_the_expected_path() {
    let bus = SimulatedBus::with_boards(1, VID, PID);
    let runner = ScriptedRunner::new().unplugs_from(bus.clone());

    let report = run_batch(&bus, runner, config(0));

    assert_eq!(
        report.transitions,
        vec![
            BatchState::Idle,
            BatchState::AwaitingDevice,
            BatchState::Flashing,
            BatchState::AwaitingDisconnect,
            BatchState::AwaitingDevice,
            BatchState::Done,
        ]
    );
}

#[cfg(unix)]
#[test]
fn wedged_tool_is_killed_and_reported_as_timeout() {
    use batchflash::SubprocessRunner;

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("os.img"), b"image").unwrap();
    // The real work happens in a grandchild, the way `sudo upgrade_tool` runs
    let marker = dir.path().join("still-writing");
    let script = format!(
        "echo writing {{image}}; sh -c 'sleep 1; touch {}'; true",
        marker.display()
    );
    let job = FlashJob::builder("/bin/sh", dir.path())
        .file("image", "os.img")
        .step(["-c".to_string(), script])
        .build()
        .unwrap();

    let bus = SimulatedBus::with_boards(1, VID, PID);
    let mut monitor = DeviceMonitor::new(Box::new(bus.clone()), vec![UsbSignature::new(VID, PID)]);
    monitor.settle_window(Duration::ZERO);
    monitor.poll_interval(Duration::from_millis(1));
    let mut executor = FlashExecutor::new(Box::new(SubprocessRunner::new()));
    executor.attempt_timeout(Duration::from_millis(300));

    let report = BatchController::new(job, monitor, executor, config(0)).run();

    let attempt = &report.summary.attempts[0];
    assert_eq!(attempt.outcome(), AttemptOutcome::Timeout);
    assert!(attempt.output().contains("writing"));
    assert!(attempt.duration() < Duration::from_secs(10));
    assert_eq!(report.exit_code(), 1);

    std::thread::sleep(Duration::from_millis(1500));
    assert!(!marker.exists());
}
