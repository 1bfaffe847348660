use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use batchflash::{
    BatchConfig, BatchController, Board, CancelToken, FlashExecutor, FlashJob, RetryPolicy,
    ScannerBackend, SubprocessRunner, ToolProfile, UsbSignature,
    boards::signatures_for_board,
    constants::{
        DEFAULT_ABORT_AFTER, DEFAULT_ATTEMPT_TIMEOUT_SECS, DEFAULT_DEVICE_WAIT_SECS,
        DEFAULT_DISCONNECT_TIMEOUT_SECS, DEFAULT_SETTLE_MS,
    },
    error::{FlashError, FlashResult},
    monitor::{DeviceMonitor, scanner_for_backend},
};
use clap::Parser;
use tracing::{error, warn};

#[derive(Parser, Debug, Clone)]
pub(crate) struct FlashOptions {
    /// Directory holding the loader and image files
    #[clap(short = 'd', long)]
    image_dir: PathBuf,

    /// Loader file, relative to the image directory
    #[clap(short, long)]
    loader: Option<PathBuf>,

    /// OS image file, relative to the image directory
    #[clap(short, long)]
    image: Option<PathBuf>,

    /// Board type
    #[clap(short, long, value_enum, default_value_t = Board::Rk3566)]
    board: Board,

    /// Extra bootloader-mode USB id (VID:PID, hex), may be repeated
    #[clap(long = "usb-id")]
    usb_ids: Vec<UsbSignature>,

    /// Flashing tool whose default steps are used
    #[clap(long, value_enum, default_value_t = ToolProfile::UpgradeTool)]
    profile: ToolProfile,

    /// Path of the flashing tool, defaults to the profile's program
    #[clap(long)]
    tool: Option<String>,

    /// Custom tool arguments, replaces the profile's steps. May be repeated;
    /// e.g. --step "wl 0 {image}"
    #[clap(long = "step", allow_hyphen_values = true)]
    steps: Vec<String>,

    /// Per-device timeout in seconds
    #[clap(short, long, default_value_t = DEFAULT_ATTEMPT_TIMEOUT_SECS)]
    timeout: u64,

    /// Retries per device after a timeout or tool error
    #[clap(short = 'r', long, default_value_t = 0)]
    max_retries: u32,

    /// Also retry verification failures
    #[clap(long, default_value_t = false)]
    retry_verification: bool,

    /// Stop after this many devices
    #[clap(short = 'n', long)]
    count: Option<usize>,

    /// Seconds to wait for the next device before finishing, 0 waits forever
    #[clap(short, long, default_value_t = DEFAULT_DEVICE_WAIT_SECS)]
    wait: u64,

    /// Seconds to wait for a flashed device to go away, 0 waits forever
    #[clap(long, default_value_t = DEFAULT_DISCONNECT_TIMEOUT_SECS)]
    disconnect_timeout: u64,

    /// How long a device has to stay enumerated before it is flashed
    #[clap(long, default_value_t = DEFAULT_SETTLE_MS)]
    settle_ms: u64,

    /// Abort after this many devices in a row fail with tool errors, 0 never
    #[clap(long, default_value_t = DEFAULT_ABORT_AFTER)]
    abort_after: u32,

    /// How attached devices are discovered
    #[clap(long, value_enum, default_value_t = ScannerBackend::Usb)]
    backend: ScannerBackend,

    /// Write a JSON report here
    #[clap(long)]
    report: Option<PathBuf>,

    #[clap(long, default_value_t = false)]
    no_progress: bool,
}

fn wait_limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn build_job(opts: &FlashOptions) -> FlashResult<FlashJob> {
    let program = opts
        .tool
        .clone()
        .unwrap_or_else(|| opts.profile.default_program().to_string());

    let steps = if opts.steps.is_empty() {
        opts.profile.default_steps()
    } else {
        opts.steps
            .iter()
            .map(|step| step.split_whitespace().map(str::to_owned).collect())
            .collect()
    };

    let mut builder = FlashJob::builder(program, &opts.image_dir).steps(steps);
    if let Some(loader) = &opts.loader {
        builder = builder.file("loader", loader);
    }
    if let Some(image) = &opts.image {
        builder = builder.file("image", image);
    }

    builder.build()
}

pub(crate) fn handle_flashing(opts: FlashOptions) -> FlashResult<ExitCode> {
    let mut signatures = signatures_for_board(opts.board);
    signatures.extend(opts.usb_ids.iter().copied());
    if signatures.is_empty() {
        return Err(FlashError::Configuration(
            "No USB ids to look for; pass --usb-id with a custom board".to_string(),
        ));
    }

    let job = build_job(&opts)?;
    let cancel = CancelToken::from_ctrlc()?;

    let mut monitor = DeviceMonitor::new(scanner_for_backend(opts.backend), signatures);
    monitor.settle_window(Duration::from_millis(opts.settle_ms));
    if !job.selects_device() {
        warn!(
            "{} is not told which device to flash; boards are only flashed while one is attached",
            job.program()
        );
        monitor.exclusive(true);
    }

    let mut executor = FlashExecutor::new(Box::new(SubprocessRunner::new()));
    executor.attempt_timeout(Duration::from_secs(opts.timeout));
    executor.progress_bar(!opts.no_progress);

    let config = BatchConfig {
        retry: RetryPolicy {
            max_retries: opts.max_retries,
            retry_verification: opts.retry_verification,
        },
        device_limit: opts.count,
        device_wait: wait_limit(opts.wait),
        disconnect_timeout: wait_limit(opts.disconnect_timeout),
        abort_after: opts.abort_after,
    };

    let mut controller = BatchController::new(job, monitor, executor, config);
    controller.cancel_token(cancel);
    let report = controller.run();

    println!("\n{}", report);

    if let Some(path) = &opts.report {
        if let Err(e) = report.write_json(path) {
            error!("{}", e);
        }
    }

    Ok(ExitCode::from(report.exit_code()))
}
