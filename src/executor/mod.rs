pub mod process;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::attempt::{AttemptOutcome, FlashAttempt, PendingAttempt, ToolOutput};
use crate::cancel::CancelToken;
use crate::constants::DEFAULT_ATTEMPT_TIMEOUT_SECS;
use crate::device::{DeviceSlot, SlotState};
use crate::error::FlashResult;
use crate::job::{FlashJob, ToolInvocation};
use crate::util::StepProgress;

/// Host-wide execution slot. The bootloader protocol cannot share the bus,
/// so tool sessions are serialized even across executors.
static EXECUTION_SLOT: Mutex<()> = Mutex::new(());

/// The protocol boundary to the external flashing tool
pub trait ToolRunner {
    /// Run one invocation until it exits, `timeout` passes or `cancel`
    /// trips. Every output line is handed to `on_line` as it arrives.
    ///
    /// Returns an error only when the tool could not be started at all.
    fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> FlashResult<ToolOutput>;
}

/// Runs a [`FlashJob`]'s steps against one device and classifies the result
pub struct FlashExecutor {
    runner: Box<dyn ToolRunner>,
    timeout: Duration,
    cancel: CancelToken,
    progress_bar_enable: bool,
}

impl FlashExecutor {
    pub fn new(runner: Box<dyn ToolRunner>) -> Self {
        FlashExecutor {
            runner,
            timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            cancel: CancelToken::new(),
            progress_bar_enable: false,
        }
    }

    /// Wall-clock budget for all steps of one attempt
    pub fn attempt_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn progress_bar(&mut self, enable: bool) {
        self.progress_bar_enable = enable;
    }

    /// Run every step of `job` in order, stopping at the first one that
    /// does not succeed. The attempt carries the output of all steps run.
    pub fn run(
        &self,
        job: &FlashJob,
        slot: &mut DeviceSlot,
        attempt_number: u32,
    ) -> FlashResult<FlashAttempt> {
        let _slot_guard = EXECUTION_SLOT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        slot.set_state(SlotState::Flashing);
        let pending = PendingAttempt::start(slot, attempt_number);
        let started = Instant::now();

        let invocations = job.invocations(slot);
        let total = invocations.len();
        let mut output = String::new();
        let mut exit_code = None;
        let mut outcome = AttemptOutcome::Success;

        for (i, invocation) in invocations.iter().enumerate() {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                outcome = AttemptOutcome::Timeout;
                break;
            }

            debug!(
                "Device {} step {}/{}: {}",
                slot.id(),
                i + 1,
                total,
                invocation.command_line()
            );

            let progress = self.progress_bar_enable.then(|| {
                let progress =
                    StepProgress::new(&format!("{} step {}/{}", slot.id(), i + 1, total));
                progress.enable_steady_tick(Duration::from_millis(120));
                progress
            });

            let result = self.runner.run(invocation, remaining, &self.cancel, &mut |line: &str| {
                trace!("{}", line);
                if let Some(progress) = &progress {
                    progress.update(line);
                }
            });

            if let Some(progress) = &progress {
                progress.finish();
            }

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    // The tool never ran against this device
                    slot.set_state(SlotState::Detected);
                    return Err(e);
                }
            };
            output.push_str(&result.output);
            exit_code = result.exit_code;
            outcome = result.classify();

            if !outcome.is_success() {
                break;
            }
        }

        slot.set_state(SlotState::Flashed);
        Ok(pending.finalize(exit_code, output, outcome))
    }
}
