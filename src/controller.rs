use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::attempt::AttemptOutcome;
use crate::cancel::CancelToken;
use crate::constants::{
    DEFAULT_ABORT_AFTER, DEFAULT_DEVICE_WAIT_SECS, DEFAULT_DISCONNECT_TIMEOUT_SECS, MASKROM_HINT,
};
use crate::device::{DeviceSlot, SlotState};
use crate::error::{FlashError, FlashResult};
use crate::executor::FlashExecutor;
use crate::job::FlashJob;
use crate::monitor::{Departure, DeviceMonitor, Presence};
use crate::report::BatchReport;
use crate::session::BatchSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchState {
    Idle,
    AwaitingDevice,
    Flashing,
    /// A device failed for good; the batch carries on
    AttemptFailed,
    AwaitingDisconnect,
    Done,
    Aborted,
}

/// Which failures get another attempt on the same connection
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_verification: bool,
}

impl RetryPolicy {
    /// `attempts_made` counts the attempt that just produced `outcome`
    pub fn should_retry(&self, outcome: AttemptOutcome, attempts_made: u32) -> bool {
        let retryable = outcome.is_transient()
            || (self.retry_verification && outcome == AttemptOutcome::VerificationFailure);
        retryable && attempts_made <= self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub retry: RetryPolicy,
    /// Stop after this many devices
    pub device_limit: Option<usize>,
    /// How long to wait for the next device; `None` waits until interrupted
    pub device_wait: Option<Duration>,
    pub disconnect_timeout: Option<Duration>,
    /// Consecutive devices ending in tool errors before the batch is
    /// aborted as misconfigured. 0 disables.
    pub abort_after: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            retry: RetryPolicy::default(),
            device_limit: None,
            device_wait: Some(Duration::from_secs(DEFAULT_DEVICE_WAIT_SECS)),
            disconnect_timeout: Some(Duration::from_secs(DEFAULT_DISCONNECT_TIMEOUT_SECS)),
            abort_after: DEFAULT_ABORT_AFTER,
        }
    }
}

/// Drives the wait / flash / wait-for-unplug cycle, one device at a time
pub struct BatchController {
    monitor: DeviceMonitor,
    executor: FlashExecutor,
    config: BatchConfig,
    cancel: CancelToken,
    session: BatchSession,
}

impl BatchController {
    pub fn new(
        job: FlashJob,
        monitor: DeviceMonitor,
        executor: FlashExecutor,
        config: BatchConfig,
    ) -> Self {
        BatchController {
            monitor,
            executor,
            config,
            cancel: CancelToken::new(),
            session: BatchSession::new(job),
        }
    }

    /// Share an operator stop request with every wait of the batch
    pub fn cancel_token(&mut self, cancel: CancelToken) {
        self.monitor.cancel_token(cancel.clone());
        self.executor.cancel_token(cancel.clone());
        self.cancel = cancel;
    }

    pub fn session(&self) -> &BatchSession {
        &self.session
    }

    /// Run until the batch is done or aborted. Fatal errors end up in the
    /// report's abort reason.
    pub fn run(mut self) -> BatchReport {
        if let Err(e) = self.run_loop() {
            error!("Aborting batch: {}", e);
            self.session.abort(e.to_string());
        }

        let report = self.session.close();
        info!(
            "Batch finished: {} succeeded, {} failed, {} skipped",
            report.summary.succeeded, report.summary.failed, report.summary.skipped
        );
        report
    }

    fn run_loop(&mut self) -> FlashResult<()> {
        self.session.transition(BatchState::AwaitingDevice);

        loop {
            if let Some(limit) = self.config.device_limit {
                if self.session.devices_seen() >= limit {
                    info!("Device count target of {} reached", limit);
                    self.session.transition(BatchState::Done);
                    return Ok(());
                }
            }

            info!("Waiting for a device...");
            let mut slot = match self.monitor.wait_for_device(self.config.device_wait)? {
                Presence::Attached(slot) => slot,
                Presence::TimedOut => {
                    info!("No further device appeared, finishing batch");
                    if self.session.devices_seen() == 0 {
                        info!("{}", MASKROM_HINT);
                    }
                    self.session.transition(BatchState::Done);
                    return Ok(());
                }
                Presence::Interrupted => {
                    info!("Interrupted while waiting for a device");
                    self.session.transition(BatchState::Done);
                    return Ok(());
                }
            };

            slot.set_index(self.session.next_device());
            info!("Flashing device #{}: {}", slot.index(), slot);
            self.session.transition(BatchState::Flashing);

            let outcome = self.flash_device(&mut slot)?;
            self.session.finish_device(outcome);

            if outcome == AttemptOutcome::Interrupted {
                warn!(
                    "Device #{} was interrupted mid-flash and may not boot",
                    slot.index()
                );
                self.session.transition(BatchState::Done);
                return Ok(());
            }

            if !outcome.is_success() {
                self.session.transition(BatchState::AttemptFailed);
                if outcome == AttemptOutcome::ToolError {
                    info!("{}", MASKROM_HINT);
                }
                let abort_after = self.config.abort_after;
                if abort_after > 0 && self.session.consecutive_tool_errors() >= abort_after {
                    return Err(FlashError::Configuration(format!(
                        "{} devices in a row failed with tool errors; check the tool and its arguments",
                        abort_after
                    )));
                }
            }

            self.session.transition(BatchState::AwaitingDisconnect);
            info!("Waiting for device #{} to disconnect...", slot.index());
            match self
                .monitor
                .wait_for_disconnect(&slot, self.config.disconnect_timeout)?
            {
                Departure::Disconnected => slot.set_state(SlotState::Released),
                Departure::TimedOut => warn!(
                    "Device #{} ({}) did not disconnect; it will be skipped until it is unplugged",
                    slot.index(),
                    slot.id()
                ),
                Departure::Interrupted => {
                    self.session.transition(BatchState::Done);
                    return Ok(());
                }
            }

            self.session.transition(BatchState::AwaitingDevice);
        }
    }

    /// Flash one device, retrying on the same connection as the policy
    /// allows. Returns the final outcome.
    fn flash_device(&mut self, slot: &mut DeviceSlot) -> FlashResult<AttemptOutcome> {
        let mut number = 1;
        loop {
            let attempt = self.executor.run(self.session.job(), slot, number)?;
            let outcome = attempt.outcome();
            self.session.record(attempt);

            if self.cancel.is_cancelled() || !self.config.retry.should_retry(outcome, number) {
                return Ok(outcome);
            }

            info!(
                "Retrying device #{} after {} ({}/{})",
                slot.index(),
                outcome,
                number,
                self.config.retry.max_retries
            );
            number += 1;
        }
    }
}
