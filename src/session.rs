use chrono::{DateTime, Local};
use tracing::debug;

use crate::attempt::{AttemptOutcome, FlashAttempt};
use crate::controller::BatchState;
use crate::job::FlashJob;
use crate::report::{BatchReport, ResultReporter};

/// State of one batch run. Only the controller mutates it.
pub struct BatchSession {
    job: FlashJob,
    state: BatchState,
    transitions: Vec<BatchState>,
    reporter: ResultReporter,
    started_at: DateTime<Local>,
    devices_seen: usize,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    consecutive_tool_errors: u32,
    abort_reason: Option<String>,
}

impl BatchSession {
    pub fn new(job: FlashJob) -> Self {
        BatchSession {
            job,
            state: BatchState::Idle,
            transitions: vec![BatchState::Idle],
            reporter: ResultReporter::new(),
            started_at: Local::now(),
            devices_seen: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            consecutive_tool_errors: 0,
            abort_reason: None,
        }
    }

    pub fn job(&self) -> &FlashJob {
        &self.job
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn devices_seen(&self) -> usize {
        self.devices_seen
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn consecutive_tool_errors(&self) -> u32 {
        self.consecutive_tool_errors
    }

    pub(crate) fn transition(&mut self, next: BatchState) {
        debug!("Batch state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    /// Claim the next device number
    pub(crate) fn next_device(&mut self) -> usize {
        self.devices_seen += 1;
        self.devices_seen
    }

    pub(crate) fn record(&mut self, attempt: FlashAttempt) {
        self.reporter.record(attempt);
    }

    /// Count a device's outcome once its retries are exhausted
    pub(crate) fn finish_device(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Success => self.succeeded += 1,
            AttemptOutcome::Interrupted => self.skipped += 1,
            _ => self.failed += 1,
        }

        if outcome == AttemptOutcome::ToolError {
            self.consecutive_tool_errors += 1;
        } else {
            self.consecutive_tool_errors = 0;
        }
    }

    pub(crate) fn abort(&mut self, reason: String) {
        self.abort_reason = Some(reason);
        self.transition(BatchState::Aborted);
    }

    pub fn close(self) -> BatchReport {
        BatchReport {
            started_at: self.started_at,
            ended_at: Local::now(),
            final_state: self.state,
            transitions: self.transitions,
            abort_reason: self.abort_reason,
            summary: self.reporter.summary(),
        }
    }
}
