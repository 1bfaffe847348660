use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info};

use crate::attempt::{AttemptOutcome, FlashAttempt};
use crate::controller::BatchState;
use crate::device::DeviceInfo;
use crate::error::{FlashError, FlashResult};

/// Collects attempts in the order they finish. Nothing recorded is ever
/// changed afterwards.
#[derive(Debug, Default)]
pub struct ResultReporter {
    attempts: Vec<FlashAttempt>,
}

impl ResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, attempt: FlashAttempt) {
        let line = format!(
            "Device #{} ({}) attempt {}: {} after {:.1}s",
            attempt.device_index(),
            attempt.device().id,
            attempt.number(),
            attempt.outcome(),
            attempt.duration().as_secs_f64()
        );
        if attempt.outcome().is_success() {
            info!("{}", line);
        } else {
            error!("{}", line);
        }
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[FlashAttempt] {
        &self.attempts
    }

    pub fn summary(&self) -> BatchSummary {
        let mut devices: Vec<DeviceResult> = Vec::new();
        let mut outcome_totals = BTreeMap::new();

        for attempt in &self.attempts {
            *outcome_totals.entry(attempt.outcome().to_string()).or_insert(0) += 1;

            match devices
                .iter_mut()
                .find(|d| d.index == attempt.device_index())
            {
                Some(device) => {
                    device.attempts += 1;
                    device.outcome = attempt.outcome();
                    device.duration += attempt.duration();
                }
                None => devices.push(DeviceResult {
                    index: attempt.device_index(),
                    device: attempt.device().clone(),
                    attempts: 1,
                    outcome: attempt.outcome(),
                    duration: attempt.duration(),
                }),
            }
        }

        let count = |f: fn(&AttemptOutcome) -> bool| {
            devices.iter().filter(|d| f(&d.outcome)).count()
        };
        let succeeded = count(|o| o.is_success());
        let skipped = count(|o| *o == AttemptOutcome::Interrupted);
        let failed = devices.len() - succeeded - skipped;

        BatchSummary {
            succeeded,
            failed,
            skipped,
            outcome_totals,
            devices,
            attempts: self.attempts.clone(),
        }
    }
}

/// Final result for one device, after retries
#[derive(Debug, Clone, Serialize)]
pub struct DeviceResult {
    pub index: usize,
    pub device: DeviceInfo,
    pub attempts: u32,
    pub outcome: AttemptOutcome,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Attempt counts keyed by outcome name
    pub outcome_totals: BTreeMap<String, usize>,
    pub devices: Vec<DeviceResult>,
    pub attempts: Vec<FlashAttempt>,
}

impl BatchSummary {
    pub fn attempts_for(&self, device_index: usize) -> impl Iterator<Item = &FlashAttempt> {
        self.attempts
            .iter()
            .filter(move |a| a.device_index() == device_index)
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>3}  {:<16} {:<10} {:>7}  {:<21} {:>5}  {:>9}",
            "#", "Device", "USB id", "Attempt", "Outcome", "Exit", "Duration"
        )?;
        for a in &self.attempts {
            let exit = a
                .exit_code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:>3}  {:<16} {:<10} {:>7}  {:<21} {:>5}  {:>8.1}s",
                a.device_index(),
                a.device().id,
                a.device().signature().to_string(),
                a.number(),
                a.outcome().to_string(),
                exit,
                a.duration().as_secs_f64()
            )?;
        }
        writeln!(f)?;

        let failed: Vec<String> = self
            .devices
            .iter()
            .filter(|d| !d.outcome.is_success() && d.outcome != AttemptOutcome::Interrupted)
            .map(|d| format!("#{} ({})", d.index, d.device.id))
            .collect();

        write!(
            f,
            "{}/{} devices succeeded, {} failed, {} skipped",
            self.succeeded,
            self.devices.len(),
            self.failed,
            self.skipped
        )?;
        if !failed.is_empty() {
            write!(f, "\nFailed: {}", failed.join(", "))?;
        }
        Ok(())
    }
}

/// Everything a finished batch produced
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub final_state: BatchState,
    pub transitions: Vec<BatchState>,
    pub abort_reason: Option<String>,
    pub summary: BatchSummary,
}

impl BatchReport {
    /// 0 when every device succeeded, 1 when a device failed for good,
    /// 2 when the batch was aborted
    pub fn exit_code(&self) -> u8 {
        if self.final_state == BatchState::Aborted {
            2
        } else if self.summary.failed > 0 {
            1
        } else {
            0
        }
    }

    pub fn write_json(&self, path: &Path) -> FlashResult<()> {
        let file = File::create(path).map_err(|e| {
            FlashError::Report(format!("Could not create {}: {}", path.display(), e))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| FlashError::Report(format!("{:?}", e)))?;
        Ok(())
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary)?;
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "Batch aborted: {}", reason)?;
        }
        Ok(())
    }
}
