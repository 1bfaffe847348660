use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::device::{DeviceInfo, DeviceSlot};

/// Lowercase output markers that mean the image did not land intact.
/// Only failure phrases: tools also print "checksum" or "verify" on
/// their way to a successful write.
const VERIFICATION_MARKERS: [&str; 6] = [
    "write lba failed",
    "verify failed",
    "verification failed",
    "checksum error",
    "checksum mismatch",
    "crc error",
];

/// Lowercase output markers for a failed session that may succeed on retry
const TOOL_ERROR_MARKERS: [&str; 6] = [
    "download boot fail",
    "nack",
    "connection lost",
    "no found rockusb",
    "creating comm object failed",
    "test device fail",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    VerificationFailure,
    Timeout,
    ToolError,
    /// Stopped by the operator
    Interrupted,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }

    /// Outcomes that may go away with another attempt on the same device
    pub fn is_transient(&self) -> bool {
        matches!(self, AttemptOutcome::Timeout | AttemptOutcome::ToolError)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::VerificationFailure => "verification-failure",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::ToolError => "tool-error",
            AttemptOutcome::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// How a single tool process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl ToolOutput {
    pub fn exited(exit_code: i32, output: impl Into<String>) -> Self {
        ToolOutput {
            exit_code: Some(exit_code),
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn timed_out(output: impl Into<String>) -> Self {
        ToolOutput {
            output: output.into(),
            timed_out: true,
            ..Default::default()
        }
    }

    /// Classify by termination reason first, then by output markers, then
    /// by exit code. Some tools exit 0 after printing a failure.
    pub fn classify(&self) -> AttemptOutcome {
        if self.interrupted {
            return AttemptOutcome::Interrupted;
        }
        if self.timed_out {
            return AttemptOutcome::Timeout;
        }

        let output = self.output.to_lowercase();
        if VERIFICATION_MARKERS.iter().any(|m| output.contains(m)) {
            return AttemptOutcome::VerificationFailure;
        }
        if TOOL_ERROR_MARKERS.iter().any(|m| output.contains(m)) {
            return AttemptOutcome::ToolError;
        }

        match self.exit_code {
            Some(0) => AttemptOutcome::Success,
            _ => AttemptOutcome::ToolError,
        }
    }
}

/// An attempt whose tool session is still running
#[derive(Debug)]
pub struct PendingAttempt {
    device: DeviceInfo,
    device_index: usize,
    number: u32,
    started_at: DateTime<Local>,
    started: Instant,
}

impl PendingAttempt {
    pub fn start(slot: &DeviceSlot, number: u32) -> Self {
        PendingAttempt {
            device: slot.info.clone(),
            device_index: slot.index(),
            number,
            started_at: Local::now(),
            started: Instant::now(),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Consumes the pending attempt, so an outcome can only be set once
    pub fn finalize(
        self,
        exit_code: Option<i32>,
        output: String,
        outcome: AttemptOutcome,
    ) -> FlashAttempt {
        FlashAttempt {
            device: self.device,
            device_index: self.device_index,
            number: self.number,
            started_at: self.started_at,
            ended_at: Local::now(),
            duration: self.started.elapsed(),
            exit_code,
            output,
            outcome,
        }
    }
}

/// A finished run of the flashing tool against one device
#[derive(Debug, Clone, Serialize)]
pub struct FlashAttempt {
    device: DeviceInfo,
    device_index: usize,
    number: u32,
    started_at: DateTime<Local>,
    ended_at: DateTime<Local>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    duration: Duration,
    exit_code: Option<i32>,
    output: String,
    outcome: AttemptOutcome,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl FlashAttempt {
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// 1-based position of the device within the batch
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// 1-based attempt number for this device
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Local> {
        self.ended_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }
}
