use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::FlashError;

/// USB vendor/product pair a board exposes in bootloader mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct UsbSignature {
    pub vid: u16,
    pub pid: u16,
}

impl UsbSignature {
    pub const fn new(vid: u16, pid: u16) -> Self {
        UsbSignature { vid, pid }
    }

    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

impl fmt::Display for UsbSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Parses `VID:PID` in hex, with or without a `0x` prefix
impl FromStr for UsbSignature {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s.split_once(':').ok_or_else(|| {
            FlashError::Configuration(format!("Expected VID:PID, got {:?}", s))
        })?;

        let parse = |part: &str| {
            let part = part.trim();
            let digits = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            u16::from_str_radix(digits, 16).map_err(|e| {
                FlashError::Configuration(format!("Invalid USB id {:?} in {:?}: {}", part, s, e))
            })
        };

        Ok(UsbSignature::new(parse(vid)?, parse(pid)?))
    }
}

/// One entry of a USB enumeration pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Stable identity of the attachment point, e.g. `1-3.2`
    pub id: String,
    pub vid: u16,
    pub pid: u16,
    pub bus: u8,
    pub address: u8,
    pub serial: Option<String>,
}

impl DeviceInfo {
    /// Rockchip tools identify devices by `(bus << 8) | address`
    pub fn location_id(&self) -> u32 {
        ((self.bus as u32) << 8) | self.address as u32
    }

    pub fn signature(&self) -> UsbSignature {
        UsbSignature::new(self.vid, self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotState {
    Detected,
    Flashing,
    Flashed,
    Released,
}

/// A debounced device the batch is working on
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSlot {
    pub info: DeviceInfo,
    pub detected_at: DateTime<Local>,
    index: usize,
    state: SlotState,
}

impl DeviceSlot {
    pub fn new(info: DeviceInfo) -> Self {
        DeviceSlot {
            info,
            detected_at: Local::now(),
            index: 0,
            state: SlotState::Detected,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// 1-based position within the batch; 0 until the batch claims it.
    /// The same port can host several boards over a batch, so this, not
    /// the id, tells devices apart.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] location {}",
            self.info.id,
            self.info.signature(),
            self.info.location_id()
        )
    }
}
