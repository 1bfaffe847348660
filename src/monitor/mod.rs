pub mod serialport;
pub mod usb;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::constants::{DEFAULT_SETTLE_MS, POLL_INTERVAL_MS};
use crate::device::{DeviceInfo, DeviceSlot, UsbSignature};
use crate::error::FlashResult;

/// Source of USB enumeration snapshots
pub trait UsbScanner {
    /// List every device currently attached. Filtering by signature is
    /// done by the monitor.
    fn scan(&self) -> FlashResult<Vec<DeviceInfo>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScannerBackend {
    /// Raw USB enumeration, for maskrom/loader devices
    Usb,

    /// USB serial ports, for bootloaders that enumerate as CDC-ACM
    Serial,
}

pub fn scanner_for_backend(backend: ScannerBackend) -> Box<dyn UsbScanner> {
    match backend {
        ScannerBackend::Usb => Box::new(usb::NusbScanner),
        ScannerBackend::Serial => Box::new(serialport::SerialPortScanner),
    }
}

#[derive(Debug)]
pub enum Presence {
    Attached(DeviceSlot),
    TimedOut,
    Interrupted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Departure {
    Disconnected,
    TimedOut,
    Interrupted,
}

/// Polls a [`UsbScanner`] for devices matching a signature set.
///
/// Arrivals and departures are debounced: a device has to be seen (or
/// missed) on every poll for the whole settle window before it counts.
/// Devices that were already handed out stay ignored until they are seen
/// gone, so a board the operator has not unplugged yet is never flashed
/// twice. A handed-out device is only forgotten once it has been missing
/// for the settle window too, so a board that re-enumerates during a reset
/// keeps its place.
pub struct DeviceMonitor {
    scanner: Box<dyn UsbScanner>,
    signatures: Vec<UsbSignature>,
    settle: Duration,
    poll_interval: Duration,
    cancel: CancelToken,
    exclusive: bool,
    /// Handed-out devices, with the time each was first seen missing
    handled: HashMap<String, Option<Instant>>,
}

impl DeviceMonitor {
    pub fn new(scanner: Box<dyn UsbScanner>, signatures: Vec<UsbSignature>) -> Self {
        DeviceMonitor {
            scanner,
            signatures,
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            cancel: CancelToken::new(),
            exclusive: false,
            handled: HashMap::new(),
        }
    }

    pub fn settle_window(&mut self, settle: Duration) {
        self.settle = settle;
    }

    pub fn poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Only hand out a device while it is the sole matching one attached.
    /// For tools that cannot be told which device to flash.
    pub fn exclusive(&mut self, exclusive: bool) {
        self.exclusive = exclusive;
    }

    /// Attached devices that match one of the signatures
    pub fn matching_devices(&self) -> FlashResult<Vec<DeviceInfo>> {
        let devices = self.scanner.scan()?;
        trace!("Scan returned {} devices", devices.len());

        Ok(devices
            .into_iter()
            .filter(|d| self.signatures.iter().any(|s| s.matches(d.vid, d.pid)))
            .collect())
    }

    /// Block until a new matching device has been stable for the settle
    /// window. `None` waits until interrupted.
    pub fn wait_for_device(&mut self, timeout: Option<Duration>) -> FlashResult<Presence> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut candidate: Option<(DeviceInfo, Instant)> = None;
        let mut crowded = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Presence::Interrupted);
            }

            let present = self.matching_devices()?;
            self.forget_departed(&present);

            if self.exclusive && present.len() > 1 {
                if !crowded {
                    warn!(
                        "{} matching devices attached; the tool cannot pick one, leave only one plugged in",
                        present.len()
                    );
                    crowded = true;
                }
                candidate = None;
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(Presence::TimedOut);
                }
                std::thread::sleep(self.poll_interval);
                continue;
            }
            crowded = false;

            // Only the first new device is considered; others wait for the
            // next iteration of the batch.
            let fresh = present
                .into_iter()
                .find(|d| !self.handled.contains_key(&d.id));

            candidate = match (candidate, fresh) {
                (Some((seen, since)), Some(fresh)) if seen.id == fresh.id => {
                    if since.elapsed() >= self.settle {
                        info!("Device {} [{}] attached", fresh.id, fresh.signature());
                        self.handled.insert(fresh.id.clone(), None);
                        return Ok(Presence::Attached(DeviceSlot::new(fresh)));
                    }
                    Some((fresh, since))
                }
                (_, Some(fresh)) => {
                    debug!("Candidate device {} [{}], settling", fresh.id, fresh.signature());
                    if self.settle.is_zero() {
                        info!("Device {} [{}] attached", fresh.id, fresh.signature());
                        self.handled.insert(fresh.id.clone(), None);
                        return Ok(Presence::Attached(DeviceSlot::new(fresh)));
                    }
                    Some((fresh, Instant::now()))
                }
                (Some((seen, _)), None) => {
                    debug!("Candidate device {} went away while settling", seen.id);
                    None
                }
                (None, None) => None,
            };

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Presence::TimedOut);
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    /// Drop handed-out devices that have been missing for the settle window
    fn forget_departed(&mut self, present: &[DeviceInfo]) {
        let settle = self.settle;
        self.handled.retain(|id, missing_since| {
            if present.iter().any(|d| &d.id == id) {
                *missing_since = None;
                return true;
            }
            let since = *missing_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= settle {
                debug!("Device {} is gone, it may be flashed again", id);
                return false;
            }
            true
        });
    }

    /// Block until the slot's device has been absent for the settle window
    pub fn wait_for_disconnect(
        &mut self,
        slot: &DeviceSlot,
        timeout: Option<Duration>,
    ) -> FlashResult<Departure> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut gone_since: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Departure::Interrupted);
            }

            let present = self
                .matching_devices()?
                .iter()
                .any(|d| d.id == slot.id());

            if present {
                gone_since = None;
            } else {
                let since = *gone_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.settle {
                    debug!("Device {} disconnected", slot.id());
                    self.handled.remove(slot.id());
                    return Ok(Departure::Disconnected);
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Departure::TimedOut);
            }

            std::thread::sleep(self.poll_interval);
        }
    }
}
