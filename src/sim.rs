//! Simulated USB bus and flashing tool.
//!
//! These drive a [`BatchController`](crate::controller::BatchController)
//! end to end without hardware: boards attach to the bus one after another,
//! and the scripted tool unplugs each board once it has been flashed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::attempt::ToolOutput;
use crate::cancel::CancelToken;
use crate::device::DeviceInfo;
use crate::error::{FlashError, FlashResult};
use crate::executor::ToolRunner;
use crate::job::ToolInvocation;
use crate::monitor::UsbScanner;

struct SimDevice {
    info: DeviceInfo,
    flaps: u32,
    visible: bool,
}

#[derive(Default)]
struct BusState {
    pending: VecDeque<SimDevice>,
    attached: Option<SimDevice>,
    empty_scans: u32,
}

/// A bus where queued boards attach one at a time. The next board only
/// shows up after the bus has been seen empty once.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        let bus = Self::default();
        bus.lock().empty_scans = 1;
        bus
    }

    /// Queue `count` Rockchip boards on ports `1-1`, `1-2`, ...
    pub fn with_boards(count: usize, vid: u16, pid: u16) -> Self {
        let bus = Self::new();
        for i in 1..=count {
            bus.queue(DeviceInfo {
                id: format!("1-{}", i),
                vid,
                pid,
                bus: 1,
                address: (i + 1) as u8,
                serial: None,
            });
        }
        bus
    }

    pub fn queue(&self, info: DeviceInfo) {
        self.queue_flapping(info, 0);
    }

    /// Queue a board that drops off and re-enumerates `flaps` times before
    /// it stays put
    pub fn queue_flapping(&self, info: DeviceInfo, flaps: u32) {
        self.lock().pending.push_back(SimDevice {
            info,
            flaps,
            visible: false,
        });
    }

    pub fn unplug(&self, id: &str) {
        let mut state = self.lock();
        if state.attached.as_ref().is_some_and(|d| d.info.id == id) {
            state.attached = None;
            state.empty_scans = 0;
        }
    }

    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.attached.is_some() as usize
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl UsbScanner for SimulatedBus {
    fn scan(&self) -> FlashResult<Vec<DeviceInfo>> {
        let mut state = self.lock();

        if state.attached.is_none() {
            if state.empty_scans == 0 || state.pending.is_empty() {
                state.empty_scans += 1;
                return Ok(Vec::new());
            }
            state.attached = state.pending.pop_front();
        }

        let Some(device) = state.attached.as_mut() else {
            return Ok(Vec::new());
        };
        if device.flaps > 0 {
            device.flaps -= 1;
            device.visible = !device.visible;
        } else {
            device.visible = true;
        }

        if device.visible {
            Ok(vec![device.info.clone()])
        } else {
            Ok(Vec::new())
        }
    }
}

/// What the scripted tool does for one invocation
#[derive(Debug, Clone)]
pub enum Script {
    Exit(i32, String),
    Timeout,
    /// The tool binary cannot be started
    Missing,
}

impl Script {
    pub fn ok() -> Self {
        Script::Exit(0, "Upgrade loader ok\nWrite LBA from file (100%)\n".to_string())
    }

    pub fn fail(output: &str) -> Self {
        Script::Exit(1, output.to_string())
    }
}

#[derive(Default)]
struct RunnerState {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live_processes: AtomicUsize,
}

/// A [`ToolRunner`] that plays back per-device scripts. Devices without a
/// script left succeed.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<RunnerState>,
    bus: Option<SimulatedBus>,
    delay: Duration,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unplug each device from `bus` once the tool has run against it
    pub fn unplugs_from(mut self, bus: SimulatedBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Pretend every invocation takes this long
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, device_id: &str, steps: Vec<Script>) -> Self {
        self.state
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device_id.to_string(), steps.into());
        self
    }

    /// Device ids in invocation order
    pub fn calls(&self) -> Vec<String> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Highest number of invocations ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Simulated tool processes not yet reaped
    pub fn live_processes(&self) -> usize {
        self.state.live_processes.load(Ordering::SeqCst)
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> FlashResult<ToolOutput> {
        let script = self
            .state
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&invocation.device_id)
            .and_then(|steps| steps.pop_front())
            .unwrap_or_else(Script::ok);

        if let Script::Missing = script {
            return Err(FlashError::ToolInvocation(format!(
                "{}: No such file or directory",
                invocation.program
            )));
        }

        self.state
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(invocation.device_id.clone());

        let running = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.state.live_processes.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay.min(timeout));
        }

        let output = match script {
            Script::Exit(code, text) => {
                for line in text.lines() {
                    on_line(line);
                }
                ToolOutput::exited(code, text)
            }
            Script::Timeout | Script::Missing => ToolOutput::timed_out(""),
        };
        let output = ToolOutput {
            interrupted: cancel.is_cancelled(),
            ..output
        };

        // Killed or exited, the process is reaped before returning
        self.state.live_processes.fetch_sub(1, Ordering::SeqCst);
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(bus) = &self.bus {
            bus.unplug(&invocation.device_id);
        }

        Ok(output)
    }
}
