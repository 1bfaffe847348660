pub use attempt::{AttemptOutcome, FlashAttempt};
pub use boards::{Board, ToolProfile};
pub use cancel::CancelToken;
pub use controller::{BatchConfig, BatchController, BatchState, RetryPolicy};
pub use device::{DeviceInfo, DeviceSlot, UsbSignature};
pub use executor::{FlashExecutor, ToolRunner, process::SubprocessRunner};
pub use job::FlashJob;
pub use monitor::{DeviceMonitor, ScannerBackend, UsbScanner};
pub use report::{BatchReport, BatchSummary};

pub mod attempt;
pub mod boards;
pub mod cancel;
pub mod constants;
pub mod controller;
pub mod device;
pub mod error;
pub mod executor;
pub mod job;
pub mod monitor;
pub mod report;
pub mod session;
pub mod sim;
pub(crate) mod util;
