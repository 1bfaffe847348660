use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FlashError, FlashResult};

/// Operator stop request, shared between the Ctrl-C handler and every
/// blocking wait of the batch
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that trips on SIGINT/Ctrl-C. Can only be installed once per
    /// process.
    pub fn from_ctrlc() -> FlashResult<Self> {
        let token = CancelToken::new();
        let handler_token = token.clone();
        ctrlc::set_handler(move || {
            handler_token.cancel();
        })
        .map_err(|e| {
            FlashError::Configuration(format!("Could not install Ctrl-C handler: {}", e))
        })?;
        Ok(token)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
