use thiserror::Error;

/// Fatal errors. Anything that only concerns a single device is an
/// [`AttemptOutcome`](crate::attempt::AttemptOutcome) instead.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Could not invoke flashing tool: {0}")]
    ToolInvocation(String),

    #[error("USB enumeration error: {0}")]
    Enumeration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Report error: {0}")]
    Report(String),
}

pub type FlashResult<T> = std::result::Result<T, FlashError>;
