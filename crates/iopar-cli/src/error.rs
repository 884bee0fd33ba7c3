use iopar::{IoError, TuningError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error("tuning: {0}")]
    Tuning(String),

    #[error("cannot install signal handlers: {0}")]
    Signals(std::io::Error),

    #[error("quota refused for `{0}`")]
    Refused(String),
}

impl From<TuningError> for CliError {
    fn from(err: TuningError) -> Self {
        Self::Tuning(err.to_string())
    }
}

impl CliError {
    /// Process exit status: 2 for configuration mistakes, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(err) if err.is_configuration() => 2,
            Self::Tuning(_) => 2,
            _ => 1,
        }
    }
}
