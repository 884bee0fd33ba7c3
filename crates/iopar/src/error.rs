use thiserror::Error;

use crate::notify::NotifierId;
use crate::state::ParamId;

pub type Result<T> = std::result::Result<T, IoError>;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("no such device: {0}")]
    NoDevice(ParamId),

    #[error("operation not supported by {0}")]
    NotSupported(ParamId),

    #[error("cannot create `{spec}`: {reason}")]
    Construction { spec: String, reason: String },

    #[error("{0} is busy: another client holds a different value")]
    Busy(ParamId),

    #[error("notifier {notifier} not registered on {param}")]
    NotFound { param: ParamId, notifier: NotifierId },

    #[error("bad address `{uri}`: {reason}")]
    Address { uri: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IoError {
    #[must_use]
    pub fn construction(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Construction {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn address(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Address {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Configuration mistakes (bad spec, bad address) as opposed to runtime
    /// failures of an otherwise valid parameter.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Construction { .. } | Self::Address { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::IoError;
    use crate::state::ParamId;

    #[test]
    fn construction_message_names_spec() {
        let error = IoError::construction("bogus:x", "unknown type `bogus`");
        assert_eq!(error.to_string(), "cannot create `bogus:x`: unknown type `bogus`");
        assert!(error.is_configuration());
    }

    #[test]
    fn busy_is_a_runtime_error() {
        let id = ParamId::new(3).unwrap();
        let error = IoError::Busy(id);
        assert!(!error.is_configuration());
        assert!(error.to_string().starts_with("#3 is busy"));
    }
}
