//! Error and status types.
//!
//! Every fallible public entry point returns [`Result`]. [`Error`] carries a
//! formatted message for diagnostics; [`Error::status`] collapses it to the
//! stable [`Status`] code that callers branch on.

use thiserror::Error;

/// Stable status codes for the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    InvalidValue = -1,
    InvalidOperation = -2,
    OutOfMemory = -3,
    IncompatibleApi = -4,
    InternalError = -5,
}

impl Status {
    /// Human-readable name for the status code.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::InvalidValue => "Invalid value",
            Status::InvalidOperation => "Invalid operation",
            Status::OutOfMemory => "Out of memory",
            Status::IncompatibleApi => "Incompatible API",
            Status::InternalError => "Internal error",
        }
    }
}

/// Errors produced by the reflections resolver.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter or handle failed validation.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// The operation is not permitted in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A fixed-capacity pool or the scratch ring is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// The caller was compiled against a different library version.
    #[error("incompatible API version: expected {expected:#x}, got {requested:#x}")]
    IncompatibleApi { expected: u32, requested: u32 },
    /// A backend or device failure; the context remains destroyable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The status code corresponding to this error.
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidValue(_) => Status::InvalidValue,
            Error::InvalidOperation(_) => Status::InvalidOperation,
            Error::OutOfMemory(_) => Status::OutOfMemory,
            Error::IncompatibleApi { .. } => Status::IncompatibleApi,
            Error::Internal(_) => Status::InternalError,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::InvalidValue("x".into()).status(), Status::InvalidValue);
        assert_eq!(Error::OutOfMemory("x".into()).status(), Status::OutOfMemory);
        assert_eq!(
            Error::IncompatibleApi { expected: 1, requested: 2 }.status(),
            Status::IncompatibleApi
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidOperation("view has no performance counters".into());
        assert_eq!(
            err.to_string(),
            "invalid operation: view has no performance counters"
        );
        assert_eq!(Status::OutOfMemory.name(), "Out of memory");
    }
}
