// SPDX-License-Identifier: Apache-2.0

//! Errors reported by the enclave manager and its collaborators.

use thiserror::Error;

/// A `Result` alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The failures surfaced by every entry point of this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A malformed or unsupported request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A name or key is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The manager was configured twice, or after its instance was created.
    #[error("the enclave manager has already been initialized")]
    AlreadyInitialized,

    /// The manager instance was requested before any configuration.
    #[error("the enclave manager has not been configured")]
    NotConfigured,

    /// An operation was attempted from the wrong state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A process resource (thread, memory) could not be allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A driver reported a nonzero status code.
    #[error("{message} (status {code:#06x})")]
    Backend { code: u32, message: String },
}

impl Error {
    pub(crate) fn backend(code: u32, message: impl Into<String>) -> Self {
        Self::Backend {
            code,
            message: message.into(),
        }
    }

    /// The raw driver status, if this error came from one.
    pub fn backend_code(&self) -> Option<u32> {
        match self {
            Self::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::InvalidArgument(format!("malformed payload: {}", err))
    }
}
