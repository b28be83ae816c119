//! Error types for the marshalling layer

use crate::shape::Shape;
use stackbind_vm::{VariableType, VmError};

/// Result type for marshalling and handle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Marshalling error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A chunk failed to load
    #[error("Load error in {chunk}: {message}")]
    Load {
        /// Chunk name
        chunk: String,
        /// Diagnostic reported by the loader
        message: String,
    },

    /// Error raised by the runtime during a call; the message is the
    /// runtime's own text
    #[error("{0}")]
    Call(String),

    /// Call on a value without a call capability
    #[error("attempt to call a {0} value")]
    NotCallable(VariableType),

    /// Checked decode of a slot that does not hold the requested shape
    #[error("Type mismatch: expected {expected}, got {found}")]
    Mismatch {
        /// Shape that was requested
        expected: Shape,
        /// Dynamic kind actually found
        found: VariableType,
    },

    /// The handle is empty or its runtime has been closed
    #[error("Handle is not attached to a live runtime")]
    Detached,

    /// Runtime API failure
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl Error {
    /// Classify an error coming out of a protected call
    pub fn from_call(error: VmError) -> Self {
        match error {
            VmError::Runtime(message) => Error::Call(message),
            VmError::NotCallable(kind) => Error::NotCallable(kind),
            other => Error::Vm(other),
        }
    }

    /// Convert back into a runtime error so it can cross a callback boundary.
    /// Runtime error text is carried over unchanged.
    pub fn into_vm(self) -> VmError {
        match self {
            Error::Vm(error) => error,
            Error::Call(message) => VmError::Runtime(message),
            Error::NotCallable(kind) => VmError::NotCallable(kind),
            other => VmError::Runtime(other.to_string()),
        }
    }
}

impl From<Error> for VmError {
    fn from(error: Error) -> Self {
        error.into_vm()
    }
}
