//! Stack runtime
//!
//! An embeddable dynamic runtime that talks to its host exclusively through
//! an operand stack and a registry of references. There is no language here:
//! functions are host callbacks, and scripts are whatever the host pushes.
//!
//! # Architecture
//!
//! - [`value`]: dynamic values and table keys
//! - [`table`]: insertion-ordered tables
//! - [`heap`]: generation-checked object arena
//! - [`gc`]: mark-sweep collector with weak tables and finalizers
//! - [`state`]: the stack API (indices, tables, metatables, calls, references)
//! - [`options`]: runtime configuration
//!
//! # Example
//!
//! ```ignore
//! use stackbind_vm::{State, VmOptions};
//!
//! let state = State::new(VmOptions::default());
//! state.push_function(|s| {
//!     let n = s.to_number(1);
//!     s.push_number(n * 2.0);
//!     Ok(1)
//! });
//! state.push_number(21.0);
//! state.call(1, 1)?;
//! assert_eq!(state.to_integer(-1), 42);
//! ```

#![warn(rust_2018_idioms)]

pub mod gc;
pub mod heap;
pub mod options;
pub mod state;
pub mod table;
pub mod value;

pub use gc::GcStats;
pub use heap::Callback;
pub use options::VmOptions;
pub use state::{State, WeakState};
pub use table::Table;
pub use value::{format_number, GcRef, Key, Value, VariableType};

/// Pseudo index of the registry table
pub const REGISTRY_INDEX: i32 = -10000;

/// Pseudo index of the true global table
pub const GLOBALS_INDEX: i32 = -10002;

/// Reference id returned when a nil value is referenced
pub const REF_NIL: i32 = -1;

/// Reference id that never refers to anything
pub const NO_REF: i32 = -2;

/// Keep every result of a call
pub const MULTRET: i32 = -1;

/// VM execution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// Error raised by running code; the message is the runtime's own text
    #[error("{0}")]
    Runtime(String),

    /// Stack underflow
    #[error("Stack underflow")]
    StackUnderflow,

    /// Index outside the current frame
    #[error("Invalid stack index: {0}")]
    InvalidIndex(i32),

    /// Heap reference to an object that has been collected
    #[error("Stale heap reference")]
    StaleReference,

    /// Call on a value without a call capability
    #[error("attempt to call a {0} value")]
    NotCallable(VariableType),

    /// Type error
    #[error("Type error: {0}")]
    TypeError(String),

    /// Too many nested calls
    #[error("Call depth exceeded")]
    CallDepthExceeded,

    /// The state has been closed
    #[error("State is closed")]
    Closed,
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
