//! Engine: one runtime instance and the script-loading seam
//!
//! The engine owns a [`State`], installs the base library and hands out
//! [`Handle`]s, [`Metatable`]s and [`Sandbox`]es bound to it. There is no
//! compiler here: a [`Chunk`] is anything that can push one callable, and a
//! host callback is the simplest chunk.

use crate::error::{Error, Result};
use crate::metatable::Metatable;
use crate::reference::Handle;
use crate::sandbox::Sandbox;
use crate::stack::{balanced, ToStack};
use stackbind_vm::{
    Callback, GcStats, State, VariableType, VmError, VmOptions, VmResult, GLOBALS_INDEX,
};
use std::fmt;
use std::rc::Rc;
use tracing::warn;

// ============================================================================
// Chunks
// ============================================================================

/// Loadable unit of code.
///
/// Loading pushes exactly one callable onto the stack, or reports a
/// diagnostic that surfaces as [`Error::Load`].
pub trait Chunk {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Push the callable, or describe why it cannot be loaded
    fn load(&self, state: &State) -> std::result::Result<(), String>;
}

impl<F> Chunk for F
where
    F: Fn(&State) -> VmResult<usize> + Clone + 'static,
{
    fn name(&self) -> &str {
        "=(host)"
    }

    fn load(&self, state: &State) -> std::result::Result<(), String> {
        state.push_function(self.clone());
        Ok(())
    }
}

/// Named host callback chunk
#[derive(Clone)]
pub struct HostChunk {
    name: String,
    body: Callback,
}

impl HostChunk {
    /// Chunk called `name` running `body`
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&State) -> VmResult<usize> + 'static,
    {
        Self {
            name: name.into(),
            body: Rc::new(body),
        }
    }
}

impl fmt::Debug for HostChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostChunk")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Chunk for HostChunk {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, state: &State) -> std::result::Result<(), String> {
        state.push_callback(Rc::clone(&self.body));
        Ok(())
    }
}

/// Load `chunk`, leaving its function on the stack
pub(crate) fn load_chunk<C: Chunk + ?Sized>(state: &State, chunk: &C) -> Result<()> {
    let top = state.top();
    let load_error = |message: String| Error::Load {
        chunk: chunk.name().to_string(),
        message,
    };

    if let Err(message) = chunk.load(state) {
        state.set_top(top)?;
        return Err(load_error(message));
    }
    if state.top() != top + 1 || state.kind(-1) != VariableType::Function {
        state.set_top(top)?;
        return Err(load_error("chunk did not produce a function".to_string()));
    }
    Ok(())
}

// ============================================================================
// Engine
// ============================================================================

/// Options for creating an [`Engine`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Runtime options
    pub vm: VmOptions,

    /// Install `_G`, `type`, `tostring` and `print`
    pub open_base_library: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            vm: VmOptions::default(),
            open_base_library: true,
        }
    }
}

/// Runtime instance. Dropping the engine closes the runtime: pending
/// finalizers run and every handle becomes detached.
pub struct Engine {
    state: State,
}

impl Engine {
    /// Engine with default options
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    /// Engine with explicit options
    pub fn with_options(options: EngineOptions) -> Self {
        let state = State::new(options.vm);
        if options.open_base_library {
            if let Err(error) = open_base_library(&state) {
                warn!(%error, "failed to open the base library");
            }
        }
        Self { state }
    }

    /// Underlying runtime state
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Check that nothing was left on the stack
    pub fn is_stack_top(&self) -> bool {
        self.state.top() == 0
    }

    /// Load `chunk` without running it
    pub fn load<C: Chunk + ?Sized>(&self, chunk: &C) -> Result<Handle> {
        balanced(&self.state, || {
            load_chunk(&self.state, chunk)?;
            Handle::pop(&self.state)
        })
    }

    /// Load and run `chunk`, discarding its results
    pub fn execute_raw<C: Chunk + ?Sized>(&self, chunk: &C) -> Result<()> {
        balanced(&self.state, || {
            load_chunk(&self.state, chunk)?;
            self.state.pcall(0, 0).map_err(Error::from_call)
        })
    }

    /// Load and run `chunk`, returning its first result
    pub fn execute<C: Chunk + ?Sized>(&self, chunk: &C) -> Result<Handle> {
        balanced(&self.state, || {
            load_chunk(&self.state, chunk)?;
            self.state.pcall(0, 1).map_err(Error::from_call)?;
            Handle::pop(&self.state)
        })
    }

    /// Run a full collection
    pub fn collect_garbage(&self) -> GcStats {
        self.state.collect_garbage()
    }

    /// Assign the global `name`
    pub fn set_global<V: ToStack + ?Sized>(&self, name: &str, value: &V) -> Result<()> {
        balanced(&self.state, || {
            value.encode(&self.state)?;
            self.state.set_global(name)?;
            Ok(())
        })
    }

    /// Assign nil to the global `name`
    pub fn remove_global(&self, name: &str) -> Result<()> {
        balanced(&self.state, || {
            self.state.push_nil();
            self.state.set_global(name)?;
            Ok(())
        })
    }

    /// Handle to the global table
    pub fn globals(&self) -> Result<Handle> {
        Handle::global(&self.state, "")
    }

    /// Handle to the global `name` (Empty when unset)
    pub fn global(&self, name: &str) -> Result<Handle> {
        Handle::global(&self.state, name)
    }

    /// Behavior table `name`, created on first use
    pub fn metatable(&self, name: &str) -> Result<Metatable> {
        Metatable::new(&self.state, name, None)
    }

    /// Behavior table `name` inheriting operators and members from `parent`
    pub fn metatable_with_parent(&self, name: &str, parent: &str) -> Result<Metatable> {
        Metatable::new(&self.state, name, Some(parent))
    }

    /// Sandbox `name`, created on first use
    pub fn sandbox(&self, name: &str) -> Result<Sandbox> {
        Sandbox::new(&self.state, name)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("top", &self.state.top())
            .field("live_objects", &self.state.live_objects())
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.state.close();
    }
}

// ============================================================================
// Base library
// ============================================================================

fn open_base_library(state: &State) -> VmResult<()> {
    state.push_value(GLOBALS_INDEX);
    state.set_field(GLOBALS_INDEX, "_G")?;

    state.push_function(base_type);
    state.set_field(GLOBALS_INDEX, "type")?;

    state.push_function(base_tostring);
    state.set_field(GLOBALS_INDEX, "tostring")?;

    state.push_function(base_print);
    state.set_field(GLOBALS_INDEX, "print")?;
    Ok(())
}

fn base_type(state: &State) -> VmResult<usize> {
    if state.is_none(1) {
        return Err(VmError::Runtime(
            "bad argument #1 to 'type' (value expected)".to_string(),
        ));
    }
    let name = state.type_name(1);
    state.push_string(name);
    Ok(1)
}

fn base_tostring(state: &State) -> VmResult<usize> {
    let text = state.to_display(1)?;
    state.push_string(&text);
    Ok(1)
}

fn base_print(state: &State) -> VmResult<usize> {
    let line = (1..=state.top())
        .map(|idx| state.to_display(idx))
        .collect::<VmResult<Vec<_>>>()?
        .join("\t");
    println!("{}", line);
    Ok(0)
}
