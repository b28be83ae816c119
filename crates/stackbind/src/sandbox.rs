//! Sandboxes: named global scopes that read through to the true globals
//!
//! Code executed in a sandbox sees the sandbox table as its global scope.
//! Reads of names it does not define fall back to the real global table
//! through `__index`; writes stay in the sandbox.

use crate::engine::Chunk;
use crate::error::Result;
use crate::reference::Handle;
use crate::stack::{balanced, ToStack};
use stackbind_vm::{State, VariableType, GLOBALS_INDEX};
use tracing::debug;

/// Named sandbox table
#[derive(Debug, Clone)]
pub struct Sandbox {
    name: String,
    handle: Handle,
}

impl Sandbox {
    /// Sandbox `name`. An existing global of that name is reused as is.
    pub fn new(state: &State, name: &str) -> Result<Self> {
        let existing = Handle::global(state, name)?;
        if existing.kind() != VariableType::Nil {
            return Ok(Self {
                name: name.to_string(),
                handle: existing,
            });
        }

        let handle = balanced(state, || {
            state.new_table();
            state.new_table();
            state.push_value(GLOBALS_INDEX);
            state.set_field(-2, "__index")?;
            state.set_metatable(-2)?;
            state.push_value(-1);
            state.set_global(name)?;
            debug!(name, "created sandbox");
            Handle::pop(state)
        })?;

        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    /// Load and run `chunk` with the sandbox as its global scope
    pub fn execute<C: Chunk + ?Sized>(&self, chunk: &C) -> Result<()> {
        self.handle.execute_in(chunk)
    }

    /// Assign the sandbox global `name`
    pub fn set_field<V: ToStack + ?Sized>(&self, name: &str, value: &V) -> Result<&Self> {
        self.handle.set_field(name, value)?;
        Ok(self)
    }

    /// Sandbox name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the sandbox table
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HostChunk;
    use stackbind_vm::VmOptions;

    fn state() -> State {
        State::new(VmOptions::manual_gc())
    }

    fn increment() -> HostChunk {
        HostChunk::new("increment", |s: &State| {
            s.get_global("Variable")?;
            let value = s.to_integer(-1);
            s.pop(1)?;
            s.push_integer(value + 1);
            s.set_global("Variable")?;
            Ok(0)
        })
    }

    #[test]
    fn test_writes_stay_in_sandbox() {
        let s = state();
        let sandbox = Sandbox::new(&s, "First").unwrap();
        sandbox.set_field("Variable", &123).unwrap();
        sandbox.execute(&increment()).unwrap();

        assert_eq!(
            sandbox.handle().field("Variable").unwrap().get::<i32>().unwrap(),
            124
        );
        assert!(Handle::global(&s, "Variable").unwrap().is_empty());
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_reads_fall_back_to_globals() {
        let s = state();
        s.push_integer(10);
        s.set_global("Variable").unwrap();

        let sandbox = Sandbox::new(&s, "Reader").unwrap();
        sandbox.execute(&increment()).unwrap();

        assert_eq!(
            sandbox.handle().field("Variable").unwrap().get::<i32>().unwrap(),
            11
        );
        assert_eq!(Handle::global(&s, "Variable").unwrap().get::<i32>().unwrap(), 10);
    }

    #[test]
    fn test_creation_is_idempotent() {
        let s = state();
        let first = Sandbox::new(&s, "Box").unwrap();
        first.set_field("kept", &true).unwrap();
        let second = Sandbox::new(&s, "Box").unwrap();
        assert_eq!(second.name(), "Box");
        assert!(second.handle().field("kept").unwrap().get::<bool>().unwrap());
    }
}
