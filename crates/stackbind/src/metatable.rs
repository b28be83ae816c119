//! Behavior tables
//!
//! A behavior table is a registry metatable that is also published as a
//! global of the same name. Its `__index` points at itself, so functions
//! stored on it act as methods of every value carrying it. A child table
//! created with a parent gets the parent as its own metatable (member
//! lookups fall through to the parent) and a copy of the parent's
//! [`INHERITED_OPERATORS`], taken once at creation. The copy reads the
//! parent with a normal lookup, so operators a grandparent defines later
//! still reach children created after that.

use crate::error::Result;
use crate::ownership::reclaim;
use crate::reference::Handle;
use crate::stack::function::NativeFn;
use crate::stack::{balanced, ToStack};
use stackbind_vm::{State, VariableType};
use tracing::{debug, warn};

/// Operator hooks copied from a parent behavior table
pub const INHERITED_OPERATORS: [&str; 14] = [
    "__eq",
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__mod",
    "__pow",
    "__unm",
    "__len",
    "__lt",
    "__le",
    "__concat",
    "__call",
    "__tostring",
];

/// Named behavior table
#[derive(Debug, Clone)]
pub struct Metatable {
    name: String,
    handle: Handle,
}

impl Metatable {
    /// Behavior table `name`. An existing global of that name is reused
    /// as is, parent included.
    pub fn new(state: &State, name: &str, parent: Option<&str>) -> Result<Self> {
        let existing = Handle::global(state, name)?;
        if existing.kind() != VariableType::Nil {
            return Ok(Self {
                name: name.to_string(),
                handle: existing,
            });
        }

        let handle = balanced(state, || {
            state.new_metatable(name)?;
            state.push_value(-1);
            state.set_field(-2, "__index")?;
            if let Some(parent) = parent {
                inherit(state, name, parent)?;
            }
            state.push_value(-1);
            state.set_global(name)?;
            debug!(name, ?parent, "created behavior table");
            Handle::pop(state)
        })?;

        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    /// Assign the member `name`
    pub fn set_field<V: ToStack + ?Sized>(&self, name: &str, value: &V) -> Result<&Self> {
        self.handle.set_field(name, value)?;
        Ok(self)
    }

    /// Install the reclamation hook as `__gc`, so owning userdata carrying
    /// this table release their host object when collected
    pub fn register_reference_destructor(&self) -> Result<&Self> {
        self.set_field("__gc", &NativeFn(reclaim))
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the table
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// With the new table on top: make `parent` its metatable and copy the
/// inherited operators
fn inherit(state: &State, name: &str, parent: &str) -> Result<()> {
    state.push_named_metatable(parent)?;
    if state.kind(-1) != VariableType::Table {
        state.pop(1)?;
        warn!(name, parent, "parent behavior table does not exist");
        return Ok(());
    }

    state.push_value(-1);
    state.set_metatable(-3)?;
    for op in INHERITED_OPERATORS {
        state.push_string(op);
        state.get_field(-2, op)?;
        state.raw_set(-4)?;
    }
    state.pop(1)?;
    Ok(())
}
