//! Class values
//!
//! - [`Ptr<T>`]: non-owning. Pushed as a light userdata carrying the
//!   address, with the behavior table `type_identity::<T>()`. The host keeps
//!   the object alive and frees it.
//! - `Rc<T>`: owning. Pushed as a userdata holding an
//!   [`OwnershipBox`](crate::OwnershipBox), with the behavior table
//!   `type_identity::<T>()`. The runtime keeps one strong count until the
//!   userdata is reclaimed.
//! - [`ObjectPtr`]: owning, like `Rc<T>`, but the behavior table is the one
//!   the object names through [`Object::metatable`].
//!
//! Reading an owning value back checks the concrete type; a box holding
//! another type is a mismatch, never a reinterpretation.

use super::{FromStack, ToStack};
use crate::error::{Error, Result};
use crate::identity::type_identity;
use crate::object::{Object, ObjectPtr};
use crate::ownership::OwnershipBox;
use crate::shape::{Classify, Shape};
use stackbind_vm::{State, VariableType};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

// ============================================================================
// Non-owning pointer
// ============================================================================

/// Non-owning pointer to a host object
pub struct Ptr<T> {
    address: usize,
    marker: PhantomData<*const T>,
}

impl<T> Ptr<T> {
    /// Null pointer (pushed as nil)
    pub const fn null() -> Self {
        Self {
            address: 0,
            marker: PhantomData,
        }
    }

    /// Pointer to `value`
    pub fn new(value: &T) -> Self {
        Self::from_raw(value)
    }

    /// Pointer from a raw address
    pub fn from_raw(ptr: *const T) -> Self {
        Self {
            address: ptr as usize,
            marker: PhantomData,
        }
    }

    /// Check if the pointer is null
    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// Raw pointer
    pub fn as_ptr(&self) -> *const T {
        self.address as *const T
    }

    /// Borrow the pointee.
    ///
    /// # Safety
    ///
    /// The object must still be alive for `'a` and must not be mutated
    /// meanwhile.
    pub unsafe fn as_ref<'a>(&self) -> Option<&'a T> {
        unsafe { self.as_ptr().as_ref() }
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ptr<T> {}

impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for Ptr<T> {}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptr({:#x})", self.address)
    }
}

impl<T> Classify for Ptr<T> {
    const SHAPE: Shape = Shape::Pointer;
}

impl<T> ToStack for Ptr<T> {
    fn encode(&self, state: &State) -> Result<()> {
        if self.is_null() {
            state.push_nil();
            return Ok(());
        }
        state.push_light_userdata(self.address);
        state.set_named_metatable(&type_identity::<T>())?;
        Ok(())
    }
}

impl<T: Any> FromStack for Ptr<T> {
    /// Reads the address of a light userdata, or of the `T` owned by a
    /// userdata; anything else reads as null
    fn decode(state: &State, idx: i32) -> Result<Self> {
        if let Some(address) = state.to_light_userdata(idx) {
            return Ok(Self {
                address,
                marker: PhantomData,
            });
        }
        Ok(OwnershipBox::peek(state, idx)
            .and_then(|owned| owned.get::<T>())
            .map(|object| Self::from_raw(Rc::as_ptr(&object)))
            .unwrap_or_default())
    }

    fn probe(state: &State, idx: i32) -> bool {
        matches!(
            state.kind(idx),
            VariableType::LightUserData | VariableType::UserData
        )
    }
}

// ============================================================================
// Owning pointers
// ============================================================================

fn mismatch(state: &State, idx: i32) -> Error {
    Error::Mismatch {
        expected: Shape::Shared,
        found: state.kind(idx),
    }
}

impl<T: Any> Classify for Rc<T> {
    const SHAPE: Shape = Shape::Shared;
}

impl<T: Any> ToStack for Rc<T> {
    fn encode(&self, state: &State) -> Result<()> {
        OwnershipBox::opaque(Rc::clone(self)).push(state, &type_identity::<T>())
    }
}

impl<T: Any> FromStack for Rc<T> {
    /// Fails with [`Error::Mismatch`] unless the slot owns a `T`; read
    /// `Option<Rc<T>>` for a lenient decode
    fn decode(state: &State, idx: i32) -> Result<Self> {
        OwnershipBox::peek(state, idx)
            .and_then(|owned| owned.get::<T>())
            .ok_or_else(|| mismatch(state, idx))
    }

    fn probe(state: &State, idx: i32) -> bool {
        OwnershipBox::peek(state, idx).is_some_and(|owned| owned.get::<T>().is_some())
    }
}

impl Classify for Rc<dyn Object> {
    const SHAPE: Shape = Shape::Shared;
}

impl ToStack for Rc<dyn Object> {
    fn encode(&self, state: &State) -> Result<()> {
        let metatable = self.metatable().to_string();
        OwnershipBox::object(Rc::clone(self)).push(state, &metatable)
    }
}

impl FromStack for Rc<dyn Object> {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        OwnershipBox::peek(state, idx)
            .and_then(|owned| owned.object_ptr())
            .ok_or_else(|| mismatch(state, idx))
    }

    fn probe(state: &State, idx: i32) -> bool {
        OwnershipBox::peek(state, idx).is_some_and(|owned| owned.object_ptr().is_some())
    }
}

/// Push a polymorphic object
pub fn push_object(state: &State, object: &ObjectPtr) -> Result<()> {
    object.encode(state)
}
