//! Ownership box for host objects held by the runtime
//!
//! Pushing an owning class value (`Rc<T>` or [`ObjectPtr`]) allocates one
//! userdata whose payload is an `Option<OwnershipBox>`. The runtime owns the
//! userdata; the box owns one strong count of the host object. The
//! [`reclaim`] hook, installed as `__gc` by
//! [`Metatable::register_reference_destructor`](crate::Metatable::register_reference_destructor),
//! takes the box out of the payload and leaves `None` behind, so a second
//! reclamation of the same userdata finds nothing to free.

use crate::error::Result;
use crate::object::{AsAny, Object, ObjectPtr};
use stackbind_vm::{State, VariableType, VmError, VmResult};
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

#[derive(Clone)]
enum Owned {
    /// Concrete type known only to the code that pushed it
    Opaque(Rc<dyn Any>),
    /// Object that names its own behavior table
    Object(ObjectPtr),
}

/// One strong count of a host object, owned by a runtime userdata
#[derive(Clone)]
pub struct OwnershipBox {
    owned: Owned,
}

impl OwnershipBox {
    /// Box a value of a concrete type
    pub fn opaque<T: Any>(value: Rc<T>) -> Self {
        Self {
            owned: Owned::Opaque(value),
        }
    }

    /// Box a polymorphic object
    pub fn object(object: ObjectPtr) -> Self {
        Self {
            owned: Owned::Object(object),
        }
    }

    /// The owned value, if its concrete type is `T`
    pub fn get<T: Any>(&self) -> Option<Rc<T>> {
        let any = match &self.owned {
            Owned::Opaque(any) => Rc::clone(any),
            Owned::Object(object) => <dyn Object as AsAny>::as_any_rc(Rc::clone(object)),
        };
        any.downcast::<T>().ok()
    }

    /// The owned value, if it was boxed as a polymorphic object
    pub fn object_ptr(&self) -> Option<ObjectPtr> {
        match &self.owned {
            Owned::Object(object) => Some(Rc::clone(object)),
            Owned::Opaque(_) => None,
        }
    }

    /// Push a userdata owning this box, with the registry metatable
    /// `metatable` (none if no such table is registered)
    pub fn push(self, state: &State, metatable: &str) -> Result<()> {
        state.new_userdata(Some(self));
        state.set_named_metatable(metatable)?;
        Ok(())
    }

    /// Copy of the box held by the userdata at `idx`
    pub fn peek(state: &State, idx: i32) -> Option<Self> {
        state
            .with_userdata::<Option<OwnershipBox>, _>(idx, |slot| slot.clone())
            .flatten()
    }

    /// Check whether the value at `idx` is a userdata that still owns a box
    pub fn is_owned(state: &State, idx: i32) -> bool {
        state
            .with_userdata::<Option<OwnershipBox>, _>(idx, |slot| slot.is_some())
            .unwrap_or(false)
    }
}

impl fmt::Debug for OwnershipBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owned {
            Owned::Opaque(_) => f.write_str("OwnershipBox(opaque)"),
            Owned::Object(object) => write!(f, "OwnershipBox({})", object.metatable()),
        }
    }
}

/// Reclamation hook for owning userdata.
///
/// Releases the box held by the userdata in slot 1. Non-owning pointers
/// (light userdata) cannot be reclaimed and raise an error.
pub fn reclaim(state: &State) -> VmResult<usize> {
    if state.kind(1) == VariableType::LightUserData {
        return Err(VmError::Runtime(
            "cannot reclaim a non-owning pointer".to_string(),
        ));
    }
    let released = state
        .with_userdata::<Option<OwnershipBox>, _>(1, Option::take)
        .flatten();
    if let Some(released) = released {
        trace!(?released, "reclaimed owned object");
    }
    Ok(0)
}
