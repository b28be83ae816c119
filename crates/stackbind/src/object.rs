//! Polymorphic host objects
//!
//! A type that implements [`Object`] chooses its behavior table at runtime,
//! so a collection of `Rc<dyn Object>` values of different concrete types
//! each reach their own methods once pushed.

use std::any::Any;
use std::rc::Rc;

/// Upcast helpers for downcasting trait objects back to their concrete type
pub trait AsAny: Any {
    /// Borrow as `&dyn Any`
    fn as_any(&self) -> &dyn Any;

    /// Convert into `Rc<dyn Any>`
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Host object with dynamic dispatch
pub trait Object: AsAny {
    /// Name of the behavior table for this object
    fn metatable(&self) -> &str;
}

/// Shared owning pointer to a polymorphic host object
pub type ObjectPtr = Rc<dyn Object>;

impl dyn Object {
    /// Borrow as the concrete type `T`
    pub fn downcast_ref<T: Object>(&self) -> Option<&T> {
        <dyn Object as AsAny>::as_any(self).downcast_ref::<T>()
    }

    /// Check whether the concrete type is `T`
    pub fn is<T: Object>(&self) -> bool {
        <dyn Object as AsAny>::as_any(self).is::<T>()
    }
}

/// Convert a shared object pointer into a pointer to its concrete type,
/// handing the original back when the type does not match
pub fn downcast_rc<T: Object>(object: ObjectPtr) -> Result<Rc<T>, ObjectPtr> {
    <dyn Object as AsAny>::as_any_rc(Rc::clone(&object))
        .downcast::<T>()
        .map_err(|_| object)
}
