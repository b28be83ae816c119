//! Registry-backed handles
//!
//! A [`Handle`] keeps one runtime value alive by storing it in the registry
//! under an integer id. Copies of a handle share one slot; the registry
//! entry is released exactly once, when the last copy is dropped.
//!
//! ```text
//! Empty --capture--> Bound(id) --assign--> Bound(id') --last drop--> released
//! ```
//!
//! A [`WeakHandle`] observes a value without keeping it alive: the value
//! sits in a one-entry table whose values are weak, and the handle only
//! keeps that table alive.

use crate::engine::{load_chunk, Chunk};
use crate::error::{Error, Result};
use crate::shape::{Classify, Shape};
use crate::stack::{self, balanced, FromReturns, FromStack, IntoArgs, ToStack};
use stackbind_vm::{State, VariableType, WeakState, GLOBALS_INDEX, REF_NIL, REGISTRY_INDEX};
use std::fmt;
use std::rc::Rc;
use tracing::{trace, warn};

/// Registry metatable shared by every weak cell
const WEAK_CELL: &str = "stackbind.WeakCell";

/// Registry slot shared by the copies of a handle
struct Slot {
    state: WeakState,
    id: i32,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.id == REF_NIL {
            return;
        }
        let Some(state) = self.state.upgrade() else {
            return;
        };
        if state.is_closed() {
            return;
        }
        match state.unreference(REGISTRY_INDEX, self.id) {
            Ok(()) => trace!(id = self.id, "released handle"),
            Err(error) => warn!(id = self.id, %error, "failed to release handle"),
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Strong reference to a runtime value
#[derive(Clone, Default)]
pub struct Handle {
    slot: Option<Rc<Slot>>,
}

impl Handle {
    /// Capture the top value, popping it
    pub fn pop(state: &State) -> Result<Self> {
        let id = state.reference(REGISTRY_INDEX)?;
        Ok(Self {
            slot: Some(Rc::new(Slot {
                state: state.downgrade(),
                id,
            })),
        })
    }

    /// Capture a copy of the value at `idx`
    pub fn from_stack(state: &State, idx: i32) -> Result<Self> {
        state.push_value(idx);
        Self::pop(state)
    }

    /// Capture the global `name`; the empty name captures the global table
    pub fn global(state: &State, name: &str) -> Result<Self> {
        if name.is_empty() {
            state.push_value(GLOBALS_INDEX);
        } else {
            state.get_global(name)?;
        }
        Self::pop(state)
    }

    /// Runtime this handle belongs to
    pub fn state(&self) -> Result<State> {
        let slot = self.slot.as_ref().ok_or(Error::Detached)?;
        match slot.state.upgrade() {
            Some(state) if !state.is_closed() => Ok(state),
            _ => Err(Error::Detached),
        }
    }

    /// Registry id ([`REF_NIL`] for empty handles)
    pub fn id(&self) -> i32 {
        self.slot.as_ref().map_or(REF_NIL, |slot| slot.id)
    }

    /// Check if the handle refers to a non-nil value
    pub fn is_bound(&self) -> bool {
        self.id() != REF_NIL
    }

    /// Check if the handle is empty or refers to nil
    pub fn is_empty(&self) -> bool {
        !self.is_bound()
    }

    /// Check if the handle was captured from `state`
    pub fn belongs_to(&self, state: &State) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.state.is(state))
    }

    /// Number of handle copies sharing this registry slot
    pub fn copies(&self) -> usize {
        self.slot.as_ref().map_or(0, Rc::strong_count)
    }

    /// Push the referenced value onto `state`. Empty handles push nil, and so
    /// do handles of another runtime.
    pub fn push(&self, state: &State) -> Result<()> {
        match &self.slot {
            Some(slot) if slot.id != REF_NIL => {
                if !slot.state.is(state) {
                    warn!(id = slot.id, "handle pushed onto a foreign runtime");
                    state.push_nil();
                    return Ok(());
                }
                state.raw_get_i(REGISTRY_INDEX, slot.id as i64)?;
            }
            _ => state.push_nil(),
        }
        Ok(())
    }

    /// Dynamic kind of the value. Userdata with a callable `__call` handler
    /// report [`VariableType::Function`]; empty and detached handles report
    /// nil.
    pub fn kind(&self) -> VariableType {
        let Ok(state) = self.state() else {
            return VariableType::Nil;
        };
        if self.push(&state).is_err() {
            return VariableType::Nil;
        }
        let mut kind = state.kind(-1);
        if kind == VariableType::UserData && state.is_callable(-1) {
            kind = VariableType::Function;
        }
        let _ = state.pop(1);
        kind
    }

    /// Call the value with `args`, capturing its first result
    pub fn call<A: IntoArgs>(&self, args: A) -> Result<Handle> {
        let state = self.callable_state()?;
        balanced(&state, || {
            self.push_callable(&state)?;
            let nargs = args.push_args(&state)?;
            state.pcall(nargs, 1).map_err(Error::from_call)?;
            Handle::pop(&state)
        })
    }

    /// Call the value with `args`, decoding its results as `R`
    pub fn invoke<A: IntoArgs, R: FromReturns>(&self, args: A) -> Result<R> {
        let state = self.callable_state()?;
        balanced(&state, || {
            self.push_callable(&state)?;
            let nargs = args.push_args(&state)?;
            state.pcall(nargs, R::COUNT).map_err(Error::from_call)?;
            let results = R::pull(&state)?;
            state.pop(R::COUNT as usize)?;
            Ok(results)
        })
    }

    /// Call the member `name` with the value itself as first argument,
    /// capturing the first result. Member lookup honors `__index`, so
    /// methods of a behavior table are reachable from its objects.
    pub fn call_method<A: IntoArgs>(&self, name: &str, args: A) -> Result<Handle> {
        let state = self.state()?;
        balanced(&state, || {
            self.push(&state)?;
            state.get_field(-1, name)?;
            if !state.is_callable(-1) {
                return Err(Error::NotCallable(state.kind(-1)));
            }
            state.insert(-2)?;
            let nargs = args.push_args(&state)? + 1;
            state.pcall(nargs, 1).map_err(Error::from_call)?;
            Handle::pop(&state)
        })
    }

    /// `value[key]`; the empty handle when the value is not a table
    pub fn field<K: ToStack + ?Sized>(&self, key: &K) -> Result<Handle> {
        if self.slot.is_none() {
            return Ok(Handle::default());
        }
        let state = self.state()?;
        balanced(&state, || {
            self.push(&state)?;
            if state.kind(-1) != VariableType::Table {
                state.pop(1)?;
                return Ok(Handle::default());
            }
            key.encode(&state)?;
            state.get_table(-2)?;
            let value = Handle::pop(&state)?;
            state.pop(1)?;
            Ok(value)
        })
    }

    /// `value[key] = v`
    pub fn set_field<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: ToStack + ?Sized,
        V: ToStack + ?Sized,
    {
        let state = self.state()?;
        balanced(&state, || {
            self.push(&state)?;
            key.encode(&state)?;
            value.encode(&state)?;
            state.set_table(-3)?;
            state.pop(1)?;
            Ok(())
        })
    }

    /// Rebind this handle to a new value. The previous slot is released
    /// (if this was its last copy) before the new one is taken.
    pub fn assign<V: ToStack + ?Sized>(&mut self, value: &V) -> Result<()> {
        let state = self.state()?;
        balanced(&state, || {
            value.encode(&state)?;
            self.slot = None;
            *self = Handle::pop(&state)?;
            Ok(())
        })
    }

    /// Decode the value, failing with [`Error::Mismatch`] when it does not
    /// have `T`'s shape
    pub fn get<T: FromStack>(&self) -> Result<T> {
        self.read(stack::get_checked::<T>)
    }

    /// Decode the value permissively (wrong kinds read as zero values)
    pub fn get_or_default<T: FromStack>(&self) -> Result<T> {
        self.read(stack::get::<T>)
    }

    /// Weak handle observing the same value
    pub fn downgrade(&self) -> Result<WeakHandle> {
        WeakHandle::new(self)
    }

    /// Load `chunk` and run it with this value (a table) as its environment
    pub fn execute_in<C: Chunk + ?Sized>(&self, chunk: &C) -> Result<()> {
        let state = self.state()?;
        balanced(&state, || {
            load_chunk(&state, chunk)?;
            self.push(&state)?;
            state.set_function_env(-2)?;
            state.pcall(0, 0).map_err(Error::from_call)
        })
    }

    fn read<T>(&self, decode: impl FnOnce(&State, i32) -> Result<T>) -> Result<T> {
        let state = self.state()?;
        balanced(&state, || {
            self.push(&state)?;
            let value = decode(&state, -1)?;
            state.pop(1)?;
            Ok(value)
        })
    }

    fn callable_state(&self) -> Result<State> {
        if self.slot.is_none() {
            return Err(Error::NotCallable(VariableType::Nil));
        }
        self.state()
    }

    fn push_callable(&self, state: &State) -> Result<()> {
        self.push(state)?;
        if !state.is_callable(-1) {
            return Err(Error::NotCallable(state.kind(-1)));
        }
        Ok(())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.id()).finish()
    }
}

impl Classify for Handle {
    const SHAPE: Shape = Shape::Reference;
}

impl ToStack for Handle {
    fn encode(&self, state: &State) -> Result<()> {
        self.push(state)
    }
}

impl FromStack for Handle {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        Handle::from_stack(state, idx)
    }

    /// Any slot can be captured
    fn probe(_state: &State, _idx: i32) -> bool {
        true
    }
}

// ============================================================================
// Weak handle
// ============================================================================

/// Weak reference to a runtime value
#[derive(Debug, Clone, Default)]
pub struct WeakHandle {
    cell: Handle,
}

impl WeakHandle {
    /// Observe the value of `handle`
    pub fn new(handle: &Handle) -> Result<Self> {
        let state = handle.state()?;
        balanced(&state, || {
            state.new_table();
            if state.new_metatable(WEAK_CELL)? {
                state.push_string("v");
                state.set_field(-2, "__mode")?;
            }
            state.set_metatable(-2)?;
            handle.push(&state)?;
            state.raw_set_i(-2, 1)?;
            Ok(Self {
                cell: Handle::pop(&state)?,
            })
        })
    }

    /// Strong handle to the value, or the empty handle once it has been
    /// collected
    pub fn upgrade(&self) -> Result<Handle> {
        if self.cell.slot.is_none() {
            return Ok(Handle::default());
        }
        let state = self.cell.state()?;
        balanced(&state, || {
            self.cell.push(&state)?;
            state.raw_get_i(-1, 1)?;
            let handle = Handle::pop(&state)?;
            state.pop(1)?;
            Ok(handle)
        })
    }

    /// Check if the value is still alive
    pub fn is_alive(&self) -> bool {
        self.upgrade().is_ok_and(|handle| handle.is_bound())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackbind_vm::VmOptions;

    fn state() -> State {
        State::new(VmOptions::manual_gc())
    }

    #[test]
    fn test_empty_handle_is_inert() {
        let handle = Handle::default();
        assert!(handle.is_empty());
        assert_eq!(handle.kind(), VariableType::Nil);
        assert!(handle.field("x").unwrap().is_empty());
        assert!(matches!(
            handle.call(()),
            Err(Error::NotCallable(VariableType::Nil))
        ));
        assert!(matches!(handle.state(), Err(Error::Detached)));
    }

    #[test]
    fn test_capture_nil_is_unbound() {
        let s = state();
        s.push_nil();
        let handle = Handle::pop(&s).unwrap();
        assert_eq!(handle.id(), REF_NIL);
        assert!(!handle.is_bound());
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_copies_share_one_slot() {
        let s = state();
        s.new_table();
        let first = Handle::pop(&s).unwrap();
        let id = first.id();
        let second = first.clone();
        assert_eq!(second.id(), id);
        assert_eq!(first.copies(), 2);

        drop(first);
        s.raw_get_i(REGISTRY_INDEX, id as i64).unwrap();
        assert_eq!(s.kind(-1), VariableType::Table);
        s.pop(1).unwrap();

        drop(second);
        s.new_table();
        let reused = Handle::pop(&s).unwrap();
        assert_eq!(reused.id(), id);
    }

    #[test]
    fn test_field_of_non_table_is_empty() {
        let s = state();
        s.push_integer(5);
        let handle = Handle::pop(&s).unwrap();
        assert!(handle.field("x").unwrap().is_empty());
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_set_field_and_field() {
        let s = state();
        s.new_table();
        let table = Handle::pop(&s).unwrap();
        table.set_field("answer", &42).unwrap();
        table.set_field(&1, "first").unwrap();
        assert_eq!(table.field("answer").unwrap().get::<i32>().unwrap(), 42);
        assert_eq!(table.field(&1).unwrap().get::<String>().unwrap(), "first");
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_assign_rebinds() {
        let s = state();
        s.push_integer(1);
        let mut handle = Handle::pop(&s).unwrap();
        let copy = handle.clone();
        handle.assign("text").unwrap();
        assert_eq!(handle.get::<String>().unwrap(), "text");
        assert_eq!(copy.get::<i32>().unwrap(), 1);
        assert_ne!(handle.id(), copy.id());
    }

    #[test]
    fn test_checked_and_permissive_get() {
        let s = state();
        s.push_boolean(true);
        let handle = Handle::pop(&s).unwrap();
        assert!(matches!(
            handle.get::<String>(),
            Err(Error::Mismatch {
                expected: Shape::String,
                found: VariableType::Boolean,
            })
        ));
        assert_eq!(handle.get_or_default::<String>().unwrap(), "");
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_call_and_errors() {
        let s = state();
        s.push_function(|s| {
            let n = s.to_integer(1);
            if n < 0 {
                return Err(stackbind_vm::VmError::Runtime("negative".to_string()));
            }
            s.push_integer(n * 2);
            Ok(1)
        });
        let double = Handle::pop(&s).unwrap();
        assert_eq!(double.call((21,)).unwrap().get::<i32>().unwrap(), 42);
        assert_eq!(double.invoke::<_, i64>((4,)).unwrap(), 8);
        assert!(matches!(double.call((-1,)), Err(Error::Call(m)) if m == "negative"));
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_call_non_callable() {
        let s = state();
        s.new_table();
        let table = Handle::pop(&s).unwrap();
        assert!(matches!(
            table.call(()),
            Err(Error::NotCallable(VariableType::Table))
        ));
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_release_after_close_is_silent() {
        let s = state();
        s.new_table();
        let handle = Handle::pop(&s).unwrap();
        s.close();
        assert!(matches!(handle.state(), Err(Error::Detached)));
        assert_eq!(handle.kind(), VariableType::Nil);
        drop(handle);
    }

    #[test]
    fn test_foreign_state_pushes_nil() {
        let a = state();
        let b = state();
        a.new_table();
        let handle = Handle::pop(&a).unwrap();
        handle.push(&b).unwrap();
        assert_eq!(b.kind(-1), VariableType::Nil);
        assert!(handle.belongs_to(&a));
        assert!(!handle.belongs_to(&b));
    }

    #[test]
    fn test_weak_handle_follows_collection() {
        let s = state();
        s.new_table();
        let strong = Handle::pop(&s).unwrap();
        let weak = strong.downgrade().unwrap();
        assert!(weak.is_alive());

        s.collect_garbage();
        assert!(weak.is_alive());
        assert_eq!(weak.upgrade().unwrap().kind(), VariableType::Table);

        drop(strong);
        s.collect_garbage();
        assert!(!weak.is_alive());
        assert!(weak.upgrade().unwrap().is_empty());
        assert_eq!(s.top(), 0);
    }
}
