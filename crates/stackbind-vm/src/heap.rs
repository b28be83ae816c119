//! Object heap
//!
//! Every collectable object lives in a slot of a single arena. Slots are
//! recycled through a free list; each reuse bumps the slot generation so that
//! outdated [`GcRef`]s are rejected with [`VmError::StaleReference`].

use crate::table::Table;
use crate::value::GcRef;
use crate::{State, VmError, VmResult};
use std::any::Any;
use std::rc::Rc;

/// Host callback backing a runtime function.
///
/// The callback receives the state with a fresh frame whose slots `1..=n`
/// are the arguments, and returns how many values it left on top of the
/// stack as results.
pub type Callback = Rc<dyn Fn(&State) -> VmResult<usize>>;

/// Runtime function
pub struct Function {
    pub(crate) callback: Callback,
    pub(crate) env: Option<GcRef>,
}

/// Full userdata: a host payload owned by the collector
pub struct UserData {
    pub(crate) payload: Box<dyn Any>,
    pub(crate) metatable: Option<GcRef>,
    pub(crate) finalized: bool,
}

/// Heap object
pub enum Object {
    /// Table
    Table(Table),
    /// Function
    Function(Function),
    /// Full userdata
    UserData(UserData),
}

impl Object {
    fn name(&self) -> &'static str {
        match self {
            Object::Table(_) => "table",
            Object::Function(_) => "function",
            Object::UserData(_) => "userdata",
        }
    }
}

pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) marked: bool,
    /// Allocation sequence number, used to finalize in reverse order on close
    pub(crate) seq: u64,
    pub(crate) object: Option<Object>,
}

/// Arena of heap objects
#[derive(Default)]
pub struct Heap {
    pub(crate) slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    next_seq: u64,
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object
    pub fn alloc(&mut self, object: Object) -> GcRef {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.marked = false;
            slot.seq = seq;
            return GcRef {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            marked: false,
            seq,
            object: Some(object),
        });
        GcRef {
            index,
            generation: 0,
        }
    }

    /// Number of live objects
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Look up an object
    pub fn get(&self, r: GcRef) -> VmResult<&Object> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_ref())
            .ok_or(VmError::StaleReference)
    }

    /// Look up an object mutably
    pub fn get_mut(&mut self, r: GcRef) -> VmResult<&mut Object> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_mut())
            .ok_or(VmError::StaleReference)
    }

    /// Check whether a reference still resolves
    pub fn contains(&self, r: GcRef) -> bool {
        self.get(r).is_ok()
    }

    /// Look up a table
    pub fn table(&self, r: GcRef) -> VmResult<&Table> {
        match self.get(r)? {
            Object::Table(t) => Ok(t),
            other => Err(wrong_kind("table", other)),
        }
    }

    /// Look up a table mutably
    pub fn table_mut(&mut self, r: GcRef) -> VmResult<&mut Table> {
        match self.get_mut(r)? {
            Object::Table(t) => Ok(t),
            other => Err(wrong_kind("table", other)),
        }
    }

    /// Look up a function
    pub fn function(&self, r: GcRef) -> VmResult<&Function> {
        match self.get(r)? {
            Object::Function(f) => Ok(f),
            other => Err(wrong_kind("function", other)),
        }
    }

    /// Look up a function mutably
    pub fn function_mut(&mut self, r: GcRef) -> VmResult<&mut Function> {
        match self.get_mut(r)? {
            Object::Function(f) => Ok(f),
            other => Err(wrong_kind("function", other)),
        }
    }

    /// Look up a userdata
    pub fn userdata(&self, r: GcRef) -> VmResult<&UserData> {
        match self.get(r)? {
            Object::UserData(u) => Ok(u),
            other => Err(wrong_kind("userdata", other)),
        }
    }

    /// Look up a userdata mutably
    pub fn userdata_mut(&mut self, r: GcRef) -> VmResult<&mut UserData> {
        match self.get_mut(r)? {
            Object::UserData(u) => Ok(u),
            other => Err(wrong_kind("userdata", other)),
        }
    }

    /// Free a slot, returning its object so the caller can drop it once the
    /// heap is no longer borrowed
    pub(crate) fn free(&mut self, index: u32) -> Option<Object> {
        let slot = self.slots.get_mut(index as usize)?;
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.marked = false;
        self.free.push(index);
        self.live -= 1;
        Some(object)
    }

    /// Free every object
    pub(crate) fn drain(&mut self) -> Vec<Object> {
        let mut objects = Vec::with_capacity(self.live);
        for index in 0..self.slots.len() as u32 {
            if let Some(object) = self.free(index) {
                objects.push(object);
            }
        }
        objects
    }
}

fn wrong_kind(expected: &str, found: &Object) -> VmError {
    VmError::TypeError(format!("expected {}, found {}", expected, found.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_alloc_and_get() {
        let mut heap = Heap::new();
        let r = heap.alloc(Object::Table(Table::new()));
        assert!(heap.table(r).is_ok());
        assert!(heap.function(r).is_err());
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_heap_stale_reference() {
        let mut heap = Heap::new();
        let first = heap.alloc(Object::Table(Table::new()));
        drop(heap.free(first.index));

        let second = heap.alloc(Object::Table(Table::new()));
        assert_eq!(first.index, second.index);
        assert!(matches!(heap.get(first), Err(VmError::StaleReference)));
        assert!(heap.get(second).is_ok());
    }

    #[test]
    fn test_heap_drain() {
        let mut heap = Heap::new();
        for _ in 0..3 {
            heap.alloc(Object::Table(Table::new()));
        }
        assert_eq!(heap.drain().len(), 3);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_userdata_payload() {
        let mut heap = Heap::new();
        let r = heap.alloc(Object::UserData(UserData {
            payload: Box::new(42u32),
            metatable: None,
            finalized: false,
        }));
        let ud = heap.userdata(r).unwrap();
        assert_eq!(ud.payload.downcast_ref::<u32>(), Some(&42));
    }
}
