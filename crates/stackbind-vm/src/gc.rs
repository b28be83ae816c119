//! Mark-sweep collector
//!
//! A collection runs in five steps:
//!
//! 1. mark everything reachable from the root set, skipping weak entries
//! 2. pick the unreachable userdata that still need their `__gc` called
//! 3. clear weak entries that point at unreachable objects
//! 4. resurrect the finalizable userdata (and whatever they reach)
//! 5. sweep the rest
//!
//! Running the finalizers and dropping the swept objects is left to
//! [`State::collect_garbage`](crate::State::collect_garbage), which does it
//! after releasing the heap.

use crate::heap::{Heap, Object};
use crate::value::{GcRef, Value};
use std::time::Duration;

/// Garbage collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total finalizers run
    pub finalizers_run: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Objects marked in last collection
    pub last_marked_count: usize,

    /// Objects freed in last collection
    pub last_freed_count: usize,

    /// Weak entries cleared in last collection
    pub last_weak_cleared: usize,

    /// Live objects after last collection
    pub live_objects: usize,
}

impl GcStats {
    pub(crate) fn update(&mut self, pause_time: Duration, outcome: &Collection, live: usize) {
        self.collections += 1;
        self.objects_freed += outcome.freed.len();
        self.finalizers_run += outcome.finalize.len();
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;
        self.last_marked_count = outcome.marked;
        self.last_freed_count = outcome.freed.len();
        self.last_weak_cleared = outcome.weak_cleared;
        self.live_objects = live;
    }

    /// Get survival rate (0.0 to 1.0)
    pub fn survival_rate(&self) -> f64 {
        let total = self.live_objects + self.last_freed_count;
        if total == 0 {
            return 0.0;
        }
        self.live_objects as f64 / total as f64
    }
}

/// Weakness of a table, from its metatable's `__mode` field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WeakMode {
    pub keys: bool,
    pub values: bool,
}

impl WeakMode {
    fn is_weak(self) -> bool {
        self.keys || self.values
    }
}

/// Result of the heap-side part of a collection
pub(crate) struct Collection {
    pub marked: usize,
    pub weak_cleared: usize,
    /// Userdata to finalize, paired with their `__gc` handler
    pub finalize: Vec<(GcRef, Value)>,
    /// Objects to drop once the heap is released
    pub freed: Vec<Object>,
}

impl Heap {
    /// Run mark, weak clearing, resurrection and sweep
    pub(crate) fn collect(&mut self, roots: impl IntoIterator<Item = Value>) -> Collection {
        for slot in self.slots.iter_mut() {
            slot.marked = false;
        }

        let mut worklist: Vec<GcRef> = roots.into_iter().filter_map(|v| v.gc_ref()).collect();
        let mut weak = Vec::new();
        self.mark(&mut worklist, &mut weak);

        let finalize = self.finalizable();
        let weak_cleared = self.clear_weak(&weak);

        for (r, _) in &finalize {
            if let Ok(Object::UserData(ud)) = self.get_mut(*r) {
                ud.finalized = true;
            }
            worklist.push(*r);
        }
        let mut late_weak = Vec::new();
        self.mark(&mut worklist, &mut late_weak);

        let marked = self.slots.iter().filter(|s| s.marked).count();
        let freed = self.sweep();

        Collection {
            marked,
            weak_cleared,
            finalize,
            freed,
        }
    }

    /// Userdata awaiting finalization, in reverse allocation order
    pub(crate) fn pending_finalizers(&mut self) -> Vec<(GcRef, Value)> {
        let mut pending: Vec<(u64, GcRef, Value)> = Vec::new();
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            let r = GcRef {
                index: index as u32,
                generation: slot.generation,
            };
            if let Some(Object::UserData(ud)) = &slot.object {
                if ud.finalized {
                    continue;
                }
                if let Some(handler) = self.gc_handler(ud.metatable) {
                    pending.push((slot.seq, r, handler));
                }
            }
        }
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, r, _) in &pending {
            if let Ok(Object::UserData(ud)) = self.get_mut(*r) {
                ud.finalized = true;
            }
        }
        pending.into_iter().map(|(_, r, h)| (r, h)).collect()
    }

    fn mark(&mut self, worklist: &mut Vec<GcRef>, weak: &mut Vec<(GcRef, WeakMode)>) {
        while let Some(r) = worklist.pop() {
            match self.slots.get_mut(r.index as usize) {
                Some(slot) if slot.generation == r.generation && slot.object.is_some() => {
                    if slot.marked {
                        continue;
                    }
                    slot.marked = true;
                }
                _ => continue,
            }

            match self.get(r) {
                Ok(Object::Table(table)) => {
                    let mode = table
                        .metatable
                        .map(|mt| self.weak_mode(mt))
                        .unwrap_or_default();
                    if let Some(mt) = table.metatable {
                        worklist.push(mt);
                    }
                    if mode.is_weak() {
                        weak.push((r, mode));
                    }
                    for (key, value) in table.iter() {
                        if !mode.keys {
                            worklist.extend(key.gc_ref());
                        }
                        if !mode.values {
                            worklist.extend(value.gc_ref());
                        }
                    }
                }
                Ok(Object::Function(function)) => worklist.extend(function.env),
                Ok(Object::UserData(ud)) => worklist.extend(ud.metatable),
                Err(_) => {}
            }
        }
    }

    fn weak_mode(&self, metatable: GcRef) -> WeakMode {
        match self.table(metatable).map(|t| t.get_str("__mode")) {
            Ok(Value::String(mode)) => WeakMode {
                keys: mode.contains('k'),
                values: mode.contains('v'),
            },
            _ => WeakMode::default(),
        }
    }

    fn gc_handler(&self, metatable: Option<GcRef>) -> Option<Value> {
        let handler = self.table(metatable?).ok()?.get_str("__gc");
        (!handler.is_nil()).then_some(handler)
    }

    fn finalizable(&self) -> Vec<(GcRef, Value)> {
        let mut pending = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.marked {
                continue;
            }
            if let Some(Object::UserData(ud)) = &slot.object {
                if ud.finalized {
                    continue;
                }
                if let Some(handler) = self.gc_handler(ud.metatable) {
                    let r = GcRef {
                        index: index as u32,
                        generation: slot.generation,
                    };
                    pending.push((r, handler));
                }
            }
        }
        pending
    }

    fn clear_weak(&mut self, weak: &[(GcRef, WeakMode)]) -> usize {
        let marks: Vec<bool> = self.slots.iter().map(|s| s.marked).collect();
        let dead = |r: Option<GcRef>| r.is_some_and(|r| !marks[r.index as usize]);

        let mut cleared = 0;
        for (r, mode) in weak {
            if let Ok(table) = self.table_mut(*r) {
                cleared += table.clear_where(|key, value| {
                    (mode.keys && dead(key.gc_ref())) || (mode.values && dead(value.gc_ref()))
                });
            }
        }
        cleared
    }

    fn sweep(&mut self) -> Vec<Object> {
        let dead: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.object.is_some() && !slot.marked)
            .map(|(index, _)| index as u32)
            .collect();

        dead.into_iter().filter_map(|index| self.free(index)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::UserData;
    use crate::table::Table;
    use crate::value::Key;
    use std::rc::Rc;

    fn weak_values_metatable(heap: &mut Heap) -> GcRef {
        let mut mt = Table::new();
        mt.set(Key::string("__mode"), Value::String(Rc::from("v")));
        heap.alloc(Object::Table(mt))
    }

    #[test]
    fn test_collect_unreachable() {
        let mut heap = Heap::new();
        let root = heap.alloc(Object::Table(Table::new()));
        let child = heap.alloc(Object::Table(Table::new()));
        heap.alloc(Object::Table(Table::new()));
        heap.table_mut(root)
            .unwrap()
            .set_int(1, Value::Table(child));

        let outcome = heap.collect([Value::Table(root)]);
        assert_eq!(outcome.marked, 2);
        assert_eq!(outcome.freed.len(), 1);
        assert!(heap.contains(child));
    }

    #[test]
    fn test_collect_cycle() {
        let mut heap = Heap::new();
        let a = heap.alloc(Object::Table(Table::new()));
        let b = heap.alloc(Object::Table(Table::new()));
        heap.table_mut(a).unwrap().set_int(1, Value::Table(b));
        heap.table_mut(b).unwrap().set_int(1, Value::Table(a));

        let outcome = heap.collect(std::iter::empty::<Value>());
        assert_eq!(outcome.freed.len(), 2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_weak_values_cleared() {
        let mut heap = Heap::new();
        let mt = weak_values_metatable(&mut heap);
        let weak = heap.alloc(Object::Table(Table::new()));
        let target = heap.alloc(Object::Table(Table::new()));
        {
            let table = heap.table_mut(weak).unwrap();
            table.metatable = Some(mt);
            table.set_int(1, Value::Table(target));
            table.set_int(2, Value::Number(7.0));
        }

        let outcome = heap.collect([Value::Table(weak)]);
        assert_eq!(outcome.weak_cleared, 1);
        let table = heap.table(weak).unwrap();
        assert!(table.get_int(1).is_nil());
        assert!(matches!(table.get_int(2), Value::Number(n) if n == 7.0));
    }

    #[test]
    fn test_finalizer_resurrects_once() {
        let mut heap = Heap::new();
        let mut mt = Table::new();
        mt.set(Key::string("__gc"), Value::Boolean(true));
        let mt = heap.alloc(Object::Table(mt));
        let ud = heap.alloc(Object::UserData(UserData {
            payload: Box::new(()),
            metatable: Some(mt),
            finalized: false,
        }));

        let first = heap.collect([Value::Table(mt)]);
        assert_eq!(first.finalize.len(), 1);
        assert!(first.freed.is_empty());
        assert!(heap.contains(ud));

        let second = heap.collect([Value::Table(mt)]);
        assert!(second.finalize.is_empty());
        assert_eq!(second.freed.len(), 1);
        assert!(!heap.contains(ud));
    }
}
