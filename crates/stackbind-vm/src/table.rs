//! Associative tables
//!
//! Entries are kept in insertion order with a hash index on the side, so
//! `next` traversal is deterministic. Assigning nil to an existing key leaves
//! a tombstone in place; this keeps an in-flight traversal valid. Tombstones
//! are compacted away when a new key is inserted and they outnumber the live
//! entries.

use crate::value::{GcRef, Key, Value};
use crate::{VmError, VmResult};
use rustc_hash::FxHashMap;

/// Runtime table
#[derive(Default)]
pub struct Table {
    entries: Vec<(Key, Value)>,
    index: FxHashMap<Key, usize>,
    tombstones: usize,
    pub(crate) metatable: Option<GcRef>,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw lookup
    pub fn get(&self, key: &Key) -> Value {
        match self.index.get(key) {
            Some(&pos) => self.entries[pos].1.clone(),
            None => Value::Nil,
        }
    }

    /// Raw lookup by value; nil and NaN keys always miss
    pub fn get_value(&self, key: &Value) -> Value {
        match Key::from_value(key) {
            Some(key) => self.get(&key),
            None => Value::Nil,
        }
    }

    /// Raw integer lookup
    #[inline]
    pub fn get_int(&self, i: i64) -> Value {
        self.get(&Key::integer(i))
    }

    /// Raw lookup of a string field
    #[inline]
    pub fn get_str(&self, name: &str) -> Value {
        self.get(&Key::string(name))
    }

    /// Raw assignment
    pub fn set(&mut self, key: Key, value: Value) {
        if let Some(&pos) = self.index.get(&key) {
            let slot = &mut self.entries[pos].1;
            match (slot.is_nil(), value.is_nil()) {
                (false, true) => self.tombstones += 1,
                (true, false) => self.tombstones -= 1,
                _ => {}
            }
            *slot = value;
            return;
        }

        if value.is_nil() {
            return;
        }

        if self.tombstones > 8 && self.tombstones * 2 > self.entries.len() {
            self.compact();
        }

        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
    }

    /// Raw assignment by value; fails for nil and NaN keys
    pub fn set_value(&mut self, key: &Value, value: Value) -> VmResult<()> {
        match Key::from_value(key) {
            Some(key) => {
                self.set(key, value);
                Ok(())
            }
            None if key.is_nil() => Err(VmError::Runtime("table index is nil".to_string())),
            None => Err(VmError::Runtime("table index is NaN".to_string())),
        }
    }

    /// Raw integer assignment
    #[inline]
    pub fn set_int(&mut self, i: i64, value: Value) {
        self.set(Key::integer(i), value);
    }

    /// A border of the sequence part: `n` such that `t[n] ~= nil` (or
    /// `n == 0`) and `t[n + 1] == nil`. With holes, any border may be
    /// returned.
    pub fn length(&self) -> usize {
        if self.get_int(1).is_nil() {
            return 0;
        }

        // unbounded search: double until a nil is hit, then bisect
        let (mut i, mut j) = (1i64, 2i64);
        while !self.get_int(j).is_nil() {
            i = j;
            match j.checked_mul(2) {
                Some(next) => j = next,
                None => return i as usize,
            }
        }
        while j - i > 1 {
            let m = i + (j - i) / 2;
            if self.get_int(m).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i as usize
    }

    /// Traversal step: the live entry following `after` (`None` = first)
    pub fn next(&self, after: &Value) -> VmResult<Option<(Value, Value)>> {
        let start = if after.is_nil() {
            0
        } else {
            let key = Key::from_value(after)
                .ok_or_else(|| VmError::Runtime("invalid key to 'next'".to_string()))?;
            match self.index.get(&key) {
                Some(&pos) => pos + 1,
                None => return Err(VmError::Runtime("invalid key to 'next'".to_string())),
            }
        };

        Ok(self.entries[start.min(self.entries.len())..]
            .iter()
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.to_value(), v.clone())))
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len() - self.tombstones
    }

    /// Check if the table has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metatable of this table
    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }

    /// Iterate over live entries
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        self.entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k, v))
    }

    /// Drop entries matching the predicate (used for weak tables)
    pub(crate) fn clear_where(&mut self, mut dead: impl FnMut(&Key, &Value) -> bool) -> usize {
        let mut cleared = 0;
        for (key, value) in self.entries.iter_mut() {
            if !value.is_nil() && dead(key, value) {
                *value = Value::Nil;
                cleared += 1;
            }
        }
        self.tombstones += cleared;
        cleared
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (pos, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(key.clone(), pos);
        }
        self.tombstones = 0;
    }
}
