//! Container shapes
//!
//! | Host type                         | Shape    | Runtime form                  |
//! |-----------------------------------|----------|-------------------------------|
//! | `(A, B)`                          | pair     | `{[1] = a, [2] = b}`          |
//! | `Vec<T>`, `VecDeque<T>`           | sequence | `{[1] = v1, [2] = v2, ...}`   |
//! | `BTreeSet`, `HashSet`, `MultiSet` | set      | `{[1] = v1, [2] = v2, ...}`   |
//! | `BTreeMap<K, V>`, `HashMap<K, V>` | map      | `{[k1] = v1, [k2] = v2, ...}` |
//!
//! Sequences and sets keep only entries whose key is a number and whose
//! value probes as the element type; maps keep every entry. Decoding walks
//! the table with `next`, so a sequence decoded from a table that was not
//! built in key order comes back in traversal order.

use super::{balanced, FromStack, ToStack};
use crate::error::Result;
use crate::shape::{Classify, Shape};
use stackbind_vm::{State, VariableType, VmError};
use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};
use tracing::warn;

// ============================================================================
// Table helpers
// ============================================================================

/// Push a new table holding `items` under the keys `1..=n`
fn encode_positional<'a, T, I>(state: &State, items: I) -> Result<()>
where
    T: ToStack + 'a,
    I: IntoIterator<Item = &'a T>,
{
    balanced(state, || {
        state.new_table();
        for (i, item) in items.into_iter().enumerate() {
            item.encode(state)?;
            state.raw_set_i(-2, i as i64 + 1)?;
        }
        Ok(())
    })
}

/// Walk every entry of the table at `idx`. While `f` runs the key is at -2
/// and the value at -1. Non-tables have no entries.
fn for_each_entry(
    state: &State,
    idx: i32,
    mut f: impl FnMut(&State) -> Result<()>,
) -> Result<()> {
    if state.kind(idx) != VariableType::Table {
        return Ok(());
    }
    let idx = state.abs_index(idx);
    balanced(state, || {
        state.push_nil();
        while state.next(idx)? {
            f(state)?;
            state.pop(1)?;
        }
        Ok(())
    })
}

/// Walk the entries with a positional key whose value probes as `T`
fn for_each_element<T: FromStack>(
    state: &State,
    idx: i32,
    mut f: impl FnMut(T),
) -> Result<()> {
    for_each_entry(state, idx, |state| {
        if state.kind(-2) == VariableType::Number && T::probe(state, -1) {
            f(T::decode(state, -1)?);
        }
        Ok(())
    })
}

fn is_table(state: &State, idx: i32) -> bool {
    state.kind(idx) == VariableType::Table
}

// ============================================================================
// Pair
// ============================================================================

impl<A: Classify, B: Classify> Classify for (A, B) {
    const SHAPE: Shape = Shape::Pair;
}

impl<A: ToStack, B: ToStack> ToStack for (A, B) {
    fn encode(&self, state: &State) -> Result<()> {
        balanced(state, || {
            state.new_table();
            self.0.encode(state)?;
            state.raw_set_i(-2, 1)?;
            self.1.encode(state)?;
            state.raw_set_i(-2, 2)?;
            Ok(())
        })
    }
}

impl<A: FromStack + Default, B: FromStack + Default> FromStack for (A, B) {
    /// Absent sides (and non-tables) default-construct
    fn decode(state: &State, idx: i32) -> Result<Self> {
        if !is_table(state, idx) {
            return Ok(Default::default());
        }
        let idx = state.abs_index(idx);
        balanced(state, || {
            let first = decode_field(state, idx, 1)?;
            let second = decode_field(state, idx, 2)?;
            Ok((first, second))
        })
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

fn decode_field<T: FromStack + Default>(state: &State, idx: i32, key: i64) -> Result<T> {
    state.push_integer(key);
    state.get_table(idx)?;
    let value = if state.is_nil(-1) {
        T::default()
    } else {
        T::decode(state, -1)?
    };
    state.pop(1)?;
    Ok(value)
}

// ============================================================================
// Sequences
// ============================================================================

impl<T: Classify> Classify for Vec<T> {
    const SHAPE: Shape = Shape::Sequence;
}

impl<T: ToStack> ToStack for Vec<T> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_positional(state, self)
    }
}

impl<T: FromStack> FromStack for Vec<T> {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = Vec::new();
        for_each_element(state, idx, |value| out.push(value))?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

impl<T: Classify> Classify for VecDeque<T> {
    const SHAPE: Shape = Shape::Sequence;
}

impl<T: ToStack> ToStack for VecDeque<T> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_positional(state, self)
    }
}

impl<T: FromStack> FromStack for VecDeque<T> {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = VecDeque::new();
        for_each_element(state, idx, |value| out.push_back(value))?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

// ============================================================================
// Sets
// ============================================================================

impl<T: Classify> Classify for BTreeSet<T> {
    const SHAPE: Shape = Shape::Set;
}

impl<T: ToStack> ToStack for BTreeSet<T> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_positional(state, self)
    }
}

impl<T: FromStack + Ord> FromStack for BTreeSet<T> {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = BTreeSet::new();
        for_each_element(state, idx, |value| {
            out.insert(value);
        })?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

impl<T: Classify, S> Classify for HashSet<T, S> {
    const SHAPE: Shape = Shape::Set;
}

impl<T: ToStack, S> ToStack for HashSet<T, S> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_positional(state, self)
    }
}

impl<T, S> FromStack for HashSet<T, S>
where
    T: FromStack + Eq + Hash,
    S: BuildHasher + Default,
{
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = HashSet::with_hasher(S::default());
        for_each_element(state, idx, |value| {
            out.insert(value);
        })?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

/// Ordered multiset: each distinct value with its number of occurrences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSet<T: Ord> {
    counts: BTreeMap<T, usize>,
    len: usize,
}

impl<T: Ord> Default for MultiSet<T> {
    fn default() -> Self {
        Self {
            counts: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T: Ord> MultiSet<T> {
    /// Create an empty multiset
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one occurrence
    pub fn insert(&mut self, value: T) {
        *self.counts.entry(value).or_insert(0) += 1;
        self.len += 1;
    }

    /// Remove one occurrence; returns `false` if the value was absent
    pub fn remove(&mut self, value: &T) -> bool {
        match self.counts.get_mut(value) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.counts.remove(value);
            }
            None => return false,
        }
        self.len -= 1;
        true
    }

    /// Occurrences of `value`
    pub fn count(&self, value: &T) -> usize {
        self.counts.get(value).copied().unwrap_or(0)
    }

    /// Check if at least one occurrence of `value` is present
    pub fn contains(&self, value: &T) -> bool {
        self.counts.contains_key(value)
    }

    /// Total number of occurrences
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the multiset is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distinct values with their counts, in ascending order
    pub fn counts(&self) -> btree_map::Iter<'_, T, usize> {
        self.counts.iter()
    }

    /// Every occurrence in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.counts
            .iter()
            .flat_map(|(value, &count)| std::iter::repeat(value).take(count))
    }
}

impl<T: Ord> FromIterator<T> for MultiSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

impl<T: Ord + Classify> Classify for MultiSet<T> {
    const SHAPE: Shape = Shape::Set;
}

impl<T: Ord + ToStack> ToStack for MultiSet<T> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_positional(state, self.iter())
    }
}

impl<T: Ord + FromStack> FromStack for MultiSet<T> {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = MultiSet::new();
        for_each_element(state, idx, |value| out.insert(value))?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

// ============================================================================
// Maps
// ============================================================================

/// Push a new table with one entry per pair. Pairs whose key cannot index a
/// table (nil, NaN) are skipped with a warning.
fn encode_entries<'a, K, V, I>(state: &State, entries: I) -> Result<()>
where
    K: ToStack + 'a,
    V: ToStack + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    balanced(state, || {
        state.new_table();
        for (key, value) in entries {
            key.encode(state)?;
            value.encode(state)?;
            match state.raw_set(-3) {
                Ok(()) => {}
                Err(VmError::Runtime(reason)) => {
                    warn!(%reason, "skipped map entry with an invalid key");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    })
}

/// Decode every entry; the first occurrence of a key wins
fn decode_entries<K: FromStack, V: FromStack>(
    state: &State,
    idx: i32,
    mut insert: impl FnMut(K, V),
) -> Result<()> {
    for_each_entry(state, idx, |state| {
        let key = K::decode(state, -2)?;
        let value = V::decode(state, -1)?;
        insert(key, value);
        Ok(())
    })
}

impl<K: Classify, V: Classify> Classify for BTreeMap<K, V> {
    const SHAPE: Shape = Shape::Map;
}

impl<K: ToStack, V: ToStack> ToStack for BTreeMap<K, V> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_entries(state, self)
    }
}

impl<K: FromStack + Ord, V: FromStack> FromStack for BTreeMap<K, V> {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = BTreeMap::new();
        decode_entries(state, idx, |key, value| {
            out.entry(key).or_insert(value);
        })?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}

impl<K: Classify, V: Classify, S> Classify for HashMap<K, V, S> {
    const SHAPE: Shape = Shape::Map;
}

impl<K: ToStack, V: ToStack, S> ToStack for HashMap<K, V, S> {
    fn encode(&self, state: &State) -> Result<()> {
        encode_entries(state, self)
    }
}

impl<K, V, S> FromStack for HashMap<K, V, S>
where
    K: FromStack + Eq + Hash,
    V: FromStack,
    S: BuildHasher + Default,
{
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let mut out = HashMap::with_hasher(S::default());
        decode_entries(state, idx, |key, value| {
            out.entry(key).or_insert(value);
        })?;
        Ok(out)
    }

    fn probe(state: &State, idx: i32) -> bool {
        is_table(state, idx)
    }
}
