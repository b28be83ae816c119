//! Value representation for the stack runtime
//!
//! Every slot on the operand stack, every table entry and every registry entry
//! holds a [`Value`]. Scalars are stored inline; tables, functions and full
//! userdata live on the [`Heap`](crate::heap::Heap) and are referenced through
//! a generation-checked [`GcRef`].
//!
//! # Numbers
//!
//! The runtime has a single numeric kind (`f64`). Integers are not tagged
//! separately: a host `u8` and a host `i64` both travel as `Number`.

use std::fmt;
use std::rc::Rc;

/// Dynamic kind of a stack-resident value.
///
/// The discriminants are stable and match the classic embedding API numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VariableType {
    /// Absent value
    Nil = 0,
    /// `true` / `false`
    Boolean = 1,
    /// Bare host address without lifetime tracking
    LightUserData = 2,
    /// The single numeric kind
    Number = 3,
    /// Immutable text
    String = 4,
    /// Associative table
    Table = 5,
    /// Callable runtime function
    Function = 6,
    /// Heap block owned by the collector
    UserData = 7,
    /// Coroutine (reserved, never produced)
    Thread = 8,
}

impl VariableType {
    /// Name used in diagnostics (`type()` in the base library)
    pub const fn name(self) -> &'static str {
        match self {
            VariableType::Nil => "nil",
            VariableType::Boolean => "boolean",
            VariableType::LightUserData | VariableType::UserData => "userdata",
            VariableType::Number => "number",
            VariableType::String => "string",
            VariableType::Table => "table",
            VariableType::Function => "function",
            VariableType::Thread => "thread",
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to a heap object.
///
/// The generation is bumped whenever a slot is freed, so a stale reference
/// never resolves to whatever object reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl GcRef {
    /// Slot index inside the heap (for debugging)
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// A runtime value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Nil,
    /// Boolean
    Boolean(bool),
    /// Untracked host address
    LightUserData(usize),
    /// Number
    Number(f64),
    /// Immutable string
    String(Rc<str>),
    /// Table on the heap
    Table(GcRef),
    /// Function on the heap
    Function(GcRef),
    /// Full userdata on the heap
    UserData(GcRef),
}

impl Value {
    /// Dynamic kind of this value
    pub fn kind(&self) -> VariableType {
        match self {
            Value::Nil => VariableType::Nil,
            Value::Boolean(_) => VariableType::Boolean,
            Value::LightUserData(_) => VariableType::LightUserData,
            Value::Number(_) => VariableType::Number,
            Value::String(_) => VariableType::String,
            Value::Table(_) => VariableType::Table,
            Value::Function(_) => VariableType::Function,
            Value::UserData(_) => VariableType::UserData,
        }
    }

    /// Check if this value is nil
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Truthiness: everything except `nil` and `false` is true
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Heap reference held by this value, if any
    #[inline]
    pub fn gc_ref(&self) -> Option<GcRef> {
        match self {
            Value::Table(r) | Value::Function(r) | Value::UserData(r) => Some(*r),
            _ => None,
        }
    }

    /// Primitive equality (no metamethods)
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b))
            | (Value::Function(a), Value::Function(b))
            | (Value::UserData(a), Value::UserData(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "boolean({})", b),
            Value::LightUserData(p) => write!(f, "lightuserdata({:#x})", p),
            Value::Number(n) => write!(f, "number({})", n),
            Value::String(s) => write!(f, "string({:?})", s),
            Value::Table(r) => write!(f, "table@{}", r.index),
            Value::Function(r) => write!(f, "function@{}", r.index),
            Value::UserData(r) => write!(f, "userdata@{}", r.index),
        }
    }
}

/// Format a number the way the runtime prints it: integral values without a
/// fractional part, everything else with Rust's shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Hashable table key.
///
/// Built from a [`Value`]; nil and NaN cannot be keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Boolean key
    Boolean(bool),
    /// Light userdata key
    LightUserData(usize),
    /// Number key, stored as normalized bits (`-0.0` == `0.0`)
    Number(u64),
    /// String key
    String(Rc<str>),
    /// Table key
    Table(GcRef),
    /// Function key
    Function(GcRef),
    /// Userdata key
    UserData(GcRef),
}

impl Key {
    /// Convert a value into a key; `None` for nil and NaN
    pub fn from_value(value: &Value) -> Option<Key> {
        Some(match value {
            Value::Nil => return None,
            Value::Number(n) if n.is_nan() => return None,
            Value::Number(n) => Key::number(*n),
            Value::Boolean(b) => Key::Boolean(*b),
            Value::LightUserData(p) => Key::LightUserData(*p),
            Value::String(s) => Key::String(s.clone()),
            Value::Table(r) => Key::Table(*r),
            Value::Function(r) => Key::Function(*r),
            Value::UserData(r) => Key::UserData(*r),
        })
    }

    /// Integer-like number key
    #[inline]
    pub fn integer(i: i64) -> Key {
        Key::number(i as f64)
    }

    /// String key
    #[inline]
    pub fn string(s: &str) -> Key {
        Key::String(Rc::from(s))
    }

    fn number(n: f64) -> Key {
        let n = if n == 0.0 { 0.0 } else { n };
        Key::Number(n.to_bits())
    }

    /// Convert back into a value
    pub fn to_value(&self) -> Value {
        match self {
            Key::Boolean(b) => Value::Boolean(*b),
            Key::LightUserData(p) => Value::LightUserData(*p),
            Key::Number(bits) => Value::Number(f64::from_bits(*bits)),
            Key::String(s) => Value::String(s.clone()),
            Key::Table(r) => Value::Table(*r),
            Key::Function(r) => Value::Function(*r),
            Key::UserData(r) => Value::UserData(*r),
        }
    }

    /// Heap reference held by this key, if any
    pub fn gc_ref(&self) -> Option<GcRef> {
        match self {
            Key::Table(r) | Key::Function(r) | Key::UserData(r) => Some(*r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind() {
        assert_eq!(Value::Nil.kind(), VariableType::Nil);
        assert_eq!(Value::Boolean(true).kind(), VariableType::Boolean);
        assert_eq!(Value::Number(1.5).kind(), VariableType::Number);
        assert_eq!(Value::String(Rc::from("x")).kind(), VariableType::String);
        assert_eq!(Value::LightUserData(8).kind(), VariableType::LightUserData);
    }

    #[test]
    fn test_value_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::String(Rc::from("")).is_truthy());
    }

    #[test]
    fn test_key_rejects_nil_and_nan() {
        assert!(Key::from_value(&Value::Nil).is_none());
        assert!(Key::from_value(&Value::Number(f64::NAN)).is_none());
    }

    #[test]
    fn test_key_normalizes_zero() {
        let pos = Key::from_value(&Value::Number(0.0)).unwrap();
        let neg = Key::from_value(&Value::Number(-0.0)).unwrap();
        assert_eq!(pos, neg);
        assert_eq!(Key::integer(3), Key::from_value(&Value::Number(3.0)).unwrap());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-12.0), "-12");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[test]
    fn test_variable_type_discriminants() {
        assert_eq!(VariableType::Nil as u8, 0);
        assert_eq!(VariableType::UserData as u8, 7);
        assert_eq!(VariableType::Thread as u8, 8);
        assert_eq!(VariableType::LightUserData.name(), "userdata");
    }
}
