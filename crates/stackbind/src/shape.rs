//! Type classifier
//!
//! Every host type that crosses the stack is classified into exactly one
//! [`Shape`]. The classification is an associated constant, so it is fixed
//! at compile time; a type with no [`Classify`] impl simply cannot be
//! marshalled.

use std::fmt;

/// Marshalling shape of a host type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// No value (`()` results)
    Void,
    /// Explicit nil
    Nil,
    /// Boolean
    Boolean,
    /// Any integer width
    Integer,
    /// Floating point
    Float,
    /// Text
    String,
    /// Integer-backed enumeration
    Enum,
    /// Value or nil
    Optional,
    /// Two-element table `{[1] = a, [2] = b}`
    Pair,
    /// Positional container
    Sequence,
    /// Unique or multi set
    Set,
    /// Keyed container
    Map,
    /// Tagged union resolved by probing
    Variant,
    /// Callable
    Function,
    /// Non-owning class pointer
    Pointer,
    /// Owning class pointer
    Shared,
    /// Registry handle
    Reference,
}

impl Shape {
    /// Get shape name
    pub const fn name(self) -> &'static str {
        match self {
            Shape::Void => "void",
            Shape::Nil => "nil",
            Shape::Boolean => "boolean",
            Shape::Integer => "integer",
            Shape::Float => "float",
            Shape::String => "string",
            Shape::Enum => "enum",
            Shape::Optional => "optional",
            Shape::Pair => "pair",
            Shape::Sequence => "sequence",
            Shape::Set => "set",
            Shape::Map => "map",
            Shape::Variant => "variant",
            Shape::Function => "function",
            Shape::Pointer => "pointer",
            Shape::Shared => "shared pointer",
            Shape::Reference => "reference",
        }
    }

    /// Check if values of this shape share the runtime's numeric kind
    pub const fn is_numeric(self) -> bool {
        matches!(self, Shape::Integer | Shape::Float | Shape::Enum)
    }

    /// Check if values of this shape are stored as tables
    pub const fn is_container(self) -> bool {
        matches!(
            self,
            Shape::Pair | Shape::Sequence | Shape::Set | Shape::Map
        )
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compile-time classification of a host type
pub trait Classify {
    /// Shape of this type on the stack
    const SHAPE: Shape;
}

impl<T: Classify + ?Sized> Classify for &T {
    const SHAPE: Shape = T::SHAPE;
}
