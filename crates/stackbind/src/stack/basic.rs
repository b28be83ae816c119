//! Primitive shapes: nil, booleans, numbers, strings and optionals

use super::{FromStack, ToStack};
use crate::error::Result;
use crate::shape::{Classify, Shape};
use stackbind_vm::{State, VariableType};

// ============================================================================
// Nil
// ============================================================================

/// Explicit nil value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nil;

impl Classify for Nil {
    const SHAPE: Shape = Shape::Nil;
}

impl ToStack for Nil {
    fn encode(&self, state: &State) -> Result<()> {
        state.push_nil();
        Ok(())
    }
}

impl FromStack for Nil {
    fn decode(_state: &State, _idx: i32) -> Result<Self> {
        Ok(Nil)
    }

    fn probe(state: &State, idx: i32) -> bool {
        state.kind(idx) == VariableType::Nil
    }
}

// ============================================================================
// Primitive Type Implementations
// ============================================================================

impl Classify for bool {
    const SHAPE: Shape = Shape::Boolean;
}

impl ToStack for bool {
    fn encode(&self, state: &State) -> Result<()> {
        state.push_boolean(*self);
        Ok(())
    }
}

impl FromStack for bool {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        Ok(state.to_boolean(idx))
    }

    fn probe(state: &State, idx: i32) -> bool {
        state.kind(idx) == VariableType::Boolean
    }
}

// Integers of every width share the runtime's single numeric kind. Decoding
// truncates toward zero and then narrows with `as`, without range checks.
macro_rules! impl_integer {
    ($($ty:ty),*) => {$(
        impl Classify for $ty {
            const SHAPE: Shape = Shape::Integer;
        }

        impl ToStack for $ty {
            fn encode(&self, state: &State) -> Result<()> {
                state.push_number(*self as f64);
                Ok(())
            }
        }

        impl FromStack for $ty {
            fn decode(state: &State, idx: i32) -> Result<Self> {
                Ok(state.to_integer(idx) as $ty)
            }

            fn probe(state: &State, idx: i32) -> bool {
                state.kind(idx) == VariableType::Number
            }
        }
    )*};
}

impl_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! impl_float {
    ($($ty:ty),*) => {$(
        impl Classify for $ty {
            const SHAPE: Shape = Shape::Float;
        }

        impl ToStack for $ty {
            fn encode(&self, state: &State) -> Result<()> {
                state.push_number(*self as f64);
                Ok(())
            }
        }

        impl FromStack for $ty {
            fn decode(state: &State, idx: i32) -> Result<Self> {
                Ok(state.to_number(idx) as $ty)
            }

            fn probe(state: &State, idx: i32) -> bool {
                state.kind(idx) == VariableType::Number
            }
        }
    )*};
}

impl_float!(f32, f64);

// ============================================================================
// Strings
// ============================================================================

impl Classify for str {
    const SHAPE: Shape = Shape::String;
}

impl ToStack for str {
    fn encode(&self, state: &State) -> Result<()> {
        state.push_string(self);
        Ok(())
    }
}

impl Classify for String {
    const SHAPE: Shape = Shape::String;
}

impl ToStack for String {
    fn encode(&self, state: &State) -> Result<()> {
        state.push_string(self);
        Ok(())
    }
}

impl FromStack for String {
    fn decode(state: &State, idx: i32) -> Result<Self> {
        Ok(state
            .to_str(idx)
            .map(|s| s.to_string())
            .unwrap_or_default())
    }

    fn probe(state: &State, idx: i32) -> bool {
        state.kind(idx) == VariableType::String
    }
}

// ============================================================================
// Optionals
// ============================================================================

impl<T: Classify> Classify for Option<T> {
    const SHAPE: Shape = Shape::Optional;
}

impl<T: ToStack> ToStack for Option<T> {
    fn encode(&self, state: &State) -> Result<()> {
        match self {
            Some(value) => value.encode(state),
            None => {
                state.push_nil();
                Ok(())
            }
        }
    }
}

impl<T: FromStack> FromStack for Option<T> {
    /// `Some` only when the slot probes as `T`; nil and any other kind read
    /// as `None`
    fn decode(state: &State, idx: i32) -> Result<Self> {
        if T::probe(state, idx) {
            return T::decode(state, idx).map(Some);
        }
        Ok(None)
    }

    fn probe(state: &State, idx: i32) -> bool {
        state.kind(idx) == VariableType::Nil || T::probe(state, idx)
    }
}
