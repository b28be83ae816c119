//! Value codec
//!
//! Every marshallable host type implements up to three operations against a
//! stack slot:
//!
//! - [`ToStack::encode`] pushes exactly one value
//! - [`FromStack::decode`] reads the slot without changing the stack depth
//! - [`FromStack::probe`] tests whether the slot holds the type's shape,
//!   without side effects
//!
//! Decoding is permissive: a slot of the wrong kind decodes to the type's
//! zero value instead of failing (`nil` reads as `""`, `0`, `false`).
//! Checked reads go through [`get_checked`] or
//! [`Handle::get`](crate::Handle::get).
//!
//! Composite shapes (optionals, pairs, containers, variants) recurse into
//! their element types, so a type whose elements cannot be marshalled
//! fails to compile instead of failing at runtime.

pub mod basic;
pub mod class;
pub mod container;
pub mod function;
pub mod sum;

use crate::error::{Error, Result};
use crate::shape::Classify;
use stackbind_vm::State;

// ============================================================================
// Codec traits
// ============================================================================

/// Host value that can be pushed onto the stack
pub trait ToStack: Classify {
    /// Push exactly one value
    fn encode(&self, state: &State) -> Result<()>;
}

/// Host value that can be read from a stack slot
pub trait FromStack: Classify + Sized {
    /// Read the value at `idx`; the stack depth is unchanged
    fn decode(state: &State, idx: i32) -> Result<Self>;

    /// Check whether the value at `idx` has this type's shape
    fn probe(state: &State, idx: i32) -> bool;
}

impl<T: ToStack + ?Sized> ToStack for &T {
    fn encode(&self, state: &State) -> Result<()> {
        (**self).encode(state)
    }
}

/// Push a value
pub fn push<T: ToStack + ?Sized>(state: &State, value: &T) -> Result<()> {
    value.encode(state)
}

/// Read the value at `idx`, permissively
pub fn get<T: FromStack>(state: &State, idx: i32) -> Result<T> {
    T::decode(state, idx)
}

/// Read the value at `idx`, failing with [`Error::Mismatch`] when the slot
/// does not hold `T`'s shape
pub fn get_checked<T: FromStack>(state: &State, idx: i32) -> Result<T> {
    if !T::probe(state, idx) {
        return Err(Error::Mismatch {
            expected: T::SHAPE,
            found: state.kind(idx),
        });
    }
    T::decode(state, idx)
}

/// Check whether the value at `idx` holds `T`'s shape
pub fn is<T: FromStack>(state: &State, idx: i32) -> bool {
    T::probe(state, idx)
}

/// Run `f`, restoring the stack depth if it fails
pub(crate) fn balanced<T>(state: &State, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let top = state.top();
    f().inspect_err(|_| {
        let _ = state.set_top(top);
    })
}

// ============================================================================
// Argument lists and results
// ============================================================================

/// Tuple of values pushed as call arguments
pub trait IntoArgs {
    /// Push every argument, returning how many were pushed
    fn push_args(self, state: &State) -> Result<usize>;
}

/// Tuple of values read from the arguments of a host callback.
///
/// Argument `i` is read from slot `i + 1` only if at least `i + 1` arguments
/// were passed; missing trailing arguments are default-constructed.
pub trait FromArgs: Sized {
    /// Read the arguments from slots `1..=argc`
    fn from_args(state: &State, argc: i32) -> Result<Self>;
}

/// Values a host callback returns to the runtime
pub trait Returns {
    /// Push the results, returning how many were pushed
    fn push_returns(self, state: &State) -> Result<usize>;
}

impl Returns for () {
    fn push_returns(self, _state: &State) -> Result<usize> {
        Ok(0)
    }
}

impl<T: ToStack> Returns for T {
    fn push_returns(self, state: &State) -> Result<usize> {
        self.encode(state)?;
        Ok(1)
    }
}

/// Values a runtime call returns to the host
pub trait FromReturns: Sized {
    /// Number of results requested from the call
    const COUNT: i32;

    /// Read the results from the top `COUNT` slots without popping them
    fn pull(state: &State) -> Result<Self>;
}

impl FromReturns for () {
    const COUNT: i32 = 0;

    fn pull(_state: &State) -> Result<Self> {
        Ok(())
    }
}

impl<T: FromStack> FromReturns for T {
    const COUNT: i32 = 1;

    fn pull(state: &State) -> Result<Self> {
        T::decode(state, -1)
    }
}

macro_rules! impl_args {
    ($($name:ident : $idx:tt),*) => {
        impl<$($name: ToStack),*> IntoArgs for ($($name,)*) {
            #[allow(unused_variables, unused_mut)]
            fn push_args(self, state: &State) -> Result<usize> {
                let mut count = 0;
                $(
                    self.$idx.encode(state)?;
                    count += 1;
                )*
                Ok(count)
            }
        }

        impl<$($name: FromStack + Default),*> FromArgs for ($($name,)*) {
            #[allow(unused_variables)]
            fn from_args(state: &State, argc: i32) -> Result<Self> {
                Ok(($(
                    if argc > $idx {
                        $name::decode(state, $idx + 1)?
                    } else {
                        $name::default()
                    },
                )*))
            }
        }
    };
}

impl_args!();
impl_args!(A: 0);
impl_args!(A: 0, B: 1);
impl_args!(A: 0, B: 1, C: 2);
impl_args!(A: 0, B: 1, C: 2, D: 3);
impl_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
