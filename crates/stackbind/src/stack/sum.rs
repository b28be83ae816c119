//! Enumerations and sum types
//!
//! Both are declared through macros that emit the enum together with its
//! codec impls:
//!
//! ```ignore
//! stackbind::stack_enum! {
//!     #[derive(Debug, Clone, Copy, Default, PartialEq)]
//!     pub enum Mode {
//!         #[default]
//!         Idle = 0,
//!         Running = 1,
//!     }
//! }
//!
//! stackbind::stack_variant! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub enum Setting {
//!         Unset(Nil),
//!         Flag(bool),
//!         Count(i32),
//!         Text(String),
//!     }
//! }
//! ```
//!
//! The variant tag is never stored: it is recovered from the dynamic kind
//! of the slot by probing the alternatives in declaration order, so the
//! first alternative that accepts a slot always wins.

/// Declare an integer-backed enumeration.
///
/// Encodes as the discriminant. Decoding an unknown discriminant yields the
/// enum's `Default`, so the enum must implement it.
#[macro_export]
macro_rules! stack_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident $(= $value:expr)? ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $( $(#[$vmeta])* $variant $(= $value)? ),+
        }

        impl $crate::Classify for $name {
            const SHAPE: $crate::Shape = $crate::Shape::Enum;
        }

        impl $crate::ToStack for $name {
            fn encode(&self, state: &$crate::State) -> $crate::Result<()> {
                let raw = match self {
                    $( $name::$variant => $name::$variant as i64 ),+
                };
                state.push_integer(raw);
                Ok(())
            }
        }

        impl $crate::FromStack for $name {
            fn decode(state: &$crate::State, idx: i32) -> $crate::Result<Self> {
                let raw = state.to_integer(idx);
                $(
                    if raw == $name::$variant as i64 {
                        return Ok($name::$variant);
                    }
                )+
                Ok(<$name as ::std::default::Default>::default())
            }

            fn probe(state: &$crate::State, idx: i32) -> bool {
                state.kind(idx) == $crate::VariableType::Number
            }
        }
    };
}

/// Declare a sum type whose alternatives each wrap one marshallable type.
///
/// Decoding picks the first alternative (in declaration order) that probes
/// successfully; when none does, the first alternative decodes the slot
/// permissively.
#[macro_export]
macro_rules! stack_variant {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(#[$fmeta:meta])* $first:ident($first_ty:ty)
            $(, $(#[$vmeta:meta])* $variant:ident($ty:ty))* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(#[$fmeta])* $first($first_ty),
            $( $(#[$vmeta])* $variant($ty), )*
        }

        impl $crate::Classify for $name {
            const SHAPE: $crate::Shape = $crate::Shape::Variant;
        }

        impl $crate::ToStack for $name {
            fn encode(&self, state: &$crate::State) -> $crate::Result<()> {
                match self {
                    $name::$first(value) => $crate::ToStack::encode(value, state),
                    $( $name::$variant(value) => $crate::ToStack::encode(value, state), )*
                }
            }
        }

        impl $crate::FromStack for $name {
            fn decode(state: &$crate::State, idx: i32) -> $crate::Result<Self> {
                if <$first_ty as $crate::FromStack>::probe(state, idx) {
                    return <$first_ty as $crate::FromStack>::decode(state, idx).map($name::$first);
                }
                $(
                    if <$ty as $crate::FromStack>::probe(state, idx) {
                        return <$ty as $crate::FromStack>::decode(state, idx).map($name::$variant);
                    }
                )*
                <$first_ty as $crate::FromStack>::decode(state, idx).map($name::$first)
            }

            fn probe(state: &$crate::State, idx: i32) -> bool {
                <$first_ty as $crate::FromStack>::probe(state, idx)
                    $( || <$ty as $crate::FromStack>::probe(state, idx) )*
            }
        }
    };
}
