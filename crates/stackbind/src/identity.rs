//! Stable type identifiers
//!
//! Class values find their behavior table in the registry under
//! [`type_identity`]. The identifier is the fully qualified type path with
//! every `::` separator turned into `.`, so it is deterministic for a given
//! build and distinct paths never collide.

use std::any::type_name;

/// Registry key of the behavior table for `T`
pub fn type_identity<T: ?Sized>() -> String {
    type_name::<T>().replace("::", ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget;

    mod nested {
        pub struct Widget;
    }

    #[test]
    fn test_identity_is_stable() {
        assert_eq!(type_identity::<Widget>(), type_identity::<Widget>());
        assert!(type_identity::<Widget>().ends_with("Widget"));
        assert!(!type_identity::<Widget>().contains("::"));
    }

    #[test]
    fn test_identity_distinguishes_paths() {
        assert_ne!(
            type_identity::<Widget>(),
            type_identity::<nested::Widget>()
        );
    }

    mod a {
        pub mod bc {
            pub struct D;
        }
    }

    mod ab {
        pub mod c {
            pub struct D;
        }
    }

    #[test]
    fn test_identity_keeps_segment_boundaries() {
        assert_ne!(type_identity::<a::bc::D>(), type_identity::<ab::c::D>());
        assert!(type_identity::<a::bc::D>().ends_with(".a.bc.D"));
    }

    #[test]
    fn test_identity_of_generic() {
        let name = type_identity::<Vec<u8>>();
        assert!(name.ends_with("Vec<u8>"));
        assert!(!name.contains("::"));
    }
}
