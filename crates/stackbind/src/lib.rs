//! Stackbind
//!
//! Type-directed marshalling between host values and the stackbind runtime.
//! Each host type is classified into a [`Shape`] at compile time, and its
//! [`ToStack`] / [`FromStack`] impls move values across the operand stack.
//! Runtime values outlive the stack through reference-counted [`Handle`]s,
//! and host objects are handed over either as non-owning [`Ptr`]s or as
//! owning `Rc`s that the collector releases.
//!
//! # Architecture
//!
//! - [`shape`]: the type classifier
//! - [`stack`]: the value codec (primitives, containers, sum types, class
//!   values and callables)
//! - [`reference`]: strong and weak handles
//! - [`ownership`] / [`object`]: owning userdata and polymorphic objects
//! - [`engine`], [`metatable`], [`sandbox`]: the runtime instance, behavior
//!   tables and isolated global scopes
//!
//! # Example
//!
//! ```ignore
//! use stackbind::{Engine, Function};
//!
//! let engine = Engine::new();
//! engine.set_global("greet", &Function::new(|name: String| format!("Hello, {}", name)))?;
//!
//! let greet = engine.global("greet")?;
//! assert_eq!(greet.invoke::<_, String>(("World",))?, "Hello, World");
//! ```

#![warn(rust_2018_idioms)]

pub mod engine;
pub mod error;
pub mod identity;
pub mod metatable;
pub mod object;
pub mod ownership;
pub mod reference;
pub mod sandbox;
pub mod shape;
pub mod stack;

pub use engine::{Chunk, Engine, EngineOptions, HostChunk};
pub use error::{Error, Result};
pub use identity::type_identity;
pub use metatable::{Metatable, INHERITED_OPERATORS};
pub use object::{downcast_rc, AsAny, Object, ObjectPtr};
pub use ownership::{reclaim, OwnershipBox};
pub use reference::{Handle, WeakHandle};
pub use sandbox::Sandbox;
pub use shape::{Classify, Shape};
pub use stack::basic::Nil;
pub use stack::class::{push_object, Ptr};
pub use stack::container::MultiSet;
pub use stack::function::{Function, HostFn, NativeFn, RawFunction};
pub use stack::{
    get, get_checked, is, push, FromArgs, FromReturns, FromStack, IntoArgs, Returns, ToStack,
};

pub use stackbind_vm as vm;
pub use stackbind_vm::{GcStats, State, VariableType, VmError, VmOptions, VmResult};
