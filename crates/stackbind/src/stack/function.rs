//! Callable bridge
//!
//! Host closures reach the runtime as userdata with a shared behavior table
//! whose `__call` runs the closure and whose `__gc` releases it. Runtime
//! callables reach the host as [`Function`] values backed by a [`Handle`]:
//! calling one pushes the arguments, runs a protected call and decodes the
//! results, surfacing runtime errors as [`Error::Call`].
//!
//! ```ignore
//! let greet = Function::new(|name: String| format!("Hello, {}", name));
//! engine.set_global("greet", &greet)?;
//!
//! let greet: Function<(String,), String> = engine.global("greet")?.get()?;
//! assert_eq!(greet.call(("World".to_string(),))?, "Hello, World");
//! ```

use super::{FromArgs, FromReturns, FromStack, IntoArgs, Returns, ToStack};
use crate::error::{Error, Result};
use crate::reference::Handle;
use crate::shape::{Classify, Shape};
use stackbind_vm::{State, VariableType, VmError, VmResult, GLOBALS_INDEX};
use std::fmt;
use std::rc::Rc;

/// Registry metatable shared by every host function userdata
const HOST_FUNCTION: &str = "stackbind.HostFunction";

/// Stack-level body of a host function: reads its arguments from slots
/// `1..=top` and returns how many results it pushed
pub(crate) type Dispatch = Rc<dyn Fn(&State) -> Result<usize>>;

/// Push a host function userdata running `dispatch`. Host functions see
/// the true global table, wherever they are first pushed from.
pub(crate) fn push_host_function(state: &State, dispatch: Dispatch) -> Result<()> {
    state.new_userdata::<Option<Dispatch>>(Some(dispatch));
    if state.new_metatable(HOST_FUNCTION)? {
        state.push_function(call_host_function);
        state.push_value(GLOBALS_INDEX);
        state.set_function_env(-2)?;
        state.set_field(-2, "__call")?;
        state.push_function(release_host_function);
        state.set_field(-2, "__gc")?;
    }
    state.set_metatable(-2)?;
    Ok(())
}

fn call_host_function(state: &State) -> VmResult<usize> {
    let dispatch = state
        .with_userdata::<Option<Dispatch>, _>(1, |slot| slot.clone())
        .flatten()
        .ok_or_else(|| VmError::Runtime("attempt to call a released host function".to_string()))?;
    state.remove(1)?;
    dispatch(state).map_err(Error::into_vm)
}

fn release_host_function(state: &State) -> VmResult<usize> {
    let released = state.with_userdata::<Option<Dispatch>, _>(1, Option::take);
    drop(released);
    Ok(0)
}

// ============================================================================
// Typed functions
// ============================================================================

/// Host callable taking the argument tuple `A`.
///
/// Implemented for every `Fn(T1, ..., Tn) -> R` with up to eight
/// parameters.
pub trait HostFn<A, R>: 'static {
    /// Call with an argument tuple
    fn invoke(&self, args: A) -> R;
}

macro_rules! impl_host_fn {
    ($($name:ident),*) => {
        impl<Func, Ret, $($name),*> HostFn<($($name,)*), Ret> for Func
        where
            Func: Fn($($name),*) -> Ret + 'static,
        {
            #[allow(non_snake_case)]
            fn invoke(&self, ($($name,)*): ($($name,)*)) -> Ret {
                self($($name),*)
            }
        }
    };
}

impl_host_fn!();
impl_host_fn!(A);
impl_host_fn!(A, B);
impl_host_fn!(A, B, C);
impl_host_fn!(A, B, C, D);
impl_host_fn!(A, B, C, D, E);
impl_host_fn!(A, B, C, D, E, F);
impl_host_fn!(A, B, C, D, E, F, G);
impl_host_fn!(A, B, C, D, E, F, G, H);

/// Callable with argument tuple `A` and result `R`, usable from both sides.
///
/// Built from a host closure it encodes as a runtime callable; decoded from
/// a runtime callable it calls back into the runtime. Pushing a decoded
/// function back onto its own runtime pushes the original value.
pub struct Function<A, R> {
    call: Rc<dyn Fn(A) -> Result<R>>,
    origin: Option<Handle>,
}

impl<A: 'static, R: 'static> Function<A, R> {
    /// Wrap a host closure
    pub fn new<F: HostFn<A, R>>(f: F) -> Self {
        Self {
            call: Rc::new(move |args| Ok(f.invoke(args))),
            origin: None,
        }
    }

    /// Wrap a host closure that can fail; the error is raised in the
    /// runtime when called from there
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(A) -> Result<R> + 'static,
    {
        Self {
            call: Rc::new(f),
            origin: None,
        }
    }

    /// Call the function
    pub fn call(&self, args: A) -> Result<R> {
        (self.call)(args)
    }

    /// Runtime value this function was decoded from
    pub fn handle(&self) -> Option<&Handle> {
        self.origin.as_ref()
    }
}

impl<A, R> Clone for Function<A, R> {
    fn clone(&self) -> Self {
        Self {
            call: Rc::clone(&self.call),
            origin: self.origin.clone(),
        }
    }
}

impl<A: 'static, R: 'static> Default for Function<A, R> {
    /// A function that is not callable, like an empty handle
    fn default() -> Self {
        Self::fallible(|_| Err(Error::NotCallable(VariableType::Nil)))
    }
}

impl<A, R> fmt::Debug for Function<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl<A, R> Classify for Function<A, R> {
    const SHAPE: Shape = Shape::Function;
}

impl<A, R> ToStack for Function<A, R>
where
    A: FromArgs + 'static,
    R: Returns + 'static,
{
    fn encode(&self, state: &State) -> Result<()> {
        if let Some(origin) = self.origin.as_ref().filter(|h| h.belongs_to(state)) {
            return origin.push(state);
        }
        let call = Rc::clone(&self.call);
        push_host_function(
            state,
            Rc::new(move |state: &State| {
                let args = A::from_args(state, state.top())?;
                call(args)?.push_returns(state)
            }),
        )
    }
}

impl<A, R> FromStack for Function<A, R>
where
    A: IntoArgs + 'static,
    R: FromReturns + 'static,
{
    fn decode(state: &State, idx: i32) -> Result<Self> {
        let handle = Handle::from_stack(state, idx)?;
        let target = handle.clone();
        Ok(Self {
            call: Rc::new(move |args: A| target.invoke::<A, R>(args)),
            origin: Some(handle),
        })
    }

    fn probe(state: &State, idx: i32) -> bool {
        state.is_callable(idx)
    }
}

// ============================================================================
// Untyped functions
// ============================================================================

/// Host callback working on the stack directly: arguments are slots
/// `1..=top`, and the return value is the number of results pushed
#[derive(Clone)]
pub struct RawFunction(Dispatch);

impl RawFunction {
    /// Wrap a stack callback
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&State) -> Result<usize> + 'static,
    {
        Self(Rc::new(f))
    }
}

impl fmt::Debug for RawFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawFunction")
    }
}

impl Classify for RawFunction {
    const SHAPE: Shape = Shape::Function;
}

impl ToStack for RawFunction {
    fn encode(&self, state: &State) -> Result<()> {
        push_host_function(state, Rc::clone(&self.0))
    }
}

/// Plain runtime function, pushed as a first-class function value rather
/// than a callable userdata (behavior-table hooks such as `__gc` must be
/// functions)
#[derive(Clone, Copy)]
pub struct NativeFn(pub fn(&State) -> VmResult<usize>);

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeFn")
    }
}

impl Classify for NativeFn {
    const SHAPE: Shape = Shape::Function;
}

impl ToStack for NativeFn {
    fn encode(&self, state: &State) -> Result<()> {
        state.push_function(self.0);
        Ok(())
    }
}
