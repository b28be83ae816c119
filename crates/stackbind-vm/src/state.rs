//! Runtime state and the stack API
//!
//! A [`State`] is a cheap, clonable handle to one runtime instance. All
//! interaction goes through the operand stack: values are pushed, inspected
//! by index and popped. Positive indices count from the bottom of the
//! current frame (1 = first slot), negative indices from the top (-1 = top),
//! and the pseudo indices [`REGISTRY_INDEX`] and [`GLOBALS_INDEX`] address
//! the registry and the global table.
//!
//! No `RefCell` borrow is held while a host callback runs, so callbacks may
//! freely re-enter the state.

use crate::gc::{Collection, GcStats};
use crate::heap::{Callback, Function, Heap, Object, UserData};
use crate::options::VmOptions;
use crate::table::Table;
use crate::value::{format_number, GcRef, Key, Value, VariableType};
use crate::{VmError, VmResult, GLOBALS_INDEX, MULTRET, REF_NIL, REGISTRY_INDEX};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Maximum length of an `__index` / `__newindex` chain
const MAX_META_CHAIN: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Stack position of the frame's first slot
    base: usize,
    /// Environment of the running function (`None` = globals)
    env: Option<GcRef>,
}

struct Inner {
    stack: RefCell<Vec<Value>>,
    frames: RefCell<Vec<Frame>>,
    heap: RefCell<Heap>,
    registry: GcRef,
    globals: GcRef,
    light_metatables: RefCell<FxHashMap<usize, GcRef>>,
    options: VmOptions,
    threshold: Cell<usize>,
    stats: RefCell<GcStats>,
    collecting: Cell<bool>,
    closed: Cell<bool>,
}

/// Handle to a runtime instance
#[derive(Clone)]
pub struct State {
    inner: Rc<Inner>,
}

/// Non-owning handle to a runtime instance
#[derive(Clone, Default)]
pub struct WeakState {
    inner: Weak<Inner>,
}

impl WeakState {
    /// Get the state back, if it is still alive
    pub fn upgrade(&self) -> Option<State> {
        self.inner.upgrade().map(|inner| State { inner })
    }

    /// Check whether this handle points at `state`
    pub fn is(&self, state: &State) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Rc::as_ptr(&state.inner))
    }
}

impl fmt::Debug for WeakState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakState({:p})", self.inner.as_ptr())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("top", &self.top())
            .field("live_objects", &self.live_objects())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(VmOptions::default())
    }
}

impl State {
    /// Create a new runtime instance with an empty registry and global table
    pub fn new(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        let registry = heap.alloc(Object::Table(Table::new()));
        let globals = heap.alloc(Object::Table(Table::new()));

        Self {
            inner: Rc::new(Inner {
                stack: RefCell::new(Vec::new()),
                frames: RefCell::new(vec![Frame {
                    base: 0,
                    env: None,
                }]),
                heap: RefCell::new(heap),
                registry,
                globals,
                light_metatables: RefCell::new(FxHashMap::default()),
                threshold: Cell::new(options.gc_threshold),
                options,
                stats: RefCell::new(GcStats::default()),
                collecting: Cell::new(false),
                closed: Cell::new(false),
            }),
        }
    }

    /// Non-owning handle to this state
    pub fn downgrade(&self) -> WeakState {
        WeakState {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Check whether two handles refer to the same runtime instance
    pub fn ptr_eq(&self, other: &State) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Options this state was created with
    pub fn options(&self) -> &VmOptions {
        &self.inner.options
    }

    // ========================================================================
    // Stack
    // ========================================================================

    fn frame(&self) -> Frame {
        self.inner
            .frames
            .borrow()
            .last()
            .copied()
            .unwrap_or(Frame {
                base: 0,
                env: None,
            })
    }

    /// Number of slots in the current frame
    pub fn top(&self) -> i32 {
        let len = self.inner.stack.borrow().len();
        (len - self.frame().base) as i32
    }

    /// Convert a relative index into an absolute one
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.top() + idx + 1
        }
    }

    /// Stack position of a real (non-pseudo) index
    fn position(&self, idx: i32) -> VmResult<usize> {
        let base = self.frame().base;
        let len = self.inner.stack.borrow().len();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            if pos < len {
                return Ok(pos);
            }
        } else if idx < 0 && idx > REGISTRY_INDEX {
            let back = idx.unsigned_abs() as usize;
            if back <= len - base {
                return Ok(len - back);
            }
        }
        Err(VmError::InvalidIndex(idx))
    }

    fn value_checked(&self, idx: i32) -> VmResult<Value> {
        match idx {
            REGISTRY_INDEX => Ok(Value::Table(self.inner.registry)),
            GLOBALS_INDEX => Ok(Value::Table(self.inner.globals)),
            _ => {
                let pos = self.position(idx)?;
                Ok(self.inner.stack.borrow()[pos].clone())
            }
        }
    }

    /// Value at an index; nil for indices past the top
    pub fn value(&self, idx: i32) -> Value {
        self.value_checked(idx).unwrap_or_default()
    }

    /// Set the number of slots in the current frame; negative values count
    /// from the top (`set_top(-1)` is a no-op)
    pub fn set_top(&self, idx: i32) -> VmResult<()> {
        let base = self.frame().base;
        let mut stack = self.inner.stack.borrow_mut();
        if idx >= 0 {
            stack.resize(base + idx as usize, Value::Nil);
        } else {
            let drop = (idx.unsigned_abs() - 1) as usize;
            if drop > stack.len() - base {
                return Err(VmError::StackUnderflow);
            }
            let len = stack.len() - drop;
            stack.truncate(len);
        }
        Ok(())
    }

    /// Pop `n` values
    pub fn pop(&self, n: usize) -> VmResult<()> {
        if n > self.top() as usize {
            return Err(VmError::StackUnderflow);
        }
        let mut stack = self.inner.stack.borrow_mut();
        let len = stack.len() - n;
        stack.truncate(len);
        Ok(())
    }

    fn pop_value(&self) -> VmResult<Value> {
        if self.top() == 0 {
            return Err(VmError::StackUnderflow);
        }
        self.inner
            .stack
            .borrow_mut()
            .pop()
            .ok_or(VmError::StackUnderflow)
    }

    /// Push a raw value
    pub fn push(&self, value: Value) {
        self.inner.stack.borrow_mut().push(value);
    }

    /// Push nil
    pub fn push_nil(&self) {
        self.push(Value::Nil);
    }

    /// Push a boolean
    pub fn push_boolean(&self, b: bool) {
        self.push(Value::Boolean(b));
    }

    /// Push a number
    pub fn push_number(&self, n: f64) {
        self.push(Value::Number(n));
    }

    /// Push an integer (stored as a number)
    pub fn push_integer(&self, i: i64) {
        self.push(Value::Number(i as f64));
    }

    /// Push a string
    pub fn push_string(&self, s: &str) {
        self.push(Value::String(Rc::from(s)));
    }

    /// Push an untracked host address
    pub fn push_light_userdata(&self, address: usize) {
        self.push(Value::LightUserData(address));
    }

    /// Push a copy of the value at `idx`
    pub fn push_value(&self, idx: i32) {
        let value = self.value(idx);
        self.push(value);
    }

    /// Remove the value at `idx`, shifting the ones above it down
    pub fn remove(&self, idx: i32) -> VmResult<()> {
        let pos = self.position(idx)?;
        self.inner.stack.borrow_mut().remove(pos);
        Ok(())
    }

    /// Move the top value into `idx`, shifting the ones above it up
    pub fn insert(&self, idx: i32) -> VmResult<()> {
        let pos = self.position(idx)?;
        let mut stack = self.inner.stack.borrow_mut();
        let value = stack.pop().ok_or(VmError::StackUnderflow)?;
        stack.insert(pos, value);
        Ok(())
    }

    /// Pop the top value and store it at `idx`
    pub fn replace(&self, idx: i32) -> VmResult<()> {
        let pos = self.position(idx)?;
        let mut stack = self.inner.stack.borrow_mut();
        let value = stack.pop().ok_or(VmError::StackUnderflow)?;
        if pos < stack.len() {
            stack[pos] = value;
        }
        Ok(())
    }

    // ========================================================================
    // Inspection and conversion
    // ========================================================================

    /// Dynamic kind of the value at `idx` (nil past the top)
    pub fn kind(&self, idx: i32) -> VariableType {
        self.value(idx).kind()
    }

    /// Type name of the value at `idx`
    pub fn type_name(&self, idx: i32) -> &'static str {
        if self.is_none(idx) {
            return "no value";
        }
        self.kind(idx).name()
    }

    /// Check whether `idx` is past the top of the frame
    pub fn is_none(&self, idx: i32) -> bool {
        self.value_checked(idx).is_err()
    }

    /// Check whether the value at `idx` is nil (or none)
    pub fn is_nil(&self, idx: i32) -> bool {
        self.value(idx).is_nil()
    }

    /// Truthiness of the value at `idx`
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value(idx).is_truthy()
    }

    /// Number at `idx`; numeric strings are converted, anything else is 0
    pub fn to_number(&self, idx: i32) -> f64 {
        match self.value(idx) {
            Value::Number(n) => n,
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Integer at `idx`: the number truncated toward zero
    pub fn to_integer(&self, idx: i32) -> i64 {
        self.to_number(idx) as i64
    }

    /// String at `idx`; numbers are formatted, anything else is `None`
    pub fn to_str(&self, idx: i32) -> Option<Rc<str>> {
        match self.value(idx) {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(Rc::from(format_number(n))),
            _ => None,
        }
    }

    /// Address carried by a light userdata
    pub fn to_light_userdata(&self, idx: i32) -> Option<usize> {
        match self.value(idx) {
            Value::LightUserData(address) => Some(address),
            _ => None,
        }
    }

    /// Primitive equality of two slots
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        match (self.value_checked(a), self.value_checked(b)) {
            (Ok(a), Ok(b)) => a.raw_equals(&b),
            _ => false,
        }
    }

    /// Display form of the value at `idx`, honoring `__tostring`
    pub fn to_display(&self, idx: i32) -> VmResult<String> {
        let value = self.value(idx);
        let handler = self.metafield(&value, "__tostring");
        if !handler.is_nil() {
            self.push(handler);
            self.push(value);
            self.call(1, 1)?;
            let text = self.to_str(-1);
            self.pop(1)?;
            return text
                .map(|s| s.to_string())
                .ok_or_else(|| VmError::Runtime("'__tostring' must return a string".to_string()));
        }

        Ok(match value {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::String(s) => s.to_string(),
            Value::LightUserData(address) => format!("userdata: {:#010x}", address),
            Value::Table(r) => format!("table: 0x{:08x}", r.index),
            Value::Function(r) => format!("function: 0x{:08x}", r.index),
            Value::UserData(r) => format!("userdata: 0x{:08x}", r.index),
        })
    }

    // ========================================================================
    // Tables
    // ========================================================================

    fn table_at(&self, idx: i32) -> VmResult<GcRef> {
        match self.value_checked(idx)? {
            Value::Table(r) => Ok(r),
            other => Err(VmError::TypeError(format!(
                "table expected, got {}",
                other.kind()
            ))),
        }
    }

    /// Push a new empty table
    pub fn new_table(&self) {
        let r = self.alloc(Object::Table(Table::new()));
        self.push(Value::Table(r));
    }

    /// `t[k]` where `t` is at `idx` and `k` is popped; pushes the result
    pub fn get_table(&self, idx: i32) -> VmResult<()> {
        let object = self.value_checked(idx)?;
        let key = self.pop_value()?;
        let value = self.index_value(object, key)?;
        self.push(value);
        Ok(())
    }

    /// `t[k] = v` where `t` is at `idx`, `v` is the top and `k` below it;
    /// pops both
    pub fn set_table(&self, idx: i32) -> VmResult<()> {
        let object = self.value_checked(idx)?;
        let value = self.pop_value()?;
        let key = self.pop_value()?;
        self.assign_value(object, key, value)
    }

    /// `t[name]`; pushes the result
    pub fn get_field(&self, idx: i32, name: &str) -> VmResult<()> {
        let object = self.value_checked(idx)?;
        let value = self.index_value(object, Value::String(Rc::from(name)))?;
        self.push(value);
        Ok(())
    }

    /// `t[name] = v` where `v` is popped
    pub fn set_field(&self, idx: i32, name: &str) -> VmResult<()> {
        let object = self.value_checked(idx)?;
        let value = self.pop_value()?;
        self.assign_value(object, Value::String(Rc::from(name)), value)
    }

    /// Like [`get_table`](Self::get_table) without metamethods
    pub fn raw_get(&self, idx: i32) -> VmResult<()> {
        let table = self.table_at(idx)?;
        let key = self.pop_value()?;
        let value = self.inner.heap.borrow().table(table)?.get_value(&key);
        self.push(value);
        Ok(())
    }

    /// Like [`set_table`](Self::set_table) without metamethods; always pops
    /// both key and value, even when the key is rejected
    pub fn raw_set(&self, idx: i32) -> VmResult<()> {
        let table = self.table_at(idx)?;
        let value = self.pop_value()?;
        let key = self.pop_value()?;
        self.inner
            .heap
            .borrow_mut()
            .table_mut(table)?
            .set_value(&key, value)
    }

    /// Push `t[n]` without metamethods
    pub fn raw_get_i(&self, idx: i32, n: i64) -> VmResult<()> {
        let table = self.table_at(idx)?;
        let value = self.inner.heap.borrow().table(table)?.get_int(n);
        self.push(value);
        Ok(())
    }

    /// `t[n] = v` without metamethods, where `v` is popped
    pub fn raw_set_i(&self, idx: i32, n: i64) -> VmResult<()> {
        let table = self.table_at(idx)?;
        let value = self.pop_value()?;
        self.inner.heap.borrow_mut().table_mut(table)?.set_int(n, value);
        Ok(())
    }

    /// Raw length: a border for tables, byte length for strings, 0 otherwise
    pub fn raw_len(&self, idx: i32) -> usize {
        match self.value(idx) {
            Value::Table(r) => self
                .inner
                .heap
                .borrow()
                .table(r)
                .map(Table::length)
                .unwrap_or(0),
            Value::String(s) => s.len(),
            _ => 0,
        }
    }

    /// Table traversal: pops a key and pushes the next key/value pair.
    /// Returns `false` (pushing nothing) when the traversal is over.
    pub fn next(&self, idx: i32) -> VmResult<bool> {
        let table = self.table_at(idx)?;
        let key = self.pop_value()?;
        let entry = self.inner.heap.borrow().table(table)?.next(&key)?;
        match entry {
            Some((key, value)) => {
                self.push(key);
                self.push(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn index_value(&self, mut object: Value, key: Value) -> VmResult<Value> {
        for _ in 0..MAX_META_CHAIN {
            let handler = if let Value::Table(r) = &object {
                let found = self.inner.heap.borrow().table(*r)?.get_value(&key);
                if !found.is_nil() {
                    return Ok(found);
                }
                let handler = self.metafield(&object, "__index");
                if handler.is_nil() {
                    return Ok(Value::Nil);
                }
                handler
            } else {
                let handler = self.metafield(&object, "__index");
                if handler.is_nil() {
                    return Err(VmError::TypeError(format!(
                        "attempt to index a {} value",
                        object.kind()
                    )));
                }
                handler
            };

            if let Value::Function(_) = handler {
                self.call_handler(handler, [object, key], 1)?;
                return self.pop_value();
            }
            object = handler;
        }
        Err(VmError::Runtime(
            "'__index' chain too long; possible loop".to_string(),
        ))
    }

    fn assign_value(&self, mut object: Value, key: Value, value: Value) -> VmResult<()> {
        for _ in 0..MAX_META_CHAIN {
            let handler = if let Value::Table(r) = &object {
                let existing = self.inner.heap.borrow().table(*r)?.get_value(&key);
                let handler = if existing.is_nil() {
                    self.metafield(&object, "__newindex")
                } else {
                    Value::Nil
                };
                if handler.is_nil() {
                    return self
                        .inner
                        .heap
                        .borrow_mut()
                        .table_mut(*r)?
                        .set_value(&key, value);
                }
                handler
            } else {
                let handler = self.metafield(&object, "__newindex");
                if handler.is_nil() {
                    return Err(VmError::TypeError(format!(
                        "attempt to index a {} value",
                        object.kind()
                    )));
                }
                handler
            };

            if let Value::Function(_) = handler {
                return self.call_handler(handler, [object, key, value], 0);
            }
            object = handler;
        }
        Err(VmError::Runtime(
            "'__newindex' chain too long; possible loop".to_string(),
        ))
    }

    fn call_handler<const N: usize>(
        &self,
        handler: Value,
        args: [Value; N],
        nresults: i32,
    ) -> VmResult<()> {
        self.push(handler);
        for arg in args {
            self.push(arg);
        }
        self.call(N, nresults)
    }

    // ========================================================================
    // Metatables
    // ========================================================================

    fn metatable_of(&self, value: &Value) -> Option<GcRef> {
        match value {
            Value::Table(r) => self.inner.heap.borrow().table(*r).ok()?.metatable,
            Value::UserData(r) => self.inner.heap.borrow().userdata(*r).ok()?.metatable,
            Value::LightUserData(address) => {
                self.inner.light_metatables.borrow().get(address).copied()
            }
            _ => None,
        }
    }

    fn metafield(&self, value: &Value, event: &str) -> Value {
        let Some(metatable) = self.metatable_of(value) else {
            return Value::Nil;
        };
        self.inner
            .heap
            .borrow()
            .table(metatable)
            .map(|t| t.get_str(event))
            .unwrap_or_default()
    }

    /// Push the metatable of the value at `idx`; returns `false` (pushing
    /// nothing) when it has none
    pub fn get_metatable(&self, idx: i32) -> bool {
        match self.metatable_of(&self.value(idx)) {
            Some(metatable) => {
                self.push(Value::Table(metatable));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`
    pub fn set_metatable(&self, idx: i32) -> VmResult<()> {
        let target = self.value_checked(idx)?;
        let metatable = match self.pop_value()? {
            Value::Table(r) => Some(r),
            Value::Nil => None,
            other => {
                return Err(VmError::TypeError(format!(
                    "metatable must be a table, got {}",
                    other.kind()
                )))
            }
        };

        match target {
            Value::Table(r) => self.inner.heap.borrow_mut().table_mut(r)?.metatable = metatable,
            Value::UserData(r) => {
                self.inner.heap.borrow_mut().userdata_mut(r)?.metatable = metatable
            }
            Value::LightUserData(address) => {
                let mut light = self.inner.light_metatables.borrow_mut();
                match metatable {
                    Some(metatable) => light.insert(address, metatable),
                    None => light.remove(&address),
                };
            }
            other => {
                return Err(VmError::TypeError(format!(
                    "cannot set the metatable of a {} value",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    /// Push the `event` field of the metatable of the value at `idx`;
    /// returns `false` (pushing nothing) when there is no such field
    pub fn get_metafield(&self, idx: i32, event: &str) -> bool {
        let handler = self.metafield(&self.value(idx), event);
        if handler.is_nil() {
            return false;
        }
        self.push(handler);
        true
    }

    /// Push the registry table `name`, creating it first if needed.
    /// Returns `true` when the table was created by this call.
    pub fn new_metatable(&self, name: &str) -> VmResult<bool> {
        let existing = self.inner.heap.borrow().table(self.inner.registry)?.get_str(name);
        if !existing.is_nil() {
            self.push(existing);
            return Ok(false);
        }

        self.new_table();
        let metatable = self.value(-1);
        self.inner
            .heap
            .borrow_mut()
            .table_mut(self.inner.registry)?
            .set(Key::string(name), metatable);
        debug!(name, "created named metatable");
        Ok(true)
    }

    /// Push the registry table `name` (nil if it does not exist)
    pub fn push_named_metatable(&self, name: &str) -> VmResult<()> {
        let metatable = self.inner.heap.borrow().table(self.inner.registry)?.get_str(name);
        self.push(metatable);
        Ok(())
    }

    /// Give the top value the registry metatable `name`
    pub fn set_named_metatable(&self, name: &str) -> VmResult<()> {
        self.push_named_metatable(name)?;
        self.set_metatable(-2)
    }

    // ========================================================================
    // Functions and calls
    // ========================================================================

    /// Push a host callback as a runtime function
    pub fn push_function<F>(&self, f: F)
    where
        F: Fn(&State) -> VmResult<usize> + 'static,
    {
        self.push_callback(Rc::new(f));
    }

    /// Push a shared callback as a runtime function. The function inherits
    /// the environment of the running function.
    pub fn push_callback(&self, callback: Callback) {
        let env = self.frame().env;
        let r = self.alloc(Object::Function(Function { callback, env }));
        self.push(Value::Function(r));
    }

    /// Pop a table and make it the environment of the function at `idx`
    pub fn set_function_env(&self, idx: i32) -> VmResult<()> {
        let target = self.value_checked(idx)?;
        let env = match self.pop_value()? {
            Value::Table(r) => r,
            other => {
                return Err(VmError::TypeError(format!(
                    "environment must be a table, got {}",
                    other.kind()
                )))
            }
        };
        match target {
            Value::Function(r) => {
                self.inner.heap.borrow_mut().function_mut(r)?.env = Some(env);
                Ok(())
            }
            other => Err(VmError::TypeError(format!(
                "cannot set the environment of a {} value",
                other.kind()
            ))),
        }
    }

    /// Push the environment of the function at `idx` (nil for non-functions)
    pub fn get_function_env(&self, idx: i32) -> VmResult<()> {
        let env = match self.value(idx) {
            Value::Function(r) => {
                let env = self.inner.heap.borrow().function(r)?.env;
                Value::Table(env.unwrap_or(self.inner.globals))
            }
            _ => Value::Nil,
        };
        self.push(env);
        Ok(())
    }

    fn env(&self) -> GcRef {
        self.frame().env.unwrap_or(self.inner.globals)
    }

    /// Push the global `name`, looked up in the running function's environment
    pub fn get_global(&self, name: &str) -> VmResult<()> {
        let value = self.index_value(Value::Table(self.env()), Value::String(Rc::from(name)))?;
        self.push(value);
        Ok(())
    }

    /// Pop a value into the global `name` of the running function's environment
    pub fn set_global(&self, name: &str) -> VmResult<()> {
        let value = self.pop_value()?;
        self.assign_value(
            Value::Table(self.env()),
            Value::String(Rc::from(name)),
            value,
        )
    }

    /// Check whether the value at `idx` can be called: a function, or a value
    /// whose metatable has a `__call` function
    pub fn is_callable(&self, idx: i32) -> bool {
        match self.value(idx) {
            Value::Function(_) => true,
            value => matches!(self.metafield(&value, "__call"), Value::Function(_)),
        }
    }

    fn resolve_callable(&self, func_pos: usize) -> VmResult<(Callback, Option<GcRef>)> {
        let func = self.inner.stack.borrow()[func_pos].clone();
        let r = match func {
            Value::Function(r) => r,
            other => match self.metafield(&other, "__call") {
                Value::Function(r) => {
                    self.inner
                        .stack
                        .borrow_mut()
                        .insert(func_pos, Value::Function(r));
                    r
                }
                _ => return Err(VmError::NotCallable(other.kind())),
            },
        };

        let heap = self.inner.heap.borrow();
        let function = heap.function(r)?;
        Ok((function.callback.clone(), function.env))
    }

    /// Call the function below the top `nargs` arguments, leaving `nresults`
    /// results (all of them for [`MULTRET`])
    pub fn call(&self, nargs: usize, nresults: i32) -> VmResult<()> {
        self.check_open()?;
        if nargs + 1 > self.top() as usize {
            return Err(VmError::StackUnderflow);
        }
        let func_pos = self.inner.stack.borrow().len() - nargs - 1;
        let (callback, env) = self.resolve_callable(func_pos)?;

        if self.inner.frames.borrow().len() > self.inner.options.max_call_depth {
            return Err(VmError::CallDepthExceeded);
        }

        self.inner.frames.borrow_mut().push(Frame {
            base: func_pos + 1,
            env,
        });
        let result = callback(self);
        self.inner.frames.borrow_mut().pop();
        let returned = result?;

        let mut stack = self.inner.stack.borrow_mut();
        let len = stack.len();
        if returned > len.saturating_sub(func_pos + 1) {
            return Err(VmError::StackUnderflow);
        }
        stack.drain(func_pos..len - returned);

        if nresults != MULTRET {
            let wanted = nresults.max(0) as usize;
            stack.resize(func_pos + wanted, Value::Nil);
        }
        Ok(())
    }

    /// Protected call. On failure the function and its arguments are removed,
    /// the stack is back at its depth below the function slot, and the error
    /// is returned.
    pub fn pcall(&self, nargs: usize, nresults: i32) -> VmResult<()> {
        if nargs + 1 > self.top() as usize {
            return Err(VmError::StackUnderflow);
        }
        let func_pos = self.inner.stack.borrow().len() - nargs - 1;
        let depth = self.inner.frames.borrow().len();

        self.call(nargs, nresults).inspect_err(|_| {
            self.inner.frames.borrow_mut().truncate(depth);
            self.inner.stack.borrow_mut().truncate(func_pos);
        })
    }

    // ========================================================================
    // Userdata
    // ========================================================================

    /// Push a full userdata owning `payload`
    pub fn new_userdata<T: Any>(&self, payload: T) {
        let r = self.alloc(Object::UserData(UserData {
            payload: Box::new(payload),
            metatable: None,
            finalized: false,
        }));
        self.push(Value::UserData(r));
    }

    /// Run `f` on the payload of the userdata at `idx` if it has type `T`.
    ///
    /// The heap is borrowed while `f` runs: `f` must not touch the state.
    pub fn with_userdata<T: Any, R>(&self, idx: i32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let Value::UserData(r) = self.value(idx) else {
            return None;
        };
        let mut heap = self.inner.heap.borrow_mut();
        let payload = heap.userdata_mut(r).ok()?.payload.downcast_mut::<T>()?;
        Some(f(payload))
    }

    /// Check whether the value at `idx` is a userdata with a `T` payload
    pub fn is_userdata_of<T: Any>(&self, idx: i32) -> bool {
        self.with_userdata::<T, _>(idx, |_| ()).is_some()
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Pop the top value and store it in the table at `t` under a fresh
    /// integer id. Nil is not stored and yields [`REF_NIL`].
    pub fn reference(&self, t: i32) -> VmResult<i32> {
        let table = self.table_at(t)?;
        let value = self.pop_value()?;
        if value.is_nil() {
            return Ok(REF_NIL);
        }

        let mut heap = self.inner.heap.borrow_mut();
        let table = heap.table_mut(table)?;
        let free = match table.get_int(0) {
            Value::Number(n) => n as i32,
            _ => 0,
        };
        let id = if free > 0 {
            let next = table.get_int(free as i64);
            table.set_int(0, next);
            free
        } else {
            table.length() as i32 + 1
        };
        table.set_int(id as i64, value);
        trace!(id, "reference");
        Ok(id)
    }

    /// Release a reference id of the table at `t`; ids below 1 are ignored
    pub fn unreference(&self, t: i32, id: i32) -> VmResult<()> {
        if id <= 0 {
            return Ok(());
        }
        let table = self.table_at(t)?;
        let mut heap = self.inner.heap.borrow_mut();
        let table = heap.table_mut(table)?;
        let head = table.get_int(0);
        table.set_int(id as i64, head);
        table.set_int(0, Value::Number(id as f64));
        trace!(id, "unreference");
        Ok(())
    }

    // ========================================================================
    // Collector
    // ========================================================================

    fn alloc(&self, object: Object) -> GcRef {
        self.maybe_collect();
        self.inner.heap.borrow_mut().alloc(object)
    }

    fn maybe_collect(&self) {
        if !self.inner.options.auto_collect
            || self.inner.collecting.get()
            || self.inner.closed.get()
        {
            return;
        }
        if self.inner.heap.borrow().live_count() >= self.inner.threshold.get() {
            self.collect_garbage();
        }
    }

    fn roots(&self) -> Vec<Value> {
        let mut roots = vec![
            Value::Table(self.inner.registry),
            Value::Table(self.inner.globals),
        ];
        roots.extend(self.inner.stack.borrow().iter().cloned());
        roots.extend(
            self.inner
                .frames
                .borrow()
                .iter()
                .filter_map(|frame| frame.env)
                .map(Value::Table),
        );
        roots.extend(
            self.inner
                .light_metatables
                .borrow()
                .values()
                .map(|r| Value::Table(*r)),
        );
        roots
    }

    /// Run a full collection and return the updated statistics
    pub fn collect_garbage(&self) -> GcStats {
        if self.inner.collecting.get() || self.inner.closed.get() {
            return self.gc_stats();
        }
        self.inner.collecting.set(true);

        let start = Instant::now();
        let roots = self.roots();
        let outcome = self.inner.heap.borrow_mut().collect(roots);
        let live = self.live_objects();

        self.inner
            .stats
            .borrow_mut()
            .update(start.elapsed(), &outcome, live);
        self.inner
            .threshold
            .set((live * 2).max(self.inner.options.gc_threshold));
        debug!(
            marked = outcome.marked,
            freed = outcome.freed.len(),
            finalizers = outcome.finalize.len(),
            weak_cleared = outcome.weak_cleared,
            live,
            "collection finished"
        );

        let Collection {
            finalize, freed, ..
        } = outcome;
        drop(freed);
        self.run_finalizers(finalize);

        self.inner.collecting.set(false);
        self.gc_stats()
    }

    fn run_finalizers(&self, pending: Vec<(GcRef, Value)>) {
        for (r, handler) in pending {
            self.push(handler);
            self.push(Value::UserData(r));
            if let Err(error) = self.pcall(1, 0) {
                warn!(%error, "error in __gc finalizer");
            }
        }
    }

    /// Collector statistics
    pub fn gc_stats(&self) -> GcStats {
        self.inner.stats.borrow().clone()
    }

    /// Number of live heap objects (registry and globals included)
    pub fn live_objects(&self) -> usize {
        self.inner.heap.borrow().live_count()
    }

    fn check_open(&self) -> VmResult<()> {
        if self.inner.closed.get() {
            return Err(VmError::Closed);
        }
        Ok(())
    }

    /// Check whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Tear the runtime down: run every pending finalizer (most recent
    /// allocation first), free every object and clear the stack
    pub fn close(&self) {
        if self.inner.closed.get() {
            return;
        }
        self.inner.collecting.set(true);
        self.inner.frames.borrow_mut().truncate(1);
        self.inner.stack.borrow_mut().clear();

        let pending = self.inner.heap.borrow_mut().pending_finalizers();
        let finalizers = pending.len();
        self.run_finalizers(pending);

        self.inner.closed.set(true);
        self.inner.light_metatables.borrow_mut().clear();
        let stack = std::mem::take(&mut *self.inner.stack.borrow_mut());
        let objects = self.inner.heap.borrow_mut().drain();
        debug!(objects = objects.len(), finalizers, "state closed");
        drop(stack);
        drop(objects);
        self.inner.collecting.set(false);
    }
}
