//! Integration tests for class values
//!
//! Tests cover:
//! - Owning objects released by the collector
//! - Methods looked up through behavior tables, with inheritance
//! - Non-owning pointers with a per-type behavior table
//! - Owning `Rc<T>` values of plain host types

use stackbind::vm::VmOptions;
use stackbind::{
    reclaim, type_identity, Engine, EngineOptions, Function, HostChunk, NativeFn, Object,
    ObjectPtr, Ptr, State, VariableType, VmResult,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn engine() -> Engine {
    Engine::with_options(EngineOptions {
        vm: VmOptions::manual_gc(),
        ..Default::default()
    })
}

// ============================================================================
// Fixtures
// ============================================================================

/// Live instance counter shared by a test and its objects
#[derive(Default)]
struct Census {
    created: Cell<usize>,
    live: Cell<usize>,
}

#[derive(Default)]
struct Counter {
    value: Cell<i64>,
    census: Rc<Census>,
}

impl Counter {
    fn create(census: &Rc<Census>, start: i64) -> ObjectPtr {
        census.created.set(census.created.get() + 1);
        census.live.set(census.live.get() + 1);
        Rc::new(Counter {
            value: Cell::new(start),
            census: Rc::clone(census),
        })
    }
}

impl Object for Counter {
    fn metatable(&self) -> &str {
        "Counter"
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        let live = self.census.live.get();
        self.census.live.set(live.saturating_sub(1));
    }
}

#[derive(Default)]
struct Item {
    kind: &'static str,
    function: RefCell<String>,
}

impl Item {
    fn create(kind: &'static str) -> ObjectPtr {
        Rc::new(Item {
            kind,
            function: RefCell::new(String::new()),
        })
    }
}

impl Object for Item {
    fn metatable(&self) -> &str {
        self.kind
    }
}

fn register_counter(engine: &Engine, census: &Rc<Census>) {
    let census = Rc::clone(census);
    engine
        .metatable("Counter")
        .unwrap()
        .register_reference_destructor()
        .unwrap()
        .set_field(
            "Create",
            &Function::new(move |start: i64| Counter::create(&census, start)),
        )
        .unwrap()
        .set_field("Get", &Function::new(|this: Rc<Counter>| this.value.get()))
        .unwrap()
        .set_field(
            "Add",
            &Function::new(|this: Rc<Counter>, amount: i64| {
                this.value.set(this.value.get() + amount);
            }),
        )
        .unwrap();
}

fn register_items(engine: &Engine) {
    engine
        .metatable("Base")
        .unwrap()
        .register_reference_destructor()
        .unwrap()
        .set_field(
            "GetFunction",
            &Function::new(|this: Rc<Item>| this.function.borrow().clone()),
        )
        .unwrap()
        .set_field(
            "SetFunction",
            &Function::new(|this: Rc<Item>, value: String| {
                *this.function.borrow_mut() = value;
            }),
        )
        .unwrap()
        .set_field(
            "__add",
            &Function::new(|a: Rc<Item>, b: Rc<Item>| {
                format!("{}+{}", a.function.borrow(), b.function.borrow())
            }),
        )
        .unwrap();

    engine
        .metatable_with_parent("Derived", "Base")
        .unwrap()
        .register_reference_destructor()
        .unwrap()
        .set_field(
            "SetFunction",
            &Function::new(|this: Rc<Item>, value: String| {
                *this.function.borrow_mut() = format!("{}_Derived", value);
            }),
        )
        .unwrap();
}

/// `Variable = Counter.Create(5); Variable:Add(3)`
fn create_counter(s: &State) -> VmResult<usize> {
    s.get_global("Counter")?;
    s.get_field(-1, "Create")?;
    s.push_integer(5);
    s.call(1, 1)?;
    s.set_global("Variable")?;
    s.pop(1)?;

    s.get_global("Variable")?;
    s.get_field(-1, "Add")?;
    s.insert(-2)?;
    s.push_integer(3);
    s.call(2, 0)?;
    Ok(0)
}

// ============================================================================
// Owning objects
// ============================================================================

#[test]
fn test_object_created_in_runtime() {
    let engine = engine();
    let census = Rc::new(Census::default());
    register_counter(&engine, &census);

    engine.execute_raw(&create_counter).unwrap();
    let variable = engine.global("Variable").unwrap();
    assert_eq!(variable.kind(), VariableType::UserData);
    assert_eq!(
        variable.call_method("Get", ()).unwrap().get::<i64>().unwrap(),
        8
    );

    let object = variable.get::<ObjectPtr>().unwrap();
    assert!(object.is::<Counter>());
    assert_eq!(census.created.get(), 1);
    assert!(engine.is_stack_top());
}

thread_local! {
    static RECLAIMED: Cell<usize> = const { Cell::new(0) };
}

/// Reclamation hook that also counts its calls
fn counted_reclaim(s: &State) -> VmResult<usize> {
    RECLAIMED.with(|count| count.set(count.get() + 1));
    reclaim(s)
}

#[test]
fn test_created_objects_reclaimed() {
    let engine = engine();
    let census = Rc::new(Census::default());
    register_counter(&engine, &census);
    let counter = engine.metatable("Counter").unwrap();
    assert_eq!(
        counter.handle().field("__gc").unwrap().kind(),
        VariableType::Function
    );
    counter.set_field("__gc", &NativeFn(counted_reclaim)).unwrap();

    engine.execute_raw(&create_counter).unwrap();
    engine.execute_raw(&create_counter).unwrap();
    assert_eq!(census.created.get(), 2);

    engine.collect_garbage();
    assert_eq!(census.live.get(), 1);
    assert_eq!(RECLAIMED.with(Cell::get), 1);

    engine
        .execute_raw(&HostChunk::new("clear", |s: &State| {
            s.push_nil();
            s.set_global("Variable")?;
            Ok(0)
        }))
        .unwrap();
    engine.collect_garbage();
    assert_eq!(census.live.get(), 0);
    assert_eq!(RECLAIMED.with(Cell::get), 2);

    engine.collect_garbage();
    assert_eq!(RECLAIMED.with(Cell::get), 2);
}

#[test]
fn test_reclamation_hook_finalizes_each_object_once() {
    let engine = engine();
    let census = Rc::new(Census::default());
    register_counter(&engine, &census);
    engine.execute_raw(&create_counter).unwrap();
    let before = engine.collect_garbage().finalizers_run;

    engine.remove_global("Variable").unwrap();
    let after = engine.collect_garbage().finalizers_run;
    assert_eq!(after - before, 1);
    assert_eq!(census.live.get(), 0);

    assert_eq!(engine.collect_garbage().finalizers_run, after);
}

#[test]
fn test_host_reference_keeps_object_alive() {
    let engine = engine();
    let census = Rc::new(Census::default());
    register_counter(&engine, &census);

    let object = Counter::create(&census, 1);
    engine.set_global("Shared", &object).unwrap();
    engine.remove_global("Shared").unwrap();
    engine.collect_garbage();

    assert_eq!(Rc::strong_count(&object), 1);
    assert_eq!(census.live.get(), 1);
    drop(object);
    assert_eq!(census.live.get(), 0);
}

#[test]
fn test_engine_close_releases_objects() {
    let census = Rc::new(Census::default());
    {
        let engine = engine();
        register_counter(&engine, &census);
        engine.execute_raw(&create_counter).unwrap();
        assert_eq!(census.live.get(), 1);
    }
    assert_eq!(census.live.get(), 0);
}

// ============================================================================
// Inheritance
// ============================================================================

#[test]
fn test_derived_overrides_and_inherits() {
    let engine = engine();
    register_items(&engine);
    engine.set_global("base", &Item::create("Base")).unwrap();
    engine.set_global("derived", &Item::create("Derived")).unwrap();

    let base = engine.global("base").unwrap();
    let derived = engine.global("derived").unwrap();

    base.call_method("SetFunction", ("Foo",)).unwrap();
    derived.call_method("SetFunction", ("Foo",)).unwrap();
    assert_eq!(
        base.call_method("GetFunction", ()).unwrap().get::<String>().unwrap(),
        "Foo"
    );
    assert_eq!(
        derived
            .call_method("GetFunction", ())
            .unwrap()
            .get::<String>()
            .unwrap(),
        "Foo_Derived"
    );
    assert!(engine.is_stack_top());
}

#[test]
fn test_derived_inherits_operators() {
    let engine = engine();
    register_items(&engine);
    let base: ObjectPtr = Rc::new(Item {
        kind: "Base",
        function: RefCell::new("left".to_string()),
    });
    let derived: ObjectPtr = Rc::new(Item {
        kind: "Derived",
        function: RefCell::new("right".to_string()),
    });

    let add = engine
        .metatable("Derived")
        .unwrap()
        .handle()
        .field("__add")
        .unwrap();
    assert_eq!(add.kind(), VariableType::Function);
    assert_eq!(
        add.invoke::<_, String>((&base, &derived)).unwrap(),
        "left+right"
    );
}

// ============================================================================
// Non-owning pointers and plain host types
// ============================================================================

struct Widget {
    name: String,
}

#[test]
fn test_pointer_methods() {
    let engine = engine();
    engine
        .metatable(&type_identity::<Widget>())
        .unwrap()
        .set_field(
            "Name",
            &Function::new(|this: Ptr<Widget>| {
                // SAFETY: the widget outlives the engine in this test
                unsafe { this.as_ref() }
                    .map(|widget| widget.name.clone())
                    .unwrap_or_default()
            }),
        )
        .unwrap();

    let widget = Widget {
        name: "dial".to_string(),
    };
    engine.set_global("widget", &Ptr::new(&widget)).unwrap();
    let handle = engine.global("widget").unwrap();
    assert_eq!(handle.kind(), VariableType::LightUserData);
    assert_eq!(
        handle.call_method("Name", ()).unwrap().get::<String>().unwrap(),
        "dial"
    );
    assert_eq!(handle.get::<Ptr<Widget>>().unwrap(), Ptr::new(&widget));
}

#[test]
fn test_plain_rc_released() {
    let engine = engine();
    engine
        .metatable(&type_identity::<Widget>())
        .unwrap()
        .register_reference_destructor()
        .unwrap();

    let widget = Rc::new(Widget {
        name: "knob".to_string(),
    });
    engine.set_global("widget", &widget).unwrap();
    assert_eq!(Rc::strong_count(&widget), 2);
    assert_eq!(
        engine
            .global("widget")
            .unwrap()
            .get::<Rc<Widget>>()
            .unwrap()
            .name,
        "knob"
    );

    engine.remove_global("widget").unwrap();
    engine.collect_garbage();
    assert_eq!(Rc::strong_count(&widget), 1);
}
