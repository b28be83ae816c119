//! Integration tests for the value codec
//!
//! Tests cover:
//! - Integer widths and floats read from one runtime number
//! - One sequence read back as every container shape
//! - Optionals, pairs and nested containers
//! - Enumerations and sum types
//! - Checked versus permissive reads

use stackbind::vm::VmOptions;
use stackbind::{
    get, get_checked, is, Engine, EngineOptions, Error, HostChunk, MultiSet, Nil, Shape, State,
    VariableType, VmResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

fn engine() -> Engine {
    Engine::with_options(EngineOptions {
        vm: VmOptions::manual_gc(),
        ..Default::default()
    })
}

fn return_three(s: &State) -> VmResult<usize> {
    s.push_integer(3);
    Ok(1)
}

/// `return {3, 2, 3, 1}`
fn return_sequence(s: &State) -> VmResult<usize> {
    s.new_table();
    for (i, value) in [3, 2, 3, 1].into_iter().enumerate() {
        s.push_integer(value);
        s.raw_set_i(-2, i as i64 + 1)?;
    }
    Ok(1)
}

stackbind::stack_enum! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum Level {
        #[default]
        Off,
        Low = 1,
        High = 10,
    }
}

stackbind::stack_variant! {
    #[derive(Debug, Clone, PartialEq)]
    enum Setting {
        Unset(Nil),
        Flag(bool),
        Count(i32),
        Text(String),
    }
}

// ============================================================================
// Primitives
// ============================================================================

#[test]
fn test_integer_widths() {
    let engine = engine();
    let three = engine.execute(&return_three).unwrap();

    assert_eq!(three.get::<i8>().unwrap(), 3);
    assert_eq!(three.get::<i16>().unwrap(), 3);
    assert_eq!(three.get::<i32>().unwrap(), 3);
    assert_eq!(three.get::<i64>().unwrap(), 3);
    assert_eq!(three.get::<u8>().unwrap(), 3);
    assert_eq!(three.get::<u16>().unwrap(), 3);
    assert_eq!(three.get::<u32>().unwrap(), 3);
    assert_eq!(three.get::<u64>().unwrap(), 3);
    assert_eq!(three.get::<f64>().unwrap(), 3.0);
    assert!(engine.is_stack_top());
}

#[test]
fn test_checked_read_reports_mismatch() {
    let engine = engine();
    engine.set_global("name", &"stackbind").unwrap();
    let name = engine.global("name").unwrap();

    let error = name.get::<i32>().unwrap_err();
    assert!(matches!(
        error,
        Error::Mismatch {
            expected: Shape::Integer,
            found: VariableType::String
        }
    ));
    assert_eq!(
        error.to_string(),
        "Type mismatch: expected integer, got string"
    );
    assert_eq!(name.get_or_default::<i32>().unwrap(), 0);
    assert!(engine.is_stack_top());
}

#[test]
fn test_permissive_reads_of_nil() {
    let engine = engine();
    let state = engine.state();
    state.push_nil();
    assert_eq!(get::<String>(state, -1).unwrap(), "");
    assert_eq!(get::<i64>(state, -1).unwrap(), 0);
    assert!(!get::<bool>(state, -1).unwrap());
    assert!(get::<Vec<i32>>(state, -1).unwrap().is_empty());
    assert!(get_checked::<String>(state, -1).is_err());
    assert!(is::<Nil>(state, -1));
    state.pop(1).unwrap();
}

// ============================================================================
// Containers
// ============================================================================

#[test]
fn test_sequence_as_every_container() {
    let engine = engine();
    let table = engine.execute(&return_sequence).unwrap();

    assert_eq!(table.get::<Vec<i32>>().unwrap(), vec![3, 2, 3, 1]);
    assert_eq!(
        table.get::<VecDeque<i32>>().unwrap(),
        VecDeque::from(vec![3, 2, 3, 1])
    );
    assert_eq!(
        table.get::<BTreeSet<i32>>().unwrap(),
        BTreeSet::from([1, 2, 3])
    );
    assert_eq!(
        table.get::<HashSet<i32>>().unwrap(),
        HashSet::from([1, 2, 3])
    );

    let multiset = table.get::<MultiSet<i32>>().unwrap();
    assert_eq!(multiset.len(), 4);
    assert_eq!(multiset.count(&3), 2);
    assert_eq!(multiset.count(&1), 1);

    let map = table.get::<BTreeMap<i32, i32>>().unwrap();
    assert_eq!(map, BTreeMap::from([(1, 3), (2, 2), (3, 3), (4, 1)]));
    let map = table.get::<HashMap<i64, u8>>().unwrap();
    assert_eq!(map.len(), 4);
    assert_eq!(map[&4], 1);
    assert!(engine.is_stack_top());
}

#[test]
fn test_container_round_trip_through_globals() {
    let engine = engine();
    let scores = BTreeMap::from([("ada".to_string(), 3), ("bob".to_string(), 5)]);
    engine.set_global("scores", &scores).unwrap();
    engine.set_global("pair", &(7, "seven".to_string())).unwrap();
    engine
        .set_global("nested", &vec![vec![1, 2], vec![], vec![3]])
        .unwrap();

    assert_eq!(
        engine
            .global("scores")
            .unwrap()
            .get::<BTreeMap<String, i32>>()
            .unwrap(),
        scores
    );
    assert_eq!(
        engine.global("pair").unwrap().get::<(i32, String)>().unwrap(),
        (7, "seven".to_string())
    );
    assert_eq!(
        engine
            .global("nested")
            .unwrap()
            .get::<Vec<Vec<i32>>>()
            .unwrap(),
        vec![vec![1, 2], vec![], vec![3]]
    );
    assert!(engine.is_stack_top());
}

#[test]
fn test_optional_values() {
    let engine = engine();
    engine.set_global("some", &Some(5)).unwrap();
    engine.set_global("none", &None::<i32>).unwrap();

    assert_eq!(engine.global("some").unwrap().get::<Option<i32>>().unwrap(), Some(5));
    assert_eq!(engine.global("none").unwrap().get::<Option<i32>>().unwrap(), None);
    assert!(engine.global("none").unwrap().is_empty());
}

// ============================================================================
// Enumerations and sum types
// ============================================================================

#[test]
fn test_enum_through_runtime() {
    let engine = engine();
    engine.set_global("level", &Level::High).unwrap();
    let level = engine.global("level").unwrap();
    assert_eq!(level.kind(), VariableType::Number);
    assert_eq!(level.get::<i32>().unwrap(), 10);
    assert_eq!(level.get::<Level>().unwrap(), Level::High);

    engine.set_global("level", &7).unwrap();
    assert_eq!(engine.global("level").unwrap().get::<Level>().unwrap(), Level::Off);
}

#[test]
fn test_variant_first_match_wins() {
    let engine = engine();
    for (value, expected) in [
        (Setting::Unset(Nil), VariableType::Nil),
        (Setting::Flag(true), VariableType::Boolean),
        (Setting::Count(12), VariableType::Number),
        (Setting::Text("twelve".to_string()), VariableType::String),
    ] {
        engine.set_global("setting", &value).unwrap();
        let handle = engine.global("setting").unwrap();
        assert_eq!(handle.kind(), expected);
        assert_eq!(handle.get_or_default::<Setting>().unwrap(), value);
    }
    assert!(engine.is_stack_top());
}

#[test]
fn test_variant_falls_back_to_first() {
    let engine = engine();
    let state = engine.state();
    state.new_table();
    assert_eq!(get::<Setting>(state, -1).unwrap(), Setting::Unset(Nil));
    state.pop(1).unwrap();
}

#[test]
fn test_host_chunk_builds_sequence() {
    let engine = engine();
    let chunk = HostChunk::new("sequence", return_sequence);
    let values = engine.execute(&chunk).unwrap().get::<Vec<u8>>().unwrap();
    assert_eq!(values, vec![3, 2, 3, 1]);
}
