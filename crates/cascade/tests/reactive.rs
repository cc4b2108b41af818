//! Reactive propagation: reassignment reaches dependent nodes, listeners
//! fire in order, immediate operators stay frozen.

use std::cell::RefCell;
use std::rc::Rc;

use cascade::{Engine, EngineError, Range, SourceRef, Value, VarFlags};

fn src() -> SourceRef {
    SourceRef::unknown()
}

#[test]
fn reassignment_propagates_through_dependents() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();

    let x = engine.variable_node("x", false, src());
    let lit = engine.alloc_concrete(Value::Int(1));
    let sum = engine.apply("+", &[x, lit], src()).unwrap();
    let y = engine
        .declare("y", sum, None, VarFlags::default(), &src())
        .unwrap();
    assert_eq!(engine.fix_deep(y).unwrap(), Value::Int(2));

    let five = engine.alloc_concrete(Value::Int(5));
    engine.assign("x", five, None, &src()).unwrap();
    assert_eq!(engine.fix_deep(y).unwrap(), Value::Int(6));
}

#[test]
fn listeners_fire_in_registration_order() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    let cell = engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let first = log.clone();
    engine
        .listen(cell, move |_, _| {
            first.borrow_mut().push("first");
            Ok(())
        })
        .unwrap();
    let second = log.clone();
    engine
        .listen(cell, move |_, _| {
            second.borrow_mut().push("second");
            Ok(())
        })
        .unwrap();

    let two = engine.alloc_concrete(Value::Int(2));
    engine.assign("x", two, None, &src()).unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
}

#[test]
fn cancelled_listener_stops_firing() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    let cell = engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();

    let count = Rc::new(RefCell::new(0usize));
    let counter = count.clone();
    let id = engine
        .listen(cell, move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(())
        })
        .unwrap();

    let two = engine.alloc_concrete(Value::Int(2));
    engine.assign("x", two, None, &src()).unwrap();
    assert_eq!(*count.borrow(), 1);

    assert!(engine.cancel(cell, id));
    assert!(!engine.cancel(cell, id));

    let three = engine.alloc_concrete(Value::Int(3));
    engine.assign("x", three, None, &src()).unwrap();
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn listener_on_a_derived_binding_sees_recomputed_values() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();
    let x = engine.variable_node("x", false, src());
    let lit = engine.alloc_concrete(Value::Int(1));
    let sum = engine.apply("+", &[x, lit], src()).unwrap();
    let y = engine
        .declare("y", sum, None, VarFlags::default(), &src())
        .unwrap();
    // Subscribe the usage node by resolving once.
    assert_eq!(engine.fix_deep(y).unwrap(), Value::Int(2));

    let seen: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
    let sink = seen.clone();
    engine
        .listen(y, move |_, value| {
            *sink.borrow_mut() = Some(value.clone());
            Ok(())
        })
        .unwrap();

    let five = engine.alloc_concrete(Value::Int(5));
    engine.assign("x", five, None, &src()).unwrap();
    assert_eq!(seen.borrow().clone(), Some(Value::Int(6)));
}

#[test]
fn listener_on_a_reference_node_receives_the_resolved_value() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();
    let x = engine.variable_node("x", false, src());
    // Resolve once so the reference subscribes to the binding's cell.
    assert_eq!(engine.fix_deep(x).unwrap(), Value::Int(1));

    let seen: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
    let sink = seen.clone();
    engine
        .listen(x, move |_, value| {
            *sink.borrow_mut() = Some(value.clone());
            Ok(())
        })
        .unwrap();

    let five = engine.alloc_concrete(Value::Int(5));
    engine.assign("x", five, None, &src()).unwrap();
    // A value, not a Value::Node handle.
    assert_eq!(seen.borrow().clone(), Some(Value::Int(5)));
}

#[test]
fn constant_rejects_reassignment_without_mutation() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    let flags = VarFlags {
        constant: true,
        ..VarFlags::default()
    };
    let cell = engine.declare("c", one, None, flags, &src()).unwrap();

    let two = engine.alloc_concrete(Value::Int(2));
    match engine.assign("c", two, None, &src()) {
        Err(EngineError::BindingImmutable { name }) => assert_eq!(name, "c"),
        other => panic!("expected BindingImmutable, got {other:?}"),
    }
    assert_eq!(engine.fix_deep(cell).unwrap(), Value::Int(1));
}

#[test]
fn immediate_operators_do_not_track_operands() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();

    let x = engine.variable_node("x", false, src());
    let five = engine.alloc_concrete(Value::Int(5));
    let range = engine.apply("..", &[x, five], src()).unwrap();
    assert_eq!(
        engine.fix_deep(range).unwrap(),
        Value::Range(Range { start: 1, end: 5 })
    );

    let three = engine.alloc_concrete(Value::Int(3));
    engine.assign("x", three, None, &src()).unwrap();
    // Still the range computed at wiring time.
    assert_eq!(
        engine.fix_deep(range).unwrap(),
        Value::Range(Range { start: 1, end: 5 })
    );
}
