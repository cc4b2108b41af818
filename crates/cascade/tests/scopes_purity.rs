//! Scope discipline and the pure/impure execution mode.

use cascade::{Engine, EngineError, Fixity, OperatorDescriptor, SourceRef, Value, VarFlags};

fn src() -> SourceRef {
    SourceRef::unknown()
}

#[test]
fn unknown_variable_is_captured_as_an_error_value() {
    let mut engine = Engine::new();
    let usage = engine.variable_node("missing", false, src());
    match engine.fix_deep(usage).unwrap() {
        Value::Error(e) => assert_eq!(e.kind.as_ref(), "variable-not-found"),
        other => panic!("expected an error value, got {other}"),
    }
    assert!(engine.fix_or_raise(usage).is_err());
}

#[test]
fn impure_scope_under_a_pure_parent_is_rejected() {
    let mut engine = Engine::new();
    let pure = engine.push_scope(true, "pure-block").unwrap();
    match engine.push_scope(false, "impure-block") {
        Err(EngineError::PurityViolation { .. }) => {}
        other => panic!("expected PurityViolation, got {other:?}"),
    }
    // Pure inside pure is fine.
    let nested = engine.push_scope(true, "nested").unwrap();
    engine.pop_scope(nested).unwrap();
    engine.pop_scope(pure).unwrap();
}

#[test]
fn pure_scope_reads_only_pure_constants_from_outside() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("secret", one, None, VarFlags::default(), &src())
        .unwrap();
    let ten = engine.alloc_concrete(Value::Int(10));
    let flags = VarFlags {
        constant: true,
        pure: true,
        volatile: false,
    };
    engine.declare("limit", ten, None, flags, &src()).unwrap();

    let scope = engine.push_scope(true, "pure-block").unwrap();

    let secret = engine.variable_node("secret", false, src());
    match engine.fix_deep(secret).unwrap() {
        Value::Error(e) => assert_eq!(e.kind.as_ref(), "purity-violation"),
        other => panic!("expected an error value, got {other}"),
    }

    let limit = engine.variable_node("limit", false, src());
    assert_eq!(engine.fix_deep(limit).unwrap(), Value::Int(10));

    engine.pop_scope(scope).unwrap();
}

#[test]
fn pure_scope_cannot_mutate_outer_bindings() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();

    let scope = engine.push_scope(true, "pure-block").unwrap();
    let two = engine.alloc_concrete(Value::Int(2));
    match engine.assign("x", two, None, &src()) {
        Err(EngineError::PurityViolation { .. }) => {}
        other => panic!("expected PurityViolation, got {other:?}"),
    }
    engine.pop_scope(scope).unwrap();
}

#[test]
fn popping_the_wrong_scope_is_an_internal_error() {
    let mut engine = Engine::new();
    let a = engine.push_scope(false, "a").unwrap();
    let b = engine.push_scope(false, "b").unwrap();
    assert!(matches!(
        engine.pop_scope(a),
        Err(EngineError::InternalConsistency(_))
    ));
    engine.pop_scope(b).unwrap();
    engine.pop_scope(a).unwrap();
    // The root frame is not poppable.
    assert!(matches!(
        engine.pop_scope(a),
        Err(EngineError::InternalConsistency(_))
    ));
}

#[test]
fn block_locals_do_not_leak_into_the_parent() {
    let mut engine = Engine::new();
    let scope = engine.push_scope(false, "block").unwrap();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("t", one, None, VarFlags::default(), &src())
        .unwrap();
    engine.pop_scope(scope).unwrap();

    let usage = engine.variable_node("t", false, src());
    match engine.fix_deep(usage).unwrap() {
        Value::Error(e) => assert_eq!(e.kind.as_ref(), "variable-not-found"),
        other => panic!("expected an error value, got {other}"),
    }
}

fn identity(args: &[Value], _at: &SourceRef) -> cascade::Result<Value> {
    Ok(args[0].clone())
}

#[test]
fn pure_only_operator_is_rejected_in_an_impure_scope() {
    let mut engine = Engine::new();
    engine.register_operator(OperatorDescriptor {
        name: "lift",
        arity: 1,
        fixity: Fixity::Prefix,
        pure: Some(true),
        immediate: false,
        contagious: true,
        eval: identity,
    });

    // The root scope is impure; wiring fails before any operand is read.
    let one = engine.alloc_concrete(Value::Int(1));
    match engine.apply("lift", &[one], src()) {
        Err(EngineError::PurityViolation { .. }) => {}
        other => panic!("expected PurityViolation, got {other:?}"),
    }

    let scope = engine.push_scope(true, "pure-block").unwrap();
    let two = engine.alloc_concrete(Value::Int(2));
    let node = engine.apply("lift", &[two], src()).unwrap();
    assert_eq!(engine.fix_deep(node).unwrap(), Value::Int(2));
    engine.pop_scope(scope).unwrap();
}

#[test]
fn redeclaring_in_the_same_scope_is_rejected() {
    let mut engine = Engine::new();
    let one = engine.alloc_concrete(Value::Int(1));
    engine
        .declare("x", one, None, VarFlags::default(), &src())
        .unwrap();
    let two = engine.alloc_concrete(Value::Int(2));
    match engine.declare("x", two, None, VarFlags::default(), &src()) {
        Err(EngineError::Script { message, .. }) => {
            assert!(message.contains("already declared"), "{message}");
        }
        other => panic!("expected a script error, got {other:?}"),
    }
}
