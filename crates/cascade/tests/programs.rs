//! Whole programs as expression records: exports, error isolation, and
//! the JSON wire format.

use cascade::{Engine, EngineError, Expr, Program, Range, SourceRef, Value};

fn lit(value: Value) -> Expr {
    Expr::Literal {
        value,
        source: SourceRef::unknown(),
    }
}

fn var(name: &str) -> Expr {
    Expr::Variable {
        name: name.to_owned(),
        numeric: false,
        source: SourceRef::unknown(),
    }
}

fn apply(op: &str, operands: Vec<Expr>) -> Expr {
    Expr::Apply {
        op: op.to_owned(),
        operands,
        source: SourceRef::unknown(),
    }
}

fn declare(name: &str, value: Expr, export: bool) -> Expr {
    Expr::Declare {
        name: name.to_owned(),
        value: Box::new(value),
        constraint: None,
        constant: false,
        volatile: false,
        pure: false,
        export,
        source: SourceRef::unknown(),
    }
}

fn declare_constrained(name: &str, value: Expr, constraint: Expr, export: bool) -> Expr {
    Expr::Declare {
        name: name.to_owned(),
        value: Box::new(value),
        constraint: Some(Box::new(constraint)),
        constant: false,
        volatile: false,
        pure: false,
        export,
        source: SourceRef::unknown(),
    }
}

fn is_integer() -> Expr {
    apply("is", vec![var("it"), lit(Value::str("INTEGER"))])
}

#[test]
fn exports_accumulate_and_survive_a_failing_declaration() {
    let program = Program {
        statements: vec![
            declare("a", lit(Value::Int(1)), true),
            declare_constrained("bad", lit(Value::str("oops")), is_integer(), true),
            declare("c", lit(Value::Int(2)), true),
        ],
    };
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);

    let names: Vec<&str> = outcome.exports.keys().map(|k| k.as_ref()).collect();
    assert_eq!(names, vec!["a", "c"]);
    assert_eq!(outcome.exports["a"], Value::Int(1));
    assert_eq!(outcome.exports["c"], Value::Int(2));
    assert!(matches!(
        outcome.error,
        Some(EngineError::ConstraintViolation { .. })
    ));
}

#[test]
fn exports_resolve_to_final_values_after_reassignment() {
    let program = Program {
        statements: vec![
            declare("x", lit(Value::Int(1)), true),
            declare("y", var("x"), true),
            Expr::Assign {
                name: "x".to_owned(),
                value: Box::new(lit(Value::Int(2))),
                constraint: None,
                source: SourceRef::unknown(),
            },
        ],
    };
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    // The table is resolved after the last statement, so the reassignment
    // is visible in both exports.
    assert_eq!(outcome.exports["x"], Value::Int(2));
    assert_eq!(outcome.exports["y"], Value::Int(2));
}

#[test]
fn block_locals_are_invisible_at_top_level() {
    let program = Program {
        statements: vec![
            Expr::Block {
                body: vec![declare("t", lit(Value::Int(1)), false)],
                pure: false,
                source: SourceRef::unknown(),
            },
            declare("out", var("t"), true),
        ],
    };
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);

    match &outcome.exports["out"] {
        Value::Error(e) => assert_eq!(e.kind.as_ref(), "variable-not-found"),
        other => panic!("expected an error value, got {other}"),
    }
    assert!(outcome.error.is_some());
}

#[test]
fn list_elements_do_not_poison_their_siblings() {
    let program = Program {
        statements: vec![declare(
            "l",
            Expr::List {
                items: vec![
                    lit(Value::Int(1)),
                    apply("/", vec![lit(Value::Int(1)), lit(Value::Int(0))]),
                    lit(Value::Int(3)),
                ],
                source: SourceRef::unknown(),
            },
            true,
        )],
    };
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);

    match &outcome.exports["l"] {
        Value::List(items) => {
            assert_eq!(items.len(), 3);
            assert_eq!(items[0], Value::Int(1));
            assert!(items[1].is_error());
            assert_eq!(items[2], Value::Int(3));
        }
        other => panic!("expected a list, got {other}"),
    }
}

#[test]
fn failed_assertion_surfaces_as_the_program_error() {
    let program = Program {
        statements: vec![
            apply("assert", vec![lit(Value::Bool(false))]),
            declare("after", lit(Value::Int(1)), true),
        ],
    };
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);

    assert!(matches!(
        outcome.error,
        Some(EngineError::AssertionFailure { .. })
    ));
    // Later statements still ran.
    assert_eq!(outcome.exports["after"], Value::Int(1));
}

#[test]
fn json_program_runs_end_to_end() {
    let json = r#"{
        "statements": [
            {
                "expr": "declare",
                "name": "n",
                "value": { "expr": "literal", "value": { "Int": 3 } },
                "constraint": {
                    "expr": "apply",
                    "op": "is",
                    "operands": [
                        { "expr": "variable", "name": "it" },
                        { "expr": "literal", "value": { "Str": "INTEGER" } }
                    ]
                },
                "export": true
            },
            {
                "expr": "declare",
                "name": "r",
                "value": {
                    "expr": "apply",
                    "op": "..",
                    "operands": [
                        { "expr": "literal", "value": { "Int": 1 } },
                        { "expr": "literal", "value": { "Int": 5 } }
                    ]
                },
                "export": true
            },
            {
                "expr": "declare",
                "name": "size",
                "value": {
                    "expr": "call",
                    "name": "COUNT",
                    "args": [ { "expr": "variable", "name": "r" } ]
                },
                "export": true
            }
        ]
    }"#;
    let program: Program = serde_json::from_str(json).unwrap();
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.exports["n"], Value::Int(3));
    assert_eq!(
        outcome.exports["r"],
        Value::Range(Range { start: 1, end: 5 })
    );
    assert_eq!(outcome.exports["size"], Value::Int(5));
}

#[test]
fn pure_block_rejects_impure_calls() {
    let program = Program {
        statements: vec![Expr::Block {
            body: vec![Expr::Call {
                name: "DATE".to_owned(),
                args: vec![],
                source: SourceRef::unknown(),
            }],
            pure: true,
            source: SourceRef::unknown(),
        }],
    };
    let mut engine = Engine::new();
    let outcome = engine.run_program(&program);
    assert!(matches!(
        outcome.error,
        Some(EngineError::PurityViolation { .. })
    ));
}
