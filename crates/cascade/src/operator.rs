use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::arena::SlotId;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::node::Computed;
use crate::source::SourceRef;
use crate::value::{Range, Type, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixity {
    Prefix,
    Infix,
    Postfix,
}

pub type EvalFn = fn(&[Value], &SourceRef) -> Result<Value>;

/// Static description of one operator: how many operands, how it sits in
/// the source, whether it demands an impure scope, and whether application
/// computes immediately or wires a reactive node.
#[derive(Clone, Copy)]
pub struct OperatorDescriptor {
    pub name: &'static str,
    pub arity: usize,
    pub fixity: Fixity,
    /// `Some(false)` demands an impure enclosing scope, `Some(true)` a
    /// pure one; `None` works in either mode.
    pub pure: Option<bool>,
    pub immediate: bool,
    /// Whether an error value in an operand short-circuits evaluation.
    /// Logical operators opt out so `previous is VOID || ...` style
    /// constraints can treat an error branch as falsy.
    pub contagious: bool,
    pub eval: EvalFn,
}

pub struct OperatorTable {
    table: IndexMap<&'static str, OperatorDescriptor>,
}

impl OperatorTable {
    pub fn standard() -> Self {
        let mut table = IndexMap::new();
        let mut add = |d: OperatorDescriptor| {
            table.insert(d.name, d);
        };
        add(infix("+", eval_add));
        add(infix("-", eval_subtract));
        add(infix("*", eval_multiply));
        add(infix("/", eval_divide));
        add(infix("%", eval_modulus));
        add(prefix("negate", eval_negate));
        add(infix("==", eval_eq));
        add(infix("!=", eval_ne));
        add(infix("<", eval_lt));
        add(infix("<=", eval_le));
        add(infix(">", eval_gt));
        add(infix(">=", eval_ge));
        add(logical("&&", 2, Fixity::Infix, eval_and));
        add(logical("||", 2, Fixity::Infix, eval_or));
        add(logical("!", 1, Fixity::Prefix, eval_not));
        add(infix("is", eval_is));
        add(prefix("reverse", eval_reverse));
        // Ranges are plain data once both endpoints are known.
        add(OperatorDescriptor {
            name: "..",
            arity: 2,
            fixity: Fixity::Infix,
            pure: None,
            immediate: true,
            contagious: true,
            eval: eval_range,
        });
        add(postfix("#", eval_size));
        add(OperatorDescriptor {
            name: "assert",
            arity: 1,
            fixity: Fixity::Prefix,
            pure: None,
            immediate: true,
            contagious: true,
            eval: eval_assert,
        });
        Self { table }
    }

    pub fn get(&self, name: &str) -> Option<&OperatorDescriptor> {
        self.table.get(name)
    }

    /// Add or replace a descriptor.
    pub fn register(&mut self, descriptor: OperatorDescriptor) {
        self.table.insert(descriptor.name, descriptor);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.keys().copied()
    }
}

fn infix(name: &'static str, eval: EvalFn) -> OperatorDescriptor {
    OperatorDescriptor {
        name,
        arity: 2,
        fixity: Fixity::Infix,
        pure: None,
        immediate: false,
        contagious: true,
        eval,
    }
}

fn prefix(name: &'static str, eval: EvalFn) -> OperatorDescriptor {
    OperatorDescriptor {
        name,
        arity: 1,
        fixity: Fixity::Prefix,
        pure: None,
        immediate: false,
        contagious: true,
        eval,
    }
}

fn postfix(name: &'static str, eval: EvalFn) -> OperatorDescriptor {
    OperatorDescriptor {
        name,
        arity: 1,
        fixity: Fixity::Postfix,
        pure: None,
        immediate: false,
        contagious: true,
        eval,
    }
}

fn logical(name: &'static str, arity: usize, fixity: Fixity, eval: EvalFn) -> OperatorDescriptor {
    OperatorDescriptor {
        name,
        arity,
        fixity,
        pure: None,
        immediate: false,
        contagious: false,
        eval,
    }
}

impl Engine {
    /// Make a custom operator descriptor applicable by name.
    pub fn register_operator(&mut self, descriptor: OperatorDescriptor) {
        self.operators.register(descriptor);
    }

    /// Apply an operator to operand nodes. Immediate descriptors compute
    /// once over the deep-fixed operands and return a concrete node.
    /// Reactive descriptors return a deferred node that re-reads current
    /// operand values and subscribes to every operand. Purity is validated
    /// here, once, at wiring time.
    pub fn apply(&mut self, name: &str, operands: &[SlotId], source: SourceRef) -> Result<SlotId> {
        let descriptor = *self.operators.get(name).ok_or_else(|| EngineError::Script {
            message: format!("unknown operator: {name}"),
            at: source.clone(),
        })?;
        if operands.len() != descriptor.arity {
            return Err(EngineError::Arity {
                name: name.to_owned(),
                given: operands.len(),
                min: descriptor.arity,
                max: descriptor.arity,
            });
        }
        let pure_ctx = self.in_pure_context();
        if pure_ctx && descriptor.pure == Some(false) {
            return Err(EngineError::PurityViolation {
                message: format!("operator '{name}' cannot be used in a pure expression"),
                at: source,
            });
        }
        if !pure_ctx && descriptor.pure == Some(true) {
            return Err(EngineError::PurityViolation {
                message: format!("operator '{name}' requires a pure expression context"),
                at: source,
            });
        }
        if descriptor.immediate {
            let mut values = Vec::with_capacity(operands.len());
            for operand in operands {
                values.push(self.fix_deep(*operand)?);
            }
            trace!(op = name, "immediate application");
            let value = apply_eval(descriptor.eval, descriptor.contagious, &values, &source)?;
            return Ok(self.alloc_concrete(value));
        }
        let compute_inputs: SmallVec<[SlotId; 2]> = SmallVec::from_slice(operands);
        let eval = descriptor.eval;
        let contagious = descriptor.contagious;
        let pure = descriptor.pure != Some(false);
        let node_source = source.clone();
        let slot = self.alloc_deferred(
            descriptor.name,
            node_source,
            operands,
            pure,
            Rc::new(move |engine: &mut Engine| {
                let mut values = Vec::with_capacity(compute_inputs.len());
                for input in &compute_inputs {
                    values.push(engine.fix_deep(*input)?);
                }
                apply_eval(eval, contagious, &values, &source).map(Computed::Value)
            }),
        );
        for operand in operands {
            self.listen_dependent(*operand, slot)?;
        }
        Ok(slot)
    }
}

/// Error values are contagious for most operators: an error operand is
/// returned as the result rather than running the evaluation.
fn apply_eval(eval: EvalFn, contagious: bool, values: &[Value], source: &SourceRef) -> Result<Value> {
    if contagious {
        for value in values {
            if value.is_error() {
                return Ok(value.clone());
            }
        }
    }
    eval(values, source)
}

fn numeric_pair(args: &[Value], op: &str, source: &SourceRef) -> Result<(f64, f64, bool)> {
    let lhs = &args[0];
    let rhs = &args[1];
    let both_int = matches!(lhs, Value::Int(_)) && matches!(rhs, Value::Int(_));
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b, both_int)),
        _ => Err(EngineError::Script {
            message: format!(
                "operator '{op}' needs numeric operands, got {} and {}",
                Type::of(lhs),
                Type::of(rhs)
            ),
            at: source.clone(),
        }),
    }
}

fn eval_add(args: &[Value], source: &SourceRef) -> Result<Value> {
    match (&args[0], &args[1]) {
        // String concatenation wins when either side is a string.
        (Value::Str(a), b) => Ok(Value::str(&format!("{a}{b}"))),
        (a, Value::Str(b)) => Ok(Value::str(&format!("{a}{b}"))),
        (Value::List(a), b) => {
            let mut items = a.as_ref().clone();
            items.push(b.clone());
            Ok(Value::list(items))
        }
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        _ => {
            let (a, b, _) = numeric_pair(args, "+", source)?;
            Ok(Value::decimal(a + b))
        }
    }
}

fn eval_subtract(args: &[Value], source: &SourceRef) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
        return Ok(Value::Int(a.wrapping_sub(*b)));
    }
    let (a, b, _) = numeric_pair(args, "-", source)?;
    Ok(Value::decimal(a - b))
}

fn eval_multiply(args: &[Value], source: &SourceRef) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
        return Ok(Value::Int(a.wrapping_mul(*b)));
    }
    let (a, b, _) = numeric_pair(args, "*", source)?;
    Ok(Value::decimal(a * b))
}

fn eval_divide(args: &[Value], source: &SourceRef) -> Result<Value> {
    let (a, b, both_int) = numeric_pair(args, "/", source)?;
    if b == 0.0 {
        return Err(EngineError::Script {
            message: "division by zero".to_owned(),
            at: source.clone(),
        });
    }
    if both_int {
        match (&args[0], &args[1]) {
            // checked_div: i64::MIN / -1 overflows i64.
            (Value::Int(a), Value::Int(b)) => {
                a.checked_div(*b)
                    .map(Value::Int)
                    .ok_or_else(|| EngineError::Script {
                        message: "integer overflow in division".to_owned(),
                        at: source.clone(),
                    })
            }
            _ => Ok(Value::decimal(a / b)),
        }
    } else {
        Ok(Value::decimal(a / b))
    }
}

fn eval_modulus(args: &[Value], source: &SourceRef) -> Result<Value> {
    let (a, b, both_int) = numeric_pair(args, "%", source)?;
    if b == 0.0 {
        return Err(EngineError::Script {
            message: "modulus by zero".to_owned(),
            at: source.clone(),
        });
    }
    if both_int {
        match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_rem(*b)
                    .map(Value::Int)
                    .ok_or_else(|| EngineError::Script {
                        message: "integer overflow in modulus".to_owned(),
                        at: source.clone(),
                    })
            }
            _ => Ok(Value::decimal(a % b)),
        }
    } else {
        Ok(Value::decimal(a % b))
    }
}

fn eval_negate(args: &[Value], source: &SourceRef) -> Result<Value> {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
        Value::Decimal(d) => Ok(Value::decimal(-d.0)),
        other => Err(EngineError::Script {
            message: format!("cannot negate {}", Type::of(other)),
            at: source.clone(),
        }),
    }
}

fn eval_eq(args: &[Value], _source: &SourceRef) -> Result<Value> {
    let equal = args[0] == args[1] || args[0].compare(&args[1]) == Some(Ordering::Equal);
    Ok(Value::Bool(equal))
}

fn eval_ne(args: &[Value], source: &SourceRef) -> Result<Value> {
    match eval_eq(args, source)? {
        Value::Bool(equal) => Ok(Value::Bool(!equal)),
        other => Ok(other),
    }
}

fn eval_ordering(
    args: &[Value],
    source: &SourceRef,
    op: &str,
    accept: &[Ordering],
) -> Result<Value> {
    match args[0].compare(&args[1]) {
        Some(ordering) => Ok(Value::Bool(accept.contains(&ordering))),
        None => Err(EngineError::Script {
            message: format!(
                "cannot compare {} {op} {}",
                Type::of(&args[0]),
                Type::of(&args[1])
            ),
            at: source.clone(),
        }),
    }
}

fn eval_lt(args: &[Value], source: &SourceRef) -> Result<Value> {
    eval_ordering(args, source, "<", &[Ordering::Less])
}

fn eval_le(args: &[Value], source: &SourceRef) -> Result<Value> {
    eval_ordering(args, source, "<=", &[Ordering::Less, Ordering::Equal])
}

fn eval_gt(args: &[Value], source: &SourceRef) -> Result<Value> {
    eval_ordering(args, source, ">", &[Ordering::Greater])
}

fn eval_ge(args: &[Value], source: &SourceRef) -> Result<Value> {
    eval_ordering(args, source, ">=", &[Ordering::Greater, Ordering::Equal])
}

fn eval_and(args: &[Value], _source: &SourceRef) -> Result<Value> {
    Ok(Value::Bool(args[0].is_truthy() && args[1].is_truthy()))
}

fn eval_or(args: &[Value], _source: &SourceRef) -> Result<Value> {
    Ok(Value::Bool(args[0].is_truthy() || args[1].is_truthy()))
}

fn eval_not(args: &[Value], _source: &SourceRef) -> Result<Value> {
    Ok(Value::Bool(!args[0].is_truthy()))
}

/// Type predicate: `it is INTEGER`. The right-hand side is a type name.
fn eval_is(args: &[Value], source: &SourceRef) -> Result<Value> {
    let name = args[1].as_str().ok_or_else(|| EngineError::Script {
        message: format!("'is' needs a type name, got {}", Type::of(&args[1])),
        at: source.clone(),
    })?;
    let ty = Type::parse(name).ok_or_else(|| EngineError::Script {
        message: format!("unknown type name: {name}"),
        at: source.clone(),
    })?;
    Ok(Value::Bool(ty.matches(&args[0])))
}

/// Reversal over sequence-shaped values: lists, strings and ranges.
fn eval_reverse(args: &[Value], source: &SourceRef) -> Result<Value> {
    match &args[0] {
        Value::List(items) => {
            let reversed: Vec<Value> = items.iter().rev().cloned().collect();
            Ok(Value::list(reversed))
        }
        Value::Str(s) => Ok(Value::str(&s.chars().rev().collect::<String>())),
        Value::Range(r) => Ok(Value::range(r.end, r.start)),
        other => Err(EngineError::Script {
            message: format!("cannot reverse {}", Type::of(other)),
            at: source.clone(),
        }),
    }
}

fn eval_range(args: &[Value], source: &SourceRef) -> Result<Value> {
    match (args[0].as_int(), args[1].as_int()) {
        (Some(start), Some(end)) => Ok(Value::Range(Range { start, end })),
        _ => Err(EngineError::Script {
            message: format!(
                "range endpoints must be integers, got {} and {}",
                Type::of(&args[0]),
                Type::of(&args[1])
            ),
            at: source.clone(),
        }),
    }
}

fn eval_size(args: &[Value], source: &SourceRef) -> Result<Value> {
    args[0].size().map(Value::Int).ok_or_else(|| EngineError::Script {
        message: format!("{} has no size", Type::of(&args[0])),
        at: source.clone(),
    })
}

/// A failed assertion aborts the construct that drove it instead of
/// becoming an error value.
fn eval_assert(args: &[Value], source: &SourceRef) -> Result<Value> {
    if args[0].is_truthy() {
        Ok(Value::Bool(true))
    } else {
        Err(EngineError::AssertionFailure {
            message: format!("asserted value was {}", args[0]),
            at: source.clone(),
        })
    }
}
