use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::arena::SlotId;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::node::Computed;
use crate::source::SourceRef;
use crate::value::{Type, Value};

const DAY_IN_MILLIS: f64 = 86_400_000.0;
const DAY_IN_SECONDS: f64 = 86_400.0;
const DAY_IN_MINUTES: f64 = 1_440.0;
const DAY_IN_HOURS: f64 = 24.0;
const WEEK_IN_DAYS: f64 = 7.0;

type BuiltinFn = fn(&[Value], &SourceRef) -> Result<Value>;

/// A native function: arity bounds and purity flag are declared up front
/// and checked before `run` ever executes.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub min_arity: usize,
    pub max_arity: usize,
    pub pure: bool,
    run: BuiltinFn,
}

pub struct BuiltinRegistry {
    map: IndexMap<&'static str, Builtin>,
}

impl BuiltinRegistry {
    pub fn standard() -> Self {
        let mut registry = Self {
            map: IndexMap::new(),
        };
        registry.add(1, 1, true, builtin_abs, &["ABS"]);
        registry.add(1, usize::MAX, true, builtin_format, &["FORMAT"]);
        registry.add(1, 1, true, builtin_len, &["LEN"]);
        registry.add(1, 1, true, builtin_count, &["COUNT"]);
        registry.add(2, 2, true, builtin_matches, &["MATCHES"]);
        registry.add(1, 2, true, builtin_error, &["ERROR"]);
        registry.add(0, 0, false, builtin_date, &["DATE"]);
        registry.add(0, 0, false, builtin_time, &["TIME"]);
        registry.add(1, 1, false, builtin_sleep, &["SLEEP"]);
        // Duration conversions, all to fractional days.
        registry.add(1, 1, true, builtin_millis, &["MS", "MILLIS", "MILLISECOND", "MILLISECONDS"]);
        registry.add(1, 1, true, builtin_seconds, &["S", "SEC", "SECS", "SECOND", "SECONDS"]);
        registry.add(1, 1, true, builtin_minutes, &["M", "MINUTE", "MINUTES"]);
        registry.add(1, 1, true, builtin_hours, &["H", "HOUR", "HOURS"]);
        registry.add(1, 1, true, builtin_days, &["D", "DAY", "DAYS"]);
        registry.add(1, 1, true, builtin_weeks, &["W", "WEEK", "WEEKS"]);
        registry
    }

    fn add(&mut self, min: usize, max: usize, pure: bool, run: BuiltinFn, names: &[&'static str]) {
        for name in names {
            self.map.insert(
                name,
                Builtin {
                    name,
                    min_arity: min,
                    max_arity: max,
                    pure,
                    run,
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.map.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn is_pure(&self, name: &str) -> bool {
        self.map.get(name).is_some_and(|b| b.pure)
    }
}

impl Engine {
    /// Wire a builtin call as a reactive node. Unknown name, arity out of
    /// bounds and impure-from-pure are all rejected here, before the
    /// implementation could ever run.
    pub fn call_builtin(
        &mut self,
        name: &str,
        args: &[SlotId],
        source: SourceRef,
    ) -> Result<SlotId> {
        let builtin = *self
            .builtins
            .get(name)
            .ok_or_else(|| EngineError::BuiltinNotFound {
                name: name.to_owned(),
            })?;
        if args.len() < builtin.min_arity || args.len() > builtin.max_arity {
            return Err(EngineError::Arity {
                name: builtin.name.to_owned(),
                given: args.len(),
                min: builtin.min_arity,
                max: builtin.max_arity,
            });
        }
        if self.in_pure_context() && !builtin.pure {
            return Err(EngineError::PurityViolation {
                message: format!("impure builtin '{name}' called from a pure expression"),
                at: source,
            });
        }
        trace!(builtin = builtin.name, args = args.len(), "wiring builtin call");
        let compute_inputs: SmallVec<[SlotId; 2]> = SmallVec::from_slice(args);
        let run = builtin.run;
        let node_source = source.clone();
        let slot = self.alloc_deferred(
            builtin.name,
            node_source,
            args,
            builtin.pure,
            Rc::new(move |engine: &mut Engine| {
                let mut values = Vec::with_capacity(compute_inputs.len());
                for input in &compute_inputs {
                    values.push(engine.fix_deep(*input)?);
                }
                for value in &values {
                    if value.is_error() {
                        return Ok(Computed::Value(value.clone()));
                    }
                }
                run(&values, &source).map(Computed::Value)
            }),
        );
        for arg in args {
            self.listen_dependent(*arg, slot)?;
        }
        Ok(slot)
    }
}

fn need_number(value: &Value, name: &str, source: &SourceRef) -> Result<f64> {
    value.as_f64().ok_or_else(|| EngineError::Script {
        message: format!("{name} needs a numeric argument, got {}", Type::of(value)),
        at: source.clone(),
    })
}

fn builtin_abs(args: &[Value], source: &SourceRef) -> Result<Value> {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Decimal(d) => Ok(Value::decimal(d.0.abs())),
        other => Err(EngineError::Script {
            message: format!("ABS needs a numeric argument, got {}", Type::of(other)),
            at: source.clone(),
        }),
    }
}

/// `FORMAT("x={} y={}", a, b)`: each `{}` consumes the next argument's
/// display form; surplus placeholders render empty.
fn builtin_format(args: &[Value], source: &SourceRef) -> Result<Value> {
    let template = args[0].as_str().ok_or_else(|| EngineError::Script {
        message: format!("FORMAT needs a string template, got {}", Type::of(&args[0])),
        at: source.clone(),
    })?;
    let mut rest = args[1..].iter();
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'}') {
            chars.next();
            if let Some(value) = rest.next() {
                out.push_str(&value.to_display_string());
            }
        } else {
            out.push(c);
        }
    }
    Ok(Value::str(&out))
}

fn builtin_len(args: &[Value], _source: &SourceRef) -> Result<Value> {
    Ok(Value::Int(
        args[0].to_display_string().chars().count() as i64
    ))
}

fn builtin_count(args: &[Value], source: &SourceRef) -> Result<Value> {
    args[0]
        .size()
        .map(Value::Int)
        .ok_or_else(|| EngineError::Script {
            message: format!("COUNT cannot count {}", Type::of(&args[0])),
            at: source.clone(),
        })
}

/// Glob-style match over the whole string: `*` spans any run, `?` one char.
fn builtin_matches(args: &[Value], _source: &SourceRef) -> Result<Value> {
    let text = args[0].to_display_string();
    let pattern = args[1].to_display_string();
    Ok(Value::Bool(wildcard_match(&text, &pattern)))
}

fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    fn go(t: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some((&'*', rest)) => (0..=t.len()).any(|skip| go(&t[skip..], rest)),
            Some((&'?', rest)) => t.split_first().is_some_and(|(_, tr)| go(tr, rest)),
            Some((&c, rest)) => t
                .split_first()
                .is_some_and(|(&tc, tr)| tc == c && go(tr, rest)),
        }
    }
    go(&text, &pattern)
}

fn builtin_error(args: &[Value], source: &SourceRef) -> Result<Value> {
    let kind = args[0].to_display_string();
    let message = args.get(1).map(|v| v.to_display_string()).unwrap_or_default();
    Ok(Value::error(&kind, &message, source.clone()))
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn builtin_date(_args: &[Value], _source: &SourceRef) -> Result<Value> {
    Ok(Value::Date(epoch_millis()))
}

fn builtin_time(_args: &[Value], _source: &SourceRef) -> Result<Value> {
    Ok(Value::Int(epoch_millis()))
}

/// Argument is fractional days, matching the duration builtins.
fn builtin_sleep(args: &[Value], source: &SourceRef) -> Result<Value> {
    let days = need_number(&args[0], "SLEEP", source)?;
    std::thread::sleep(Duration::from_millis((days * DAY_IN_MILLIS) as u64));
    Ok(args[0].clone())
}

fn builtin_millis(args: &[Value], source: &SourceRef) -> Result<Value> {
    Ok(Value::decimal(need_number(&args[0], "MS", source)? / DAY_IN_MILLIS))
}

fn builtin_seconds(args: &[Value], source: &SourceRef) -> Result<Value> {
    Ok(Value::decimal(need_number(&args[0], "S", source)? / DAY_IN_SECONDS))
}

fn builtin_minutes(args: &[Value], source: &SourceRef) -> Result<Value> {
    Ok(Value::decimal(need_number(&args[0], "M", source)? / DAY_IN_MINUTES))
}

fn builtin_hours(args: &[Value], source: &SourceRef) -> Result<Value> {
    Ok(Value::decimal(need_number(&args[0], "H", source)? / DAY_IN_HOURS))
}

fn builtin_days(args: &[Value], source: &SourceRef) -> Result<Value> {
    Ok(Value::decimal(need_number(&args[0], "D", source)?))
}

fn builtin_weeks(args: &[Value], source: &SourceRef) -> Result<Value> {
    Ok(Value::decimal(need_number(&args[0], "W", source)? * WEEK_IN_DAYS))
}
