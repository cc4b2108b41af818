use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arena::SlotId;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::scope::VarFlags;
use crate::source::SourceRef;
use crate::value::Value;

/// One expression record, as the front end emits them: operator
/// applications over value-node operands, with source tags. Precedence and
/// associativity were the front end's problem; this is already a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Value,
        #[serde(default)]
        source: SourceRef,
    },
    Variable {
        name: String,
        #[serde(default)]
        numeric: bool,
        #[serde(default)]
        source: SourceRef,
    },
    Apply {
        op: String,
        operands: Vec<Expr>,
        #[serde(default)]
        source: SourceRef,
    },
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        source: SourceRef,
    },
    Declare {
        name: String,
        value: Box<Expr>,
        #[serde(default)]
        constraint: Option<Box<Expr>>,
        #[serde(default)]
        constant: bool,
        #[serde(default)]
        volatile: bool,
        #[serde(default)]
        pure: bool,
        #[serde(default)]
        export: bool,
        #[serde(default)]
        source: SourceRef,
    },
    Assign {
        name: String,
        value: Box<Expr>,
        #[serde(default)]
        constraint: Option<Box<Expr>>,
        #[serde(default)]
        source: SourceRef,
    },
    Block {
        body: Vec<Expr>,
        #[serde(default)]
        pure: bool,
        #[serde(default)]
        source: SourceRef,
    },
    List {
        items: Vec<Expr>,
        #[serde(default)]
        source: SourceRef,
    },
    Map {
        entries: Vec<(String, Expr)>,
        #[serde(default)]
        source: SourceRef,
    },
}

/// A whole script: an ordered sequence of top-level expression records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Expr>,
}

/// Result of running a program. Exports accumulate in declaration order,
/// survive a later failing declaration, and hold the final fixed value of
/// each exported binding after the last statement has run; `error` carries
/// the first failure that surfaced at top level, if any.
#[derive(Debug)]
pub struct ProgramOutcome {
    pub exports: IndexMap<Arc<str>, Value>,
    pub error: Option<EngineError>,
}

/// Identity of a constraint for the cannot-swap rule: the serialized form
/// of its expression record.
fn constraint_fingerprint(expr: &Expr) -> Arc<str> {
    let rendered = serde_json::to_string(expr).unwrap_or_else(|_| format!("{expr:?}"));
    Arc::from(rendered.as_str())
}

impl Engine {
    /// Build the node graph for one expression record in the current
    /// scope, returning the slot of its root node. Declarations and
    /// assignments take effect as a side effect of evaluation.
    pub fn evaluate(&mut self, expr: &Expr) -> Result<SlotId> {
        match expr {
            Expr::Literal { value, .. } => Ok(self.alloc_concrete(value.clone())),
            Expr::Variable {
                name,
                numeric,
                source,
            } => Ok(self.variable_node(name, *numeric, source.clone())),
            Expr::Apply {
                op,
                operands,
                source,
            } => {
                let mut slots = Vec::with_capacity(operands.len());
                for operand in operands {
                    slots.push(self.evaluate(operand)?);
                }
                self.apply(op, &slots, source.clone())
            }
            Expr::Call { name, args, source } => {
                let mut slots = Vec::with_capacity(args.len());
                for arg in args {
                    slots.push(self.evaluate(arg)?);
                }
                self.call_builtin(name, &slots, source.clone())
            }
            Expr::Declare {
                name,
                value,
                constraint,
                constant,
                volatile,
                pure,
                export,
                source,
            } => {
                let wiring = match constraint {
                    Some(c) => {
                        let label = constraint_fingerprint(c);
                        let slot = self.evaluate(c)?;
                        Some((slot, label))
                    }
                    None => None,
                };
                let rhs = self.evaluate(value)?;
                let flags = VarFlags {
                    constant: *constant,
                    volatile: *volatile,
                    pure: *pure,
                };
                let cell = self.declare(name, rhs, wiring, flags, source)?;
                if *export {
                    debug!(%name, ?cell, "exported");
                    self.export(name, cell);
                }
                Ok(cell)
            }
            Expr::Assign {
                name,
                value,
                constraint,
                source,
            } => {
                let label = constraint.as_ref().map(|c| constraint_fingerprint(c));
                let rhs = self.evaluate(value)?;
                self.assign(name, rhs, label.as_deref(), source)
            }
            Expr::Block { body, pure, .. } => {
                let scope = self.push_scope(*pure || self.in_pure_context(), "block")?;
                let mut last: Result<SlotId> = Ok(self.alloc_concrete(Value::Void));
                for statement in body {
                    last = self.evaluate(statement);
                    if last.is_err() {
                        break;
                    }
                }
                self.pop_scope(scope)?;
                last
            }
            // Elements resolve independently: a failing element becomes an
            // error value and its siblings are unaffected.
            Expr::List { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.element_value(item)?);
                }
                Ok(self.alloc_concrete(Value::list(values)))
            }
            Expr::Map { entries, .. } => {
                let mut map: IndexMap<Arc<str>, Value> = IndexMap::with_capacity(entries.len());
                for (key, item) in entries {
                    let value = self.element_value(item)?;
                    map.insert(Arc::from(key.as_str()), value);
                }
                Ok(self.alloc_concrete(Value::map(map)))
            }
        }
    }

    fn element_value(&mut self, item: &Expr) -> Result<Value> {
        match self.evaluate(item).and_then(|slot| self.fix_deep(slot)) {
            Ok(value) => Ok(value),
            Err(err @ EngineError::InternalConsistency(_)) => Err(err),
            Err(err) => Ok(Value::from_engine_error(&err)),
        }
    }

    /// Evaluate every top-level statement, driving each to at least its
    /// outermost value. The first failure is recorded, not fatal: later
    /// statements still run, and exports from earlier ones stay valid.
    /// Exported bindings are resolved once every statement has run, so the
    /// table reflects the script's final state.
    pub fn run_program(&mut self, program: &Program) -> ProgramOutcome {
        let mut error: Option<EngineError> = None;
        for statement in &program.statements {
            match self.evaluate(statement).and_then(|slot| self.fix(slot, 1)) {
                Ok(Value::Error(captured)) => {
                    if error.is_none() {
                        error = Some(captured.raise());
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if error.is_none() {
                        error = Some(err);
                    }
                }
            }
        }
        let cells: Vec<(Arc<str>, SlotId)> = self
            .exports()
            .iter()
            .map(|(name, cell)| (name.clone(), *cell))
            .collect();
        let mut exports = IndexMap::with_capacity(cells.len());
        for (name, cell) in cells {
            match self.fix_deep(cell) {
                Ok(value) => {
                    exports.insert(name, value);
                }
                Err(err) => {
                    exports.insert(name, Value::from_engine_error(&err));
                    if error.is_none() {
                        error = Some(err);
                    }
                }
            }
        }
        ProgramOutcome { exports, error }
    }
}
