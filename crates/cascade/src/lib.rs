//! Cascade: a reactive expression-evaluation engine.
//!
//! Expressions are simultaneously an evaluation tree and a live dataflow
//! graph. Value nodes are either concrete data or deferred computations
//! living in a generational arena; bindings live in lexically chained
//! scope frames with an enforced pure/impure mode; the fix protocol forces
//! a node to a concrete value at a controlled depth; and the notification
//! protocol re-triggers dependents when a binding changes.
//!
//! ```
//! use cascade::{Engine, SourceRef, Value, VarFlags};
//!
//! let mut engine = Engine::new();
//! let src = SourceRef::unknown();
//!
//! // x := 1; y := x + 1
//! let one = engine.alloc_concrete(Value::Int(1));
//! engine.declare("x", one, None, VarFlags::default(), &src).unwrap();
//! let x = engine.variable_node("x", false, src.clone());
//! let lit = engine.alloc_concrete(Value::Int(1));
//! let sum = engine.apply("+", &[x, lit], src.clone()).unwrap();
//! let y = engine.declare("y", sum, None, VarFlags::default(), &src).unwrap();
//! assert_eq!(engine.fix_deep(y).unwrap(), Value::Int(2));
//!
//! // x = 5 re-propagates through the graph.
//! let five = engine.alloc_concrete(Value::Int(5));
//! engine.assign("x", five, None, &src).unwrap();
//! assert_eq!(engine.fix_deep(y).unwrap(), Value::Int(6));
//! ```

pub mod arena;
pub mod builtin;
pub mod engine;
pub mod error;
pub mod node;
pub mod operator;
pub mod program;
pub mod schedule;
pub mod scope;
pub mod source;
pub mod value;

pub use arena::SlotId;
pub use builtin::{Builtin, BuiltinRegistry};
pub use engine::{Engine, MAX_FIX_DEPTH};
pub use error::{EngineError, Result};
pub use node::{Computed, Listener, ListenerId, NodeKind};
pub use operator::{EvalFn, Fixity, OperatorDescriptor, OperatorTable};
pub use program::{Expr, Program, ProgramOutcome};
pub use schedule::{Scheduler, TaskId};
pub use scope::{Binding, ScopeId, VarFlags, VarKey};
pub use source::SourceRef;
pub use value::{ErrorValue, Range, Type, Value};
