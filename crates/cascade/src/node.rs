use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use smallvec::SmallVec;
use ulid::Ulid;

use crate::arena::SlotId;
use crate::engine::Engine;
use crate::error::Result;
use crate::source::SourceRef;
use crate::value::Value;

pub type ListenerId = Ulid;

/// Outcome of running a deferred node's compute: either a concrete value or
/// a handle to another node that still needs forcing. The fix protocol
/// decides, by remaining depth, whether to follow the handle or surface it.
pub enum Computed {
    Value(Value),
    Node(SlotId),
}

pub type ComputeFn = Rc<dyn Fn(&mut Engine) -> Result<Computed>>;

/// A deferred computation with its wiring metadata. `cached`/`stale`
/// memoize pure nodes between notifications; impure nodes recompute on
/// every fix.
#[derive(Clone)]
pub struct Deferred {
    pub op_name: Arc<str>,
    pub source: SourceRef,
    pub inputs: SmallVec<[SlotId; 2]>,
    pub pure: bool,
    pub compute: ComputeFn,
    pub cached: Option<Value>,
    pub stale: bool,
}

/// A value node is either concrete data or a deferred computation. A
/// concrete node holding a `Value::Node` handle forwards to its target;
/// binding cells use that to stay a stable listener anchor across
/// reassignment.
#[derive(Clone)]
pub enum NodeKind {
    Concrete(Value),
    Deferred(Deferred),
}

#[derive(Clone)]
pub enum Listener {
    /// A downstream node: mark stale and re-notify.
    Dependent(SlotId),
    /// A user callback, invoked with the node's freshly fixed value.
    Callback(Rc<dyn Fn(&mut Engine, &Value) -> Result<()>>),
}

#[derive(Clone)]
pub struct ListenerEntry {
    pub id: ListenerId,
    pub listener: Listener,
}

/// One arena slot: the node itself plus its listener registrations, which
/// fire in registration order.
pub struct NodeSlot {
    pub kind: NodeKind,
    pub listeners: Vec<ListenerEntry>,
}

impl NodeSlot {
    pub fn concrete(value: Value) -> Self {
        Self {
            kind: NodeKind::Concrete(value),
            listeners: Vec::new(),
        }
    }

    pub fn deferred(
        op_name: &str,
        source: SourceRef,
        inputs: SmallVec<[SlotId; 2]>,
        pure: bool,
        compute: ComputeFn,
    ) -> Self {
        Self {
            kind: NodeKind::Deferred(Deferred {
                op_name: Arc::from(op_name),
                source,
                inputs,
                pure,
                compute,
                cached: None,
                stale: true,
            }),
            listeners: Vec::new(),
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Concrete(value) => f.debug_tuple("Concrete").field(value).finish(),
            NodeKind::Deferred(d) => f
                .debug_struct("Deferred")
                .field("op_name", &d.op_name)
                .field("inputs", &d.inputs)
                .field("pure", &d.pure)
                .field("stale", &d.stale)
                .finish_non_exhaustive(),
        }
    }
}
