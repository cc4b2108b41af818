use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};
use ulid::Ulid;

use crate::arena::{Arena, SlotId};
use crate::builtin::BuiltinRegistry;
use crate::error::{EngineError, Result};
use crate::node::{Computed, ComputeFn, Listener, ListenerEntry, ListenerId, NodeKind, NodeSlot};
use crate::operator::OperatorTable;
use crate::schedule::{Scheduler, TaskId};
use crate::scope::{Binding, ScopeId, ScopeStore, VarFlags, VarKey};
use crate::source::SourceRef;
use crate::value::Value;

/// Guard against runaway lazy recursion: once this many deferred computes
/// are nested, fixing yields an error value instead of overflowing the
/// stack.
pub const MAX_FIX_DEPTH: usize = 100;

/// The reactive evaluation engine: a node arena, a scope store with an
/// active stack, the export table and the virtual-time scheduler.
///
/// Single-threaded per logical execution; the scope stack is owned, not
/// shared. `assign` and `notify` are the only mutation paths for bindings
/// and nodes.
pub struct Engine {
    pub(crate) arena: Arena,
    pub(crate) scopes: ScopeStore,
    pub(crate) stack: Vec<ScopeId>,
    pub(crate) exports: IndexMap<Arc<str>, SlotId>,
    pub(crate) notify_stack: Vec<SlotId>,
    pub(crate) fix_stack: Vec<SlotId>,
    pub(crate) operators: OperatorTable,
    pub(crate) builtins: BuiltinRegistry,
    pub(crate) scheduler: Scheduler,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut scopes = ScopeStore::new();
        let root = scopes.push_frame(None, false, "root");
        Self {
            arena: Arena::new(),
            scopes,
            stack: vec![root],
            exports: IndexMap::new(),
            notify_stack: Vec::new(),
            fix_stack: Vec::new(),
            operators: OperatorTable::standard(),
            builtins: BuiltinRegistry::standard(),
            scheduler: Scheduler::new(),
        }
    }

    // ----- scope stack -------------------------------------------------

    pub fn current_scope(&self) -> ScopeId {
        // The stack always holds at least the root frame.
        self.stack.last().copied().unwrap_or(ScopeId(0))
    }

    pub fn in_pure_context(&self) -> bool {
        self.scopes.frame(self.current_scope()).pure
    }

    /// Open a child scope of the current one and make it active.
    /// Opening an impure scope under a pure parent is a construction error.
    pub fn push_scope(&mut self, pure: bool, label: &str) -> Result<ScopeId> {
        let parent = self.current_scope();
        if self.scopes.frame(parent).pure && !pure {
            return Err(EngineError::PurityViolation {
                message: format!("cannot open impure scope '{label}' inside a pure scope"),
                at: SourceRef::unknown(),
            });
        }
        let id = self.scopes.push_frame(Some(parent), pure, label);
        self.stack.push(id);
        Ok(id)
    }

    /// Close the active scope. Popping anything other than the frame the
    /// caller opened is a defect, not user error.
    pub fn pop_scope(&mut self, expected: ScopeId) -> Result<()> {
        if self.stack.len() == 1 {
            return Err(EngineError::InternalConsistency(
                "attempted to pop the root scope".to_owned(),
            ));
        }
        let top = self.current_scope();
        if top != expected {
            return Err(EngineError::InternalConsistency(format!(
                "popped scope {:?} but {:?} was on top",
                expected, top
            )));
        }
        self.stack.pop();
        Ok(())
    }

    // ----- node construction -------------------------------------------

    pub fn alloc_concrete(&mut self, value: Value) -> SlotId {
        self.arena.alloc(NodeSlot::concrete(value))
    }

    pub fn alloc_deferred(
        &mut self,
        op_name: &str,
        source: SourceRef,
        inputs: &[SlotId],
        pure: bool,
        compute: ComputeFn,
    ) -> SlotId {
        self.arena.alloc(NodeSlot::deferred(
            op_name,
            source,
            SmallVec::from_slice(inputs),
            pure,
            compute,
        ))
    }

    /// Allocate a deferred node whose compute closure needs its own slot id
    /// (to subscribe itself to dependencies it discovers while running).
    pub fn alloc_deferred_cyclic(
        &mut self,
        op_name: &str,
        source: SourceRef,
        inputs: &[SlotId],
        pure: bool,
        build: impl FnOnce(SlotId) -> ComputeFn,
    ) -> SlotId {
        let placeholder: ComputeFn = Rc::new(|_| Ok(Computed::Value(Value::Void)));
        let slot = self.arena.alloc(NodeSlot::deferred(
            op_name,
            source,
            SmallVec::from_slice(inputs),
            pure,
            placeholder,
        ));
        let compute = build(slot);
        if let Some(node) = self.arena.get_mut(slot) {
            if let NodeKind::Deferred(d) = &mut node.kind {
                d.compute = compute;
            }
        }
        slot
    }

    // ----- fix protocol ------------------------------------------------

    /// Force a node to a concrete value, resolving at most `depth` levels
    /// of nested deferred results. `depth = 1` resolves only the outermost
    /// computation; a deeper unresolved node surfaces as `Value::Node`.
    ///
    /// Compute failures are captured as error values; only internal
    /// consistency failures stay hard errors.
    pub fn fix(&mut self, slot: SlotId, depth: u32) -> Result<Value> {
        if depth == 0 {
            return Ok(Value::Node(slot));
        }
        enum Plan {
            Ready(Value),
            Follow(SlotId),
            Run {
                compute: ComputeFn,
                pure: bool,
                op_name: Arc<str>,
                source: SourceRef,
            },
        }
        let plan = match self.arena.get(slot) {
            None => {
                return Err(EngineError::InternalConsistency(format!(
                    "fix on a stale node handle {slot:?}"
                )));
            }
            Some(node) => match &node.kind {
                // A cell holding a handle forwards without consuming depth.
                NodeKind::Concrete(Value::Node(target)) => Plan::Follow(*target),
                NodeKind::Concrete(value) => Plan::Ready(value.clone()),
                NodeKind::Deferred(d) => {
                    if d.pure && !d.stale {
                        match &d.cached {
                            Some(cached) => Plan::Ready(cached.clone()),
                            None => Plan::Run {
                                compute: d.compute.clone(),
                                pure: d.pure,
                                op_name: d.op_name.clone(),
                                source: d.source.clone(),
                            },
                        }
                    } else {
                        Plan::Run {
                            compute: d.compute.clone(),
                            pure: d.pure,
                            op_name: d.op_name.clone(),
                            source: d.source.clone(),
                        }
                    }
                }
            },
        };
        match plan {
            Plan::Ready(value) => Ok(value),
            Plan::Follow(target) => self.fix(target, depth),
            Plan::Run {
                compute,
                pure,
                op_name,
                source,
            } => {
                if self.fix_stack.len() >= MAX_FIX_DEPTH {
                    trace!(op = %op_name, "maximum fix depth exceeded");
                    return Ok(Value::error(
                        "recursion",
                        &format!(
                            "exceeded maximum evaluation depth of {MAX_FIX_DEPTH} while fixing '{op_name}'"
                        ),
                        source,
                    ));
                }
                trace!(op = %op_name, ?slot, depth, "fixing deferred node");
                // The handle-following recursion stays inside this node's
                // guard frame, so cyclic graphs hit the depth limit instead
                // of overflowing the call stack.
                self.fix_stack.push(slot);
                let outcome = compute(self);
                let resolved = match outcome {
                    Ok(Computed::Value(value)) => Ok(value),
                    Ok(Computed::Node(inner)) => {
                        if depth > 1 {
                            self.fix(inner, depth - 1)
                        } else {
                            Ok(Value::Node(inner))
                        }
                    }
                    Err(err @ EngineError::InternalConsistency(_)) => Err(err),
                    Err(err) => Ok(Value::from_engine_error(&err)),
                };
                self.fix_stack.pop();
                let value = resolved?;
                // Memoize pure nodes only; handles are never cached because
                // they are depth artifacts, not results.
                if pure && !value.is_node() {
                    if let Some(node) = self.arena.get_mut(slot) {
                        if let NodeKind::Deferred(d) = &mut node.kind {
                            d.cached = Some(value.clone());
                            d.stale = false;
                        }
                    }
                }
                Ok(value)
            }
        }
    }

    /// Force to full normal form.
    pub fn fix_deep(&mut self, slot: SlotId) -> Result<Value> {
        self.fix(slot, u32::MAX)
    }

    /// Like `fix_deep`, but converts a captured error value into a hard
    /// failure.
    pub fn fix_or_raise(&mut self, slot: SlotId) -> Result<Value> {
        match self.fix_deep(slot)? {
            Value::Error(e) => Err(e.raise()),
            value => Ok(value),
        }
    }

    pub fn mark_stale(&mut self, slot: SlotId) {
        if let Some(node) = self.arena.get_mut(slot) {
            if let NodeKind::Deferred(d) = &mut node.kind {
                d.stale = true;
            }
        }
    }

    /// Mark a node and everything it computes from as stale. Used before
    /// re-running a constraint against a new candidate.
    pub fn mark_subgraph_stale(&mut self, root: SlotId) {
        let mut visited: HashSet<SlotId> = HashSet::new();
        let mut queue = vec![root];
        while let Some(slot) = queue.pop() {
            if !visited.insert(slot) {
                continue;
            }
            match self.arena.get(slot).map(|node| &node.kind) {
                Some(NodeKind::Concrete(Value::Node(target))) => queue.push(*target),
                Some(NodeKind::Deferred(d)) => queue.extend(d.inputs.iter().copied()),
                _ => {}
            }
            self.mark_stale(slot);
        }
    }

    // ----- notification ------------------------------------------------

    /// Register a user callback; fires in registration order relative to
    /// other listeners on the same node.
    pub fn listen(
        &mut self,
        slot: SlotId,
        callback: impl Fn(&mut Engine, &Value) -> Result<()> + 'static,
    ) -> Result<ListenerId> {
        let id = Ulid::new();
        let node = self.arena.get_mut(slot).ok_or_else(|| {
            EngineError::InternalConsistency(format!("listen on a stale node handle {slot:?}"))
        })?;
        node.listeners.push(ListenerEntry {
            id,
            listener: Listener::Callback(Rc::new(callback)),
        });
        Ok(id)
    }

    /// Wire `dependent` to be marked stale and re-notified whenever
    /// `source` changes. Idempotent per (source, dependent) pair.
    pub fn listen_dependent(&mut self, source: SlotId, dependent: SlotId) -> Result<ListenerId> {
        let node = self.arena.get_mut(source).ok_or_else(|| {
            EngineError::InternalConsistency(format!("listen on a stale node handle {source:?}"))
        })?;
        for entry in &node.listeners {
            if let Listener::Dependent(existing) = entry.listener {
                if existing == dependent {
                    return Ok(entry.id);
                }
            }
        }
        let id = Ulid::new();
        node.listeners.push(ListenerEntry {
            id,
            listener: Listener::Dependent(dependent),
        });
        Ok(id)
    }

    /// Remove a listener by id. Returns whether anything was removed.
    pub fn cancel(&mut self, slot: SlotId, id: ListenerId) -> bool {
        match self.arena.get_mut(slot) {
            Some(node) => {
                let before = node.listeners.len();
                node.listeners.retain(|entry| entry.id != id);
                node.listeners.len() != before
            }
            None => false,
        }
    }

    /// Fan out a change on `slot`: dependents are marked stale and
    /// re-notified, callbacks receive the freshly fixed value. A recursive
    /// notification loop is an internal error, never an infinite loop.
    pub fn notify(&mut self, slot: SlotId) -> Result<()> {
        if self.notify_stack.contains(&slot) {
            return Err(EngineError::InternalConsistency(format!(
                "recursive notification for node {slot:?}"
            )));
        }
        self.notify_stack.push(slot);
        let result = self.notify_inner(slot);
        self.notify_stack.pop();
        result
    }

    fn notify_inner(&mut self, slot: SlotId) -> Result<()> {
        let entries: Vec<ListenerEntry> = match self.arena.get(slot) {
            Some(node) => node.listeners.clone(),
            None => return Ok(()),
        };
        if entries.is_empty() {
            return Ok(());
        }
        debug!(?slot, listeners = entries.len(), "notifying");
        // Callbacks get the resolved value, never an unresolved handle; a
        // reference node's compute yields a handle at depth 1.
        let value = self.fix_deep(slot)?;
        for entry in entries {
            match entry.listener {
                Listener::Dependent(dependent) => {
                    if self.arena.is_valid(dependent) {
                        self.mark_stale(dependent);
                        self.notify(dependent)?;
                    }
                }
                Listener::Callback(callback) => callback(self, &value)?,
            }
        }
        Ok(())
    }

    // ----- variables ---------------------------------------------------

    /// Build a deferred node that resolves a variable reference at fix
    /// time, against the node's birth scope for named bindings and the
    /// active stack for parameters. On first resolution the node
    /// subscribes itself to the binding's cell, making every use site
    /// reactive.
    pub fn variable_node(&mut self, name: &str, numeric: bool, source: SourceRef) -> SlotId {
        let birth = self.current_scope();
        let pure_ctx = self.in_pure_context();
        let name: Arc<str> = Arc::from(name);
        let node_source = source.clone();
        self.alloc_deferred_cyclic(
            &format!("variable:{name}"),
            node_source,
            &[],
            true,
            move |self_slot| {
                Rc::new(move |engine: &mut Engine| {
                    let cell =
                        engine.resolve_variable(birth, &name, numeric, pure_ctx, &source)?;
                    engine.listen_dependent(cell, self_slot)?;
                    Ok(Computed::Node(cell))
                })
            },
        )
    }

    /// Resolve a reference to the slot behind it. Numeric references only
    /// consult positional parameters; named references try parameters on
    /// the active stack first (`it`, `previous`), then the lexical chain.
    pub fn resolve_variable(
        &self,
        birth: ScopeId,
        name: &str,
        numeric: bool,
        pure_ctx: bool,
        source: &SourceRef,
    ) -> Result<SlotId> {
        if numeric {
            let index: u32 = name.parse().map_err(|_| EngineError::Script {
                message: format!("numeric reference '{name}' is not a positional index"),
                at: source.clone(),
            })?;
            for scope_id in self.stack.iter().rev() {
                if let Some(slot) = self.scopes.frame(*scope_id).parameter(&VarKey::Positional(index))
                {
                    return Ok(slot);
                }
            }
            return Err(EngineError::VariableNotFound {
                name: name.to_owned(),
                at: source.clone(),
            });
        }
        let key = VarKey::named(name);
        for scope_id in self.stack.iter().rev() {
            if let Some(slot) = self.scopes.frame(*scope_id).parameter(&key) {
                trace!(%name, scope = %self.scopes.frame(*scope_id).label, "resolved parameter");
                return Ok(slot);
            }
        }
        let mut cursor = Some(birth);
        while let Some(scope_id) = cursor {
            let frame = self.scopes.frame(scope_id);
            if let Some(binding) = frame.binding(name) {
                if pure_ctx && !frame.pure && !(binding.flags.pure && binding.flags.constant) {
                    return Err(EngineError::PurityViolation {
                        message: format!(
                            "pure expression cannot read impure variable '{name}' (declare it pure and constant)"
                        ),
                        at: source.clone(),
                    });
                }
                trace!(%name, scope = %frame.label, "resolved binding");
                return Ok(binding.cell);
            }
            cursor = frame.parent;
        }
        Err(EngineError::VariableNotFound {
            name: name.to_owned(),
            at: source.clone(),
        })
    }

    /// Declare a binding in the current scope. The binding's cell stays
    /// lazy (it forwards to the declared node) so later reads pull through
    /// the live graph; the constraint, if any, is checked against the
    /// deep-fixed candidate first.
    pub fn declare(
        &mut self,
        name: &str,
        rhs: SlotId,
        constraint: Option<(SlotId, Arc<str>)>,
        mut flags: VarFlags,
        source: &SourceRef,
    ) -> Result<SlotId> {
        let scope_id = self.current_scope();
        if self.scopes.frame(scope_id).has_binding(name) {
            return Err(EngineError::Script {
                message: format!(
                    "variable '{name}' is already declared in scope '{}'",
                    self.scopes.frame(scope_id).label
                ),
                at: source.clone(),
            });
        }
        // Declarations inside a pure scope are implicitly pure.
        if self.scopes.frame(scope_id).pure {
            flags.pure = true;
        }
        if let Some((constraint_slot, label)) = &constraint {
            let candidate = self.fix_deep(rhs)?;
            self.check_constraint(*constraint_slot, label, name, &candidate, None, source)?;
        }
        let cell = self.alloc_concrete(Value::Node(rhs));
        self.listen_dependent(rhs, cell)?;
        debug!(%name, ?cell, constant = flags.constant, "declared");
        self.scopes.frame_mut(scope_id).insert_binding(
            Arc::from(name),
            Binding {
                cell,
                constraint: constraint.as_ref().map(|(slot, _)| *slot),
                constraint_label: constraint.map(|(_, label)| label),
                flags,
            },
        );
        Ok(cell)
    }

    /// Reassign the nearest declaring binding. Eager: the right-hand side
    /// is deep-fixed before the constraint runs, and the old value stays in
    /// place on any failure.
    pub fn assign(
        &mut self,
        name: &str,
        rhs: SlotId,
        constraint_label: Option<&str>,
        source: &SourceRef,
    ) -> Result<SlotId> {
        let owner = self
            .scopes
            .scope_for_key(self.current_scope(), name)
            .ok_or_else(|| EngineError::VariableNotFound {
                name: name.to_owned(),
                at: source.clone(),
            })?;
        if self.in_pure_context() {
            return Err(EngineError::PurityViolation {
                message: format!("cannot modify variable '{name}' in a pure expression"),
                at: source.clone(),
            });
        }
        let binding = self
            .scopes
            .frame(owner)
            .binding(name)
            .cloned()
            .ok_or_else(|| {
                EngineError::InternalConsistency(format!(
                    "binding '{name}' vanished from its declaring scope"
                ))
            })?;
        if binding.flags.constant {
            return Err(EngineError::BindingImmutable {
                name: name.to_owned(),
            });
        }
        // The constraint is part of the declaration; swapping it on
        // reassignment is rejected.
        if let (Some(new_label), Some(existing)) = (constraint_label, &binding.constraint_label) {
            if existing.as_ref() != new_label {
                return Err(EngineError::Script {
                    message: format!("cannot change the constraint on variable '{name}'"),
                    at: source.clone(),
                });
            }
        }
        let candidate = self.fix_deep(rhs)?;
        if let Some(constraint_slot) = binding.constraint {
            let previous = self.fix_deep(binding.cell)?;
            let label = binding
                .constraint_label
                .clone()
                .unwrap_or_else(|| Arc::from("constraint"));
            self.check_constraint(
                constraint_slot,
                &label,
                name,
                &candidate,
                Some(&previous),
                source,
            )?;
        }
        debug!(%name, value = %candidate, "assigned");
        if let Some(node) = self.arena.get_mut(binding.cell) {
            node.kind = NodeKind::Concrete(candidate);
        }
        self.notify(binding.cell)?;
        Ok(binding.cell)
    }

    /// Run a constraint against a candidate in a short-lived child scope
    /// binding `it` (and `previous` when a prior value exists).
    pub fn check_constraint(
        &mut self,
        constraint: SlotId,
        label: &Arc<str>,
        name: &str,
        candidate: &Value,
        previous: Option<&Value>,
        source: &SourceRef,
    ) -> Result<()> {
        let check_scope = self.push_scope(self.in_pure_context(), "constraint")?;
        let it_slot = self.alloc_concrete(candidate.clone());
        self.scopes
            .frame_mut(check_scope)
            .set_parameter(VarKey::named("it"), it_slot);
        // `previous` is void at declaration, the outgoing value afterwards.
        let prev_slot = self.alloc_concrete(previous.cloned().unwrap_or(Value::Void));
        self.scopes
            .frame_mut(check_scope)
            .set_parameter(VarKey::named("previous"), prev_slot);
        // The constraint graph memoized the last candidate; force a rerun.
        self.mark_subgraph_stale(constraint);
        let verdict = self.fix_deep(constraint);
        self.pop_scope(check_scope)?;
        let verdict = verdict?;
        trace!(%name, verdict = %verdict, "constraint checked");
        if verdict.is_truthy() {
            Ok(())
        } else {
            Err(EngineError::ConstraintViolation {
                name: name.to_owned(),
                label: label.to_string(),
                at: source.clone(),
            })
        }
    }

    // ----- exports -----------------------------------------------------

    /// Publish a binding's cell under an export name. The consumer-facing
    /// value is resolved when the export table is read, so reassignments
    /// made after the declaration are visible.
    pub fn export(&mut self, name: &str, cell: SlotId) {
        self.exports.insert(Arc::from(name), cell);
    }

    pub fn exports(&self) -> &IndexMap<Arc<str>, SlotId> {
        &self.exports
    }

    // ----- scheduler ---------------------------------------------------

    /// Re-fix and notify `node` every `interval_ms` of virtual time.
    pub fn schedule(&mut self, node: SlotId, interval_ms: u64) -> TaskId {
        self.scheduler.schedule(node, interval_ms)
    }

    /// Suppress every future fire of a scheduled task. An in-flight
    /// recomputation is unaffected.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Advance virtual time, firing due tasks in time order. Each fire
    /// marks the task's node stale, re-fixes it and notifies listeners.
    pub fn advance(&mut self, ms: u64) -> Result<Vec<SlotId>> {
        let target = self.scheduler.now_ms() + ms;
        let mut fired = Vec::new();
        while let Some(task) = self.scheduler.pop_due(target) {
            if !self.arena.is_valid(task.node) {
                self.scheduler.cancel(task.id);
                continue;
            }
            trace!(task = %task.id, at = task.due_ms, "scheduled fire");
            self.mark_stale(task.node);
            self.fix(task.node, 1)?;
            self.notify(task.node)?;
            fired.push(task.node);
        }
        self.scheduler.set_now(target);
        Ok(fired)
    }

    // ----- reclamation -------------------------------------------------

    /// Free every node unreachable from a scope root, an export or a
    /// scheduled task. Returns the number of slots reclaimed.
    pub fn sweep(&mut self) -> usize {
        let mut queue: Vec<SlotId> = Vec::new();
        for frame in self.scopes.frames() {
            for (_, binding) in frame.bindings() {
                queue.push(binding.cell);
                if let Some(constraint) = binding.constraint {
                    queue.push(constraint);
                }
            }
            for (_, slot) in frame.parameters() {
                queue.push(*slot);
            }
        }
        queue.extend(self.exports.values().copied());
        queue.extend(self.scheduler.nodes());

        let mut reachable: HashSet<SlotId> = HashSet::new();
        while let Some(slot) = queue.pop() {
            if !reachable.insert(slot) {
                continue;
            }
            if let Some(node) = self.arena.get(slot) {
                match &node.kind {
                    NodeKind::Concrete(value) => collect_handles(value, &mut queue),
                    NodeKind::Deferred(d) => {
                        queue.extend(d.inputs.iter().copied());
                        if let Some(cached) = &d.cached {
                            collect_handles(cached, &mut queue);
                        }
                    }
                }
            }
        }

        let mut freed = 0;
        for id in self.arena.live_ids() {
            if !reachable.contains(&id) && self.arena.free(id) {
                freed += 1;
            }
        }
        debug!(freed, live = self.arena.live_count(), "sweep complete");
        freed
    }

    pub fn live_nodes(&self) -> usize {
        self.arena.live_count()
    }
}

fn collect_handles(value: &Value, out: &mut Vec<SlotId>) {
    match value {
        Value::Node(slot) => out.push(*slot),
        Value::List(items) => {
            for item in items.iter() {
                collect_handles(item, out);
            }
        }
        Value::Map(entries) => {
            for (_, item) in entries.iter() {
                collect_handles(item, out);
            }
        }
        _ => {}
    }
}
