use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::arena::SlotId;

/// Handle to a scope frame. Frames are never removed from the store while
/// the engine lives; popped frames stay addressable because deferred nodes
/// capture their birth scope and may resolve after the block has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

/// Key into a frame's parameter namespace. Positional parameters serve
/// numeric references; named parameters carry the implicit constraint
/// bindings (`it`, `previous`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarKey {
    Named(Arc<str>),
    Positional(u32),
}

impl VarKey {
    pub fn named(name: &str) -> Self {
        VarKey::Named(Arc::from(name))
    }
}

/// Declaration flags. `pure` marks a binding readable from pure scopes;
/// `volatile` marks it as externally mutated, so it is never treated as a
/// constant fold candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarFlags {
    pub constant: bool,
    pub volatile: bool,
    pub pure: bool,
}

/// A named binding: the stable cell node listeners hang off, plus the
/// constraint wiring fixed at declaration time.
#[derive(Debug, Clone)]
pub struct Binding {
    pub cell: SlotId,
    pub constraint: Option<SlotId>,
    pub constraint_label: Option<Arc<str>>,
    pub flags: VarFlags,
}

#[derive(Debug)]
pub struct ScopeFrame {
    pub id: ScopeId,
    pub label: Arc<str>,
    pub parent: Option<ScopeId>,
    pub pure: bool,
    bindings: IndexMap<Arc<str>, Binding>,
    parameters: IndexMap<VarKey, SlotId>,
}

impl ScopeFrame {
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn binding_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.bindings.get_mut(name)
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn insert_binding(&mut self, name: Arc<str>, binding: Binding) {
        self.bindings.insert(name, binding);
    }

    pub fn parameter(&self, key: &VarKey) -> Option<SlotId> {
        self.parameters.get(key).copied()
    }

    pub fn set_parameter(&mut self, key: VarKey, slot: SlotId) {
        self.parameters.insert(key, slot);
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&Arc<str>, &Binding)> {
        self.bindings.iter()
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&VarKey, &SlotId)> {
        self.parameters.iter()
    }
}

/// Id-indexed store of every scope frame the engine has created.
#[derive(Default)]
pub struct ScopeStore {
    frames: Vec<ScopeFrame>,
}

impl ScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self, parent: Option<ScopeId>, pure: bool, label: &str) -> ScopeId {
        let id = ScopeId(self.frames.len() as u32);
        trace!(scope = %label, ?id, pure, "creating scope frame");
        self.frames.push(ScopeFrame {
            id,
            label: Arc::from(label),
            parent,
            pure,
            bindings: IndexMap::new(),
            parameters: IndexMap::new(),
        });
        id
    }

    pub fn frame(&self, id: ScopeId) -> &ScopeFrame {
        &self.frames[id.0 as usize]
    }

    pub fn frame_mut(&mut self, id: ScopeId) -> &mut ScopeFrame {
        &mut self.frames[id.0 as usize]
    }

    /// Nearest frame on the lexical chain, starting at `from`, that
    /// declares `name`.
    pub fn scope_for_key(&self, from: ScopeId, name: &str) -> Option<ScopeId> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let frame = self.frame(id);
            if frame.has_binding(name) {
                return Some(id);
            }
            cursor = frame.parent;
        }
        None
    }

    pub fn frames(&self) -> impl Iterator<Item = &ScopeFrame> {
        self.frames.iter()
    }
}
