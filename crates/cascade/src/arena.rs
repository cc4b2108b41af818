use serde::{Deserialize, Serialize};

use crate::node::NodeSlot;

/// Stable handle into the node arena. Generation counters make stale
/// handles detectable after a slot has been freed and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

struct Slot {
    generation: u32,
    node: Option<NodeSlot>,
}

/// Generational arena owning every value node in an engine.
///
/// Nodes reference each other by `SlotId`, never by owning pointers, so
/// cyclic graphs (self-referential bindings) need no reference counting.
/// Reclamation happens through `Engine::sweep`, which frees slots
/// unreachable from any scope root.
#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: NodeSlot) -> SlotId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            SlotId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            SlotId {
                index,
                generation: 0,
            }
        }
    }

    /// Free a slot, bumping its generation so outstanding handles go stale.
    /// Returns false if the handle was already stale.
    pub fn free(&mut self, id: SlotId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.node.is_some() => {
                slot.node = None;
                slot.generation += 1;
                self.free.push(id.index);
                true
            }
            _ => false,
        }
    }

    pub fn is_valid(&self, id: SlotId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.node.is_some())
    }

    pub fn get(&self, id: SlotId) -> Option<&NodeSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut NodeSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Handles of every live slot, in index order.
    pub fn live_ids(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(index, slot)| SlotId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn alloc_and_get() {
        let mut arena = Arena::new();
        let id = arena.alloc(NodeSlot::concrete(Value::Int(7)));
        assert!(arena.is_valid(id));
        assert_eq!(arena.live_count(), 1);
        assert!(arena.get(id).is_some());
    }

    #[test]
    fn free_invalidates_handle() {
        let mut arena = Arena::new();
        let id = arena.alloc(NodeSlot::concrete(Value::Int(1)));
        assert!(arena.free(id));
        assert!(!arena.is_valid(id));
        assert!(arena.get(id).is_none());
        assert!(!arena.free(id));
    }

    #[test]
    fn reuse_bumps_generation() {
        let mut arena = Arena::new();
        let first = arena.alloc(NodeSlot::concrete(Value::Int(1)));
        arena.free(first);
        let second = arena.alloc(NodeSlot::concrete(Value::Int(2)));
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert!(!arena.is_valid(first));
        assert!(arena.is_valid(second));
    }
}
