//! Registry of open cursors, keyed by generational handles.

use super::cursor::CursorPosition;
use parking_lot::Mutex;
use std::sync::Arc;

/// Stable identity of an open cursor.
///
/// A slot is reused after its cursor closes; the generation keeps a stale
/// handle from reaching the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    position: Option<Arc<Mutex<CursorPosition>>>,
}

/// Slot map of the positions of every live cursor on one index.
#[derive(Default)]
pub(crate) struct CursorRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl CursorRegistry {
    pub(crate) fn register(&mut self, position: Arc<Mutex<CursorPosition>>) -> CursorHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.position = Some(position);
            return CursorHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            position: Some(position),
        });
        CursorHandle {
            index,
            generation: 0,
        }
    }

    /// Drops a cursor. Stale handles are ignored.
    pub(crate) fn unregister(&mut self, handle: CursorHandle) -> Option<Arc<Mutex<CursorPosition>>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let position = slot.position.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(position)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, handle: CursorHandle) -> Option<&Arc<Mutex<CursorPosition>>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.position.as_ref()
    }

    /// Live cursors with their handles.
    pub(crate) fn iter_live(
        &self,
    ) -> impl Iterator<Item = (CursorHandle, &Arc<Mutex<CursorPosition>>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.position.as_ref().map(|position| {
                (
                    CursorHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    position,
                )
            })
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}
