//! Reference-counted arena of state generations.
//!
//! Every generation lives in one [`StateArena`] slot keyed by its
//! [`GenerationId`]. Holders get a [`GenerationRef`]: cloning it reserves the
//! generation, dropping it releases the reservation, and the slot is reclaimed
//! when the count reaches zero.
//!
//! Lock order: a generation's `RwLock` may be held while the arena mutex is
//! taken, never the other way round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::trace;

use crate::{AppState, DualState, Generation, GenerationId, StateError};

struct Slot {
    cell: Arc<RwLock<Generation>>,
    refs: usize,
}

#[derive(Default)]
struct ArenaInner {
    next_id: AtomicU64,
    slots: Mutex<HashMap<GenerationId, Slot>>,
}

/// Owner of every live generation of one pipeline.
#[derive(Clone, Default)]
pub struct StateArena {
    inner: Arc<ArenaInner>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initial generation.
    pub fn create(&self, app: AppState, dual: DualState) -> GenerationRef {
        let id = self.next_id();
        self.insert(Generation::new(id, app, dual))
    }

    /// A mutable copy of `source`, which may belong to another arena.
    pub fn copy_from(&self, source: &GenerationRef) -> GenerationRef {
        let copy = source.read().copy_as(self.next_id());
        self.insert(copy)
    }

    /// Ids of every generation still reserved by someone, ascending.
    pub fn live_generations(&self) -> Vec<GenerationId> {
        let mut ids: Vec<_> = self.inner.slots.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Outstanding reservations on `id`; 0 once it has been reclaimed.
    pub fn ref_count(&self, id: GenerationId) -> usize {
        self.inner.slots.lock().get(&id).map_or(0, |slot| slot.refs)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_id(&self) -> GenerationId {
        GenerationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn insert(&self, generation: Generation) -> GenerationRef {
        let id = generation.id();
        let cell = Arc::new(RwLock::new(generation));
        self.inner.slots.lock().insert(
            id,
            Slot {
                cell: Arc::clone(&cell),
                refs: 1,
            },
        );
        trace!(generation = %id, "generation created");
        GenerationRef {
            id,
            cell,
            arena: self.clone(),
        }
    }

    fn reserve(&self, id: GenerationId) {
        if let Some(slot) = self.inner.slots.lock().get_mut(&id) {
            slot.refs += 1;
        }
    }

    fn release(&self, id: GenerationId) {
        let reclaimed = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&id) {
                Some(slot) if slot.refs > 1 => {
                    slot.refs -= 1;
                    None
                }
                Some(_) => slots.remove(&id),
                None => None,
            }
        };
        // the generation (and the application state in it) is dropped outside
        // the arena mutex
        if let Some(slot) = reclaimed {
            trace!(generation = %id, "generation reclaimed");
            drop(slot);
        }
    }
}

/// A counted reservation of one generation.
pub struct GenerationRef {
    id: GenerationId,
    cell: Arc<RwLock<Generation>>,
    arena: StateArena,
}

impl GenerationRef {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// Shared read access. Blocks while a writer holds the generation.
    pub fn read(&self) -> RwLockReadGuard<'_, Generation> {
        self.cell.read()
    }

    pub fn is_immutable(&self) -> bool {
        self.cell.read().is_immutable()
    }

    /// Run `f` with exclusive access. Fails without calling `f` when the
    /// generation has been marked immutable.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Generation) -> R) -> Result<R, StateError> {
        let mut generation = self.cell.write();
        if generation.is_immutable() {
            return Err(StateError::IllegalMutation {
                generation: self.id,
            });
        }
        Ok(f(&mut *generation))
    }

    /// Mark this generation read-only and return a new mutable copy of it.
    /// The two steps happen under one write lock, so no write can land
    /// between them.
    pub fn fast_copy(&self) -> GenerationRef {
        let mut generation = self.cell.write();
        generation.mark_immutable();
        let copy = generation.copy_as(self.arena.next_id());
        self.arena.insert(copy)
    }

    /// A mutable copy; this generation is left as it is.
    pub fn duplicate(&self) -> GenerationRef {
        self.arena.copy_from(self)
    }

    /// Mark this generation read-only without copying it.
    pub fn make_immutable(&self) {
        self.cell.write().mark_immutable();
    }

    pub fn arena(&self) -> &StateArena {
        &self.arena
    }
}

impl Clone for GenerationRef {
    fn clone(&self) -> Self {
        self.arena.reserve(self.id);
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
            arena: self.arena.clone(),
        }
    }
}

impl Drop for GenerationRef {
    fn drop(&mut self) {
        self.arena.release(self.id);
    }
}

impl std::fmt::Debug for GenerationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRef").field("id", &self.id).finish()
    }
}
