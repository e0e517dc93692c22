//! Handle table.
//!
//! A fixed-capacity slot table mapping [`Handle`]s to driver objects. Every
//! lookup, allocation and release happens under a single lock; a resolved
//! [`SlotRef`] keeps that lock held until it is dropped or released, so a
//! slot cannot be freed out from under a caller that is still using it.
//!
//! # Staleness
//!
//! Each slot carries a [`Generation`] that is bumped on release. A handle is
//! only accepted while its generation matches the slot's, so a released
//! handle stays invalid even after its slot is reused.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::context::ContextPayload;
use crate::driver::{Driver, DriverPbuffer};
use crate::error::WglError;
use crate::handle::{Generation, Handle, HandleType, MAX_SLOTS};

thread_local! {
    static LOCKS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread currently holds a table lock.
pub(crate) fn lock_held() -> bool {
    LOCKS_HELD.with(|held| held.get() > 0)
}

/// Driver object stored in a slot.
#[derive(Debug)]
pub enum SlotPayload {
    /// Rendering context and its bookkeeping.
    Context(Box<ContextPayload>),
    /// Off-screen pbuffer.
    Pbuffer(DriverPbuffer),
}

/// Contents of an occupied slot.
#[derive(Debug)]
pub struct Entry {
    pub(crate) handle: Handle,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) payload: SlotPayload,
}

impl Entry {
    /// Get the handle this entry was issued under.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Get the driver that owns the stored object.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Get the stored payload.
    pub fn payload(&self) -> &SlotPayload {
        &self.payload
    }

    /// Get the context payload.
    pub fn context(&self) -> Result<&ContextPayload, WglError> {
        match &self.payload {
            SlotPayload::Context(context) => Ok(&**context),
            SlotPayload::Pbuffer(_) => Err(WglError::InvalidHandle),
        }
    }

    /// Get the context payload mutably.
    pub fn context_mut(&mut self) -> Result<&mut ContextPayload, WglError> {
        match &mut self.payload {
            SlotPayload::Context(context) => Ok(&mut **context),
            SlotPayload::Pbuffer(_) => Err(WglError::InvalidHandle),
        }
    }

    /// Get the driver pbuffer.
    pub fn pbuffer(&self) -> Result<DriverPbuffer, WglError> {
        match &self.payload {
            SlotPayload::Pbuffer(pbuffer) => Ok(*pbuffer),
            SlotPayload::Context(_) => Err(WglError::InvalidHandle),
        }
    }
}

enum SlotState {
    Free { next: Option<usize> },
    Occupied(Entry),
}

struct Slot {
    generation: Generation,
    state: SlotState,
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    live: usize,
}

/// Fixed-capacity handle table.
pub struct HandleTable {
    capacity: usize,
    inner: Mutex<TableInner>,
}

impl HandleTable {
    /// Create a table with room for `capacity` live handles.
    ///
    /// The capacity is clamped to `1..=MAX_SLOTS`.
    pub fn new(capacity: usize) -> Self {
        let clamped = capacity.clamp(1, MAX_SLOTS);
        if clamped != capacity {
            log::warn!(
                "HandleTable: capacity {} out of range, using {}",
                capacity,
                clamped
            );
        }
        Self {
            capacity: clamped,
            inner: Mutex::new(TableInner::default()),
        }
    }

    /// Get the table capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire the table lock.
    pub fn lock(&self) -> TableGuard<'_> {
        let inner = self.inner.lock();
        LOCKS_HELD.with(|held| held.set(held.get() + 1));
        TableGuard {
            inner,
            capacity: self.capacity,
        }
    }

    /// Store a new object and return its handle.
    pub fn allocate(
        &self,
        ty: HandleType,
        driver: Arc<dyn Driver>,
        payload: SlotPayload,
    ) -> Result<Handle, WglError> {
        self.lock().allocate(ty, driver, payload)
    }

    /// Resolve a handle, keeping the table locked while the result lives.
    pub fn resolve(&self, handle: Handle, expected: HandleType) -> Result<SlotRef<'_>, WglError> {
        let guard = self.lock();
        let index = guard.find(handle, expected)?;
        Ok(SlotRef { guard, index })
    }

    /// Release a handle and return what it stored.
    pub fn release(&self, handle: Handle, expected: HandleType) -> Result<Entry, WglError> {
        self.lock().release(handle, expected)
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.lock().live_count()
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the handle table.
pub struct TableGuard<'a> {
    inner: MutexGuard<'a, TableInner>,
    capacity: usize,
}

impl TableGuard<'_> {
    /// Store a new object and return its handle.
    pub fn allocate(
        &mut self,
        ty: HandleType,
        driver: Arc<dyn Driver>,
        payload: SlotPayload,
    ) -> Result<Handle, WglError> {
        let inner = &mut *self.inner;
        let index = match inner.free_head {
            Some(index) => index,
            None if inner.slots.len() < self.capacity => {
                inner.slots.push(Slot {
                    generation: Generation::FIRST,
                    state: SlotState::Free { next: None },
                });
                inner.slots.len() - 1
            }
            None => {
                log::warn!("HandleTable: no free slot left ({} in use)", inner.live);
                return Err(WglError::ResourceExhausted {
                    capacity: self.capacity,
                });
            }
        };

        let slot = &mut inner.slots[index];
        let handle = Handle::pack(index, ty, slot.generation);
        let previous = std::mem::replace(
            &mut slot.state,
            SlotState::Occupied(Entry {
                handle,
                driver,
                payload,
            }),
        );
        if let SlotState::Free { next } = previous {
            if inner.free_head == Some(index) {
                inner.free_head = next;
            }
        }
        inner.live += 1;

        log::trace!("HandleTable: allocated {:?}", handle);
        Ok(handle)
    }

    /// Look up a live handle of the expected type.
    pub fn get(&self, handle: Handle, expected: HandleType) -> Result<&Entry, WglError> {
        let index = self.find(handle, expected)?;
        Ok(self.entry_at(index))
    }

    /// Look up a live handle of the expected type mutably.
    pub fn get_mut(&mut self, handle: Handle, expected: HandleType) -> Result<&mut Entry, WglError> {
        let index = self.find(handle, expected)?;
        Ok(self.entry_at_mut(index))
    }

    /// Release a handle and return what it stored.
    ///
    /// The slot's generation is bumped so the handle never resolves again.
    pub fn release(&mut self, handle: Handle, expected: HandleType) -> Result<Entry, WglError> {
        let index = self.find(handle, expected)?;
        Ok(self.release_index(index))
    }

    /// Release every live handle, returning the stored entries.
    pub fn drain(&mut self) -> Vec<Entry> {
        let occupied: Vec<usize> = self
            .inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Occupied(_)))
            .map(|(index, _)| index)
            .collect();
        occupied
            .into_iter()
            .map(|index| self.release_index(index))
            .collect()
    }

    /// Get all live handles in slot order.
    pub fn live_handles(&self) -> Vec<Handle> {
        self.inner
            .slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Occupied(entry) => Some(entry.handle),
                SlotState::Free { .. } => None,
            })
            .collect()
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.inner.live
    }

    /// Get the table capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn find(&self, handle: Handle, expected: HandleType) -> Result<usize, WglError> {
        let index = handle.index();
        let type_ok = handle
            .handle_type()
            .is_some_and(|ty| ty.satisfies(expected));
        match self.inner.slots.get(index).map(|slot| &slot.state) {
            Some(SlotState::Occupied(entry)) if type_ok && entry.handle == handle => Ok(index),
            _ => Err(WglError::InvalidHandle),
        }
    }

    fn entry_at(&self, index: usize) -> &Entry {
        match &self.inner.slots[index].state {
            SlotState::Occupied(entry) => entry,
            SlotState::Free { .. } => unreachable!("resolved slot {index} is free"),
        }
    }

    fn entry_at_mut(&mut self, index: usize) -> &mut Entry {
        match &mut self.inner.slots[index].state {
            SlotState::Occupied(entry) => entry,
            SlotState::Free { .. } => unreachable!("resolved slot {index} is free"),
        }
    }

    fn release_index(&mut self, index: usize) -> Entry {
        let inner = &mut *self.inner;
        let slot = &mut inner.slots[index];
        let previous = std::mem::replace(
            &mut slot.state,
            SlotState::Free {
                next: inner.free_head,
            },
        );
        slot.generation = slot.generation.next();
        inner.free_head = Some(index);
        inner.live -= 1;

        match previous {
            SlotState::Occupied(entry) => {
                log::trace!("HandleTable: released {:?}", entry.handle);
                entry
            }
            SlotState::Free { .. } => unreachable!("released slot {index} was free"),
        }
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

/// A resolved handle that keeps the table locked.
pub struct SlotRef<'a> {
    guard: TableGuard<'a>,
    index: usize,
}

impl SlotRef<'_> {
    /// Release the handle and return what it stored.
    pub fn release(mut self) -> Entry {
        self.guard.release_index(self.index)
    }
}

impl Deref for SlotRef<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        self.guard.entry_at(self.index)
    }
}

impl DerefMut for SlotRef<'_> {
    fn deref_mut(&mut self) -> &mut Entry {
        self.guard.entry_at_mut(self.index)
    }
}
