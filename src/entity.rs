// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity handles and the slot table.
//!
//! The entity manager is the sole owner of slot state. Pools never touch it;
//! they return result slices that the pool manager applies here.

use crate::error::{EcsError, Result};
use crate::pool::{EntityLocation, PoolTag};

/// Entity handle. Two handles are equal iff index and generation both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    pub index: u32,
    pub generation: u32,
}

/// Per-entity record: where the entity lives and what state it is in.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySlot {
    pub index: u32,
    pub generation: u32,
    pub pool_tag: PoolTag,
    pub mask_list_index: u32,
    pub storage_index: u32,
    pub is_migrating: bool,
    pub is_pending_create: bool,
    pub is_pending_destroy: bool,
}

impl EntitySlot {
    pub fn handle(&self) -> EntityHandle {
        EntityHandle {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn location(&self) -> EntityLocation {
        EntityLocation {
            mask_list_index: self.mask_list_index,
            storage_index: self.storage_index,
        }
    }
}

/// Slot table with free-list reuse. A released slot keeps its index and gets
/// a new generation, so prior handles go stale.
#[derive(Default)]
pub struct EntityManager {
    slots: Vec<EntitySlot>,
    free_list: Vec<u32>,
    live: usize,
}

impl EntityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat a slot for an entity that already has storage.
    pub fn new_slot(&mut self, pool_tag: PoolTag, location: EntityLocation) -> EntityHandle {
        let handle = self.acquire(pool_tag);
        let slot = &mut self.slots[handle.index as usize];
        slot.mask_list_index = location.mask_list_index;
        slot.storage_index = location.storage_index;
        handle
    }

    /// Seat a slot for an entity whose creation is deferred. Storage fields
    /// stay unset until `finalize`.
    pub fn new_pending_slot(&mut self, pool_tag: PoolTag) -> EntityHandle {
        let handle = self.acquire(pool_tag);
        let slot = &mut self.slots[handle.index as usize];
        slot.is_pending_create = true;
        handle
    }

    /// Clear the pending-create flag and record the entity's storage.
    pub fn finalize(&mut self, handle: EntityHandle, location: EntityLocation) -> Result<()> {
        let slot = self.get_unchecked_mut(handle)?;
        slot.is_pending_create = false;
        slot.mask_list_index = location.mask_list_index;
        slot.storage_index = location.storage_index;
        Ok(())
    }

    /// Strict lookup: fails on stale handles and on either pending state.
    pub fn get(&self, handle: EntityHandle) -> Result<&EntitySlot> {
        let slot = self.slot_for(handle)?;
        if slot.is_pending_create {
            return Err(EcsError::EntityPendingCreate);
        }
        if slot.is_pending_destroy {
            return Err(EcsError::EntityPendingDestroy);
        }
        Ok(slot)
    }

    /// Lookup tolerating pending-destroy: a destroyed-but-not-flushed entity
    /// still resolves to its storage until the next flush.
    pub fn resolve(&self, handle: EntityHandle) -> Result<&EntitySlot> {
        let slot = self.slot_for(handle)?;
        if slot.is_pending_create {
            return Err(EcsError::EntityPendingCreate);
        }
        Ok(slot)
    }

    /// Generation check only; used by flushers that must address slots in
    /// any pending state.
    pub fn get_unchecked(&self, handle: EntityHandle) -> Result<&EntitySlot> {
        self.slot_for(handle)
    }

    pub fn get_unchecked_mut(&mut self, handle: EntityHandle) -> Result<&mut EntitySlot> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(EcsError::StaleEntity)?;
        if slot.generation != handle.generation {
            return Err(EcsError::StaleEntity);
        }
        Ok(slot)
    }

    /// Release a slot: bump the generation, clear all flags, push the index
    /// to the free list. Any prior handle fails `get` afterwards.
    pub fn release(&mut self, handle: EntityHandle) -> Result<()> {
        let slot = self.get_unchecked_mut(handle)?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.is_migrating = false;
        slot.is_pending_create = false;
        slot.is_pending_destroy = false;
        slot.mask_list_index = u32::MAX;
        slot.storage_index = u32::MAX;
        let index = slot.index;
        self.free_list.push(index);
        self.live -= 1;
        Ok(())
    }

    /// Number of live (seated) slots, pending ones included.
    pub fn live_count(&self) -> usize {
        self.live
    }

    fn acquire(&mut self, pool_tag: PoolTag) -> EntityHandle {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.pool_tag = pool_tag;
            slot.mask_list_index = u32::MAX;
            slot.storage_index = u32::MAX;
            slot.is_migrating = false;
            slot.is_pending_create = false;
            slot.is_pending_destroy = false;
            return slot.handle();
        }
        let index = self.slots.len() as u32;
        self.slots.push(EntitySlot {
            index,
            generation: 0,
            pool_tag,
            mask_list_index: u32::MAX,
            storage_index: u32::MAX,
            is_migrating: false,
            is_pending_create: false,
            is_pending_destroy: false,
        });
        EntityHandle {
            index,
            generation: 0,
        }
    }

    fn slot_for(&self, handle: EntityHandle) -> Result<&EntitySlot> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(EcsError::StaleEntity)?;
        if slot.generation != handle.generation {
            return Err(EcsError::StaleEntity);
        }
        Ok(slot)
    }
}
