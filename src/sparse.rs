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

//! Sparse-set pool: one flat set of SoA columns with optional slots.
//!
//! An entity's storage index is stable from creation to destruction.
//! Virtual archetypes exist only as `(mask, member-index-list)` pairs;
//! component changes move membership entries, never component data.

use ahash::AHashMap;
use tracing::debug;

use crate::builder::EntityBuilder;
use crate::column::ComponentColumn;
use crate::component::{ComponentInfo, ComponentKind, ComponentValue};
use crate::entity::EntityHandle;
use crate::error::{EcsError, Result};
use crate::mask::{self, Mask};
use crate::pool::{
    resolve_migration, validate_builder, validate_change, EntityLocation, EntityOpQueue,
    EntityOpResult, MigrationDirection, MigrationOp, MigrationQueue, MigrationResult, OpKind,
    PoolSpec, PoolTag,
};

const FREE: u32 = u32::MAX;

/// Membership record for one storage slot.
#[derive(Clone, Copy)]
struct SlotRecord {
    mask_list_index: u32,
    in_list_index: u32,
}

/// Flat SoA storage engine with virtual-archetype grouping.
pub struct SparseSetPool {
    tag: PoolTag,
    name: &'static str,
    required: Mask,
    pool_mask: Mask,
    infos: Vec<ComponentInfo>,
    /// One column per kind in `pool_mask`, ascending kind order; a kind's
    /// column index is its rank within `pool_mask`.
    columns: Vec<ComponentColumn>,
    entities: Vec<EntityHandle>,
    slot_map: Vec<SlotRecord>,
    mask_list: Vec<Mask>,
    members: Vec<Vec<u32>>,
    mask_index: AHashMap<Mask, u32>,
    free_list: Vec<u32>,
    migrations: MigrationQueue,
    entity_ops: EntityOpQueue,
    new_archetypes: Vec<u32>,
    reallocated: Vec<u32>,
}

impl SparseSetPool {
    pub fn new(tag: PoolTag, spec: &PoolSpec, infos: Vec<ComponentInfo>) -> Self {
        let pool_mask = spec.pool_mask();
        let columns = mask::kinds(pool_mask)
            .map(|kind| ComponentColumn::for_info(&infos[kind.index()]))
            .collect();
        Self {
            tag,
            name: spec.name,
            required: spec.required,
            pool_mask,
            infos,
            columns,
            entities: Vec::new(),
            slot_map: Vec::new(),
            mask_list: Vec::new(),
            members: Vec::new(),
            mask_index: AHashMap::new(),
            free_list: Vec::new(),
            migrations: MigrationQueue::default(),
            entity_ops: EntityOpQueue::default(),
            new_archetypes: Vec::new(),
            reallocated: Vec::new(),
        }
    }

    pub fn tag(&self) -> PoolTag {
        self.tag
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn required_mask(&self) -> Mask {
        self.required
    }

    pub fn pool_mask(&self) -> Mask {
        self.pool_mask
    }

    pub fn migrations(&self) -> &MigrationQueue {
        &self.migrations
    }

    pub fn mask_list_len(&self) -> usize {
        self.mask_list.len()
    }

    pub fn mask_at(&self, mask_list_index: u32) -> Result<Mask> {
        self.mask_list
            .get(mask_list_index as usize)
            .copied()
            .ok_or(EcsError::ArchetypeDoesNotExist)
    }

    pub fn members_of(&self, mask_list_index: u32) -> Result<&[u32]> {
        self.members
            .get(mask_list_index as usize)
            .map(Vec::as_slice)
            .ok_or(EcsError::ArchetypeDoesNotExist)
    }

    pub fn handle_at(&self, storage_index: u32) -> Option<EntityHandle> {
        let record = self.slot_map.get(storage_index as usize)?;
        if record.mask_list_index == FREE {
            return None;
        }
        self.entities.get(storage_index as usize).copied()
    }

    pub fn column(&self, kind: ComponentKind) -> Option<&ComponentColumn> {
        if !mask::has(self.pool_mask, kind) {
            return None;
        }
        self.columns.get(mask::rank(self.pool_mask, kind))
    }

    pub fn live_entity_count(&self) -> usize {
        self.entities.len() - self.free_list.len()
    }

    pub fn new_archetypes(&self) -> &[u32] {
        &self.new_archetypes
    }

    pub fn reallocated_archetypes(&self) -> &[u32] {
        &self.reallocated
    }

    pub fn clear_epoch_lists(&mut self) {
        self.new_archetypes.clear();
        self.reallocated.clear();
    }

    /// Immediate insertion. Pops the free list or extends the flat arrays.
    pub fn add_entity(
        &mut self,
        entity: EntityHandle,
        builder: EntityBuilder,
    ) -> Result<EntityLocation> {
        validate_builder(&builder, self.required, self.pool_mask, &self.infos)?;
        let bmask = builder.mask();
        let index = self.acquire_slot(entity);

        for value in builder.into_components() {
            let kind = value.kind();
            let rank = mask::rank(self.pool_mask, kind);
            let col = &mut self.columns[rank];
            // SAFETY: slot is fresh and the value's type was checked in
            // validate_builder.
            unsafe { value.write_to(col.ptr_mut(index as usize)) };
        }

        let mli = self.list_for(bmask);
        self.attach_member(index, mli);
        self.mark_reallocated(mli);
        Ok(EntityLocation {
            mask_list_index: mli,
            storage_index: index,
        })
    }

    /// Immediate removal. Clears every slot at the storage index and pushes
    /// it to the free list; other entities never move.
    pub fn remove_entity(
        &mut self,
        location: EntityLocation,
        expected: PoolTag,
    ) -> Result<Option<(EntityHandle, EntityLocation)>> {
        if expected != self.tag {
            return Err(EcsError::EntityPoolMismatch);
        }
        self.remove_at(location)?;
        Ok(None)
    }

    pub fn queue_create(&mut self, entity: EntityHandle, builder: EntityBuilder) -> Result<()> {
        validate_builder(&builder, self.required, self.pool_mask, &self.infos)?;
        self.entity_ops.queue_create(entity, builder);
        Ok(())
    }

    pub fn queue_destroy(&mut self, entity: EntityHandle, location: EntityLocation) -> bool {
        self.migrations.cancel(entity);
        self.entity_ops.queue_destroy(entity, location)
    }

    pub fn queue_component_change(
        &mut self,
        entity: EntityHandle,
        location: EntityLocation,
        direction: MigrationDirection,
        kind: ComponentKind,
        data: Option<ComponentValue>,
    ) -> Result<bool> {
        let current = self.mask_at(location.mask_list_index)?;
        let effective = self.migrations.effective_mask(entity, current);
        validate_change(
            direction,
            kind,
            effective,
            data.as_ref(),
            self.required,
            self.pool_mask,
            &self.infos,
        )?;
        Ok(self.migrations.push(
            entity,
            location,
            MigrationOp {
                direction,
                kind,
                data,
            },
        ))
    }

    pub fn flush_entity_ops(&mut self) -> Result<Vec<EntityOpResult>> {
        let (creates, mut destroys, cancelled) = self.entity_ops.take();
        let mut results = Vec::with_capacity(creates.len() + destroys.len() + cancelled.len());

        for entity in cancelled {
            results.push(EntityOpResult {
                op: OpKind::Destroy,
                entity,
                location: None,
                swapped: None,
            });
        }

        destroys.sort_by(|a, b| b.1.storage_index.cmp(&a.1.storage_index));
        for (entity, location) in destroys {
            self.migrations.cancel(entity);
            self.remove_at(location)?;
            results.push(EntityOpResult {
                op: OpKind::Destroy,
                entity,
                location: Some(location),
                swapped: None,
            });
        }

        for (entity, builder) in creates {
            let location = self.add_entity(entity, builder)?;
            results.push(EntityOpResult {
                op: OpKind::Create,
                entity,
                location: Some(location),
                swapped: None,
            });
        }

        if !results.is_empty() {
            debug!(pool = self.name, ops = results.len(), "flushed entity ops");
        }
        Ok(results)
    }

    /// Apply deferred migrations: resolve the final mask once per entity,
    /// move the membership entry, then write or clear component slots.
    pub fn flush_migrations(&mut self) -> Result<Vec<MigrationResult>> {
        let mut entries = self.migrations.take_entries();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        // Same deterministic order as the archetype engine, though no swap
        // bookkeeping depends on it here.
        entries.sort_by(|a, b| {
            let mask_a = self.mask_list[a.1.location.mask_list_index as usize];
            let mask_b = self.mask_list[b.1.location.mask_list_index as usize];
            mask_a
                .cmp(&mask_b)
                .then(b.1.location.storage_index.cmp(&a.1.location.storage_index))
        });

        let mut results = Vec::with_capacity(entries.len());
        for (entity, entry) in entries {
            let source = entry.location;
            let index = source.storage_index;
            let src_mask = self.mask_at(source.mask_list_index)?;
            let resolved = resolve_migration(src_mask, entry)?;

            // Clear slots the migration vacates (removed or replaced).
            let cleared = (src_mask & !resolved.final_mask) | resolved.rewritten;
            for kind in mask::kinds(cleared) {
                let rank = mask::rank(self.pool_mask, kind);
                self.columns[rank].drop_at(index as usize);
            }
            for (kind, value) in resolved.writes {
                let rank = mask::rank(self.pool_mask, kind);
                let col = &mut self.columns[rank];
                // SAFETY: slot vacated above or never occupied; type checked
                // at queue time.
                unsafe { value.write_to(col.ptr_mut(index as usize)) };
            }

            let location = if resolved.final_mask == src_mask {
                self.mark_reallocated(source.mask_list_index);
                source
            } else {
                let new_mli = self.list_for(resolved.final_mask);
                self.detach_member(index);
                self.attach_member(index, new_mli);
                self.mark_reallocated(source.mask_list_index);
                self.mark_reallocated(new_mli);
                EntityLocation {
                    mask_list_index: new_mli,
                    storage_index: index,
                }
            };

            results.push(MigrationResult {
                entity,
                location,
                swapped: None,
            });
        }

        debug!(
            pool = self.name,
            migrations = results.len(),
            "flushed migrations"
        );
        Ok(results)
    }

    pub fn component_ptr(
        &mut self,
        location: EntityLocation,
        kind: ComponentKind,
    ) -> Result<*mut u8> {
        let mask = self.mask_at(location.mask_list_index)?;
        if !mask::has(mask, kind) {
            return Err(EcsError::ComponentNotPresent);
        }
        let rank = mask::rank(self.pool_mask, kind);
        Ok(self.columns[rank].ptr_mut(location.storage_index as usize))
    }

    pub fn get_component<T: 'static>(
        &mut self,
        location: EntityLocation,
        kind: ComponentKind,
    ) -> Result<&mut T> {
        let mask = self.mask_at(location.mask_list_index)?;
        if !mask::has(mask, kind) {
            return Err(EcsError::ComponentNotPresent);
        }
        let name = self.infos[kind.index()].name;
        let rank = mask::rank(self.pool_mask, kind);
        self.columns[rank]
            .get_mut::<T>(location.storage_index as usize)
            .ok_or_else(|| EcsError::ComponentTypeMismatch(name.to_string()))
    }

    fn acquire_slot(&mut self, entity: EntityHandle) -> u32 {
        if let Some(index) = self.free_list.pop() {
            self.entities[index as usize] = entity;
            return index;
        }
        let index = self.entities.len() as u32;
        self.entities.push(entity);
        self.slot_map.push(SlotRecord {
            mask_list_index: FREE,
            in_list_index: FREE,
        });
        for col in &mut self.columns {
            col.ensure_capacity(index as usize + 1);
        }
        index
    }

    fn remove_at(&mut self, location: EntityLocation) -> Result<()> {
        let mask = self.mask_at(location.mask_list_index)?;
        let index = location.storage_index;
        for kind in mask::kinds(mask) {
            let rank = mask::rank(self.pool_mask, kind);
            self.columns[rank].drop_at(index as usize);
        }
        self.detach_member(index);
        self.slot_map[index as usize] = SlotRecord {
            mask_list_index: FREE,
            in_list_index: FREE,
        };
        self.free_list.push(index);
        self.mark_reallocated(location.mask_list_index);
        Ok(())
    }

    fn list_for(&mut self, mask: Mask) -> u32 {
        if let Some(&index) = self.mask_index.get(&mask) {
            return index;
        }
        let index = self.mask_list.len() as u32;
        self.mask_list.push(mask);
        self.members.push(Vec::new());
        self.mask_index.insert(mask, index);
        self.new_archetypes.push(index);
        index
    }

    fn attach_member(&mut self, storage_index: u32, mask_list_index: u32) {
        let list = &mut self.members[mask_list_index as usize];
        let pos = list.len() as u32;
        list.push(storage_index);
        self.slot_map[storage_index as usize] = SlotRecord {
            mask_list_index,
            in_list_index: pos,
        };
    }

    /// Swap-remove the slot's membership entry, repointing the member that
    /// takes its place in the list. Storage indices are untouched.
    fn detach_member(&mut self, storage_index: u32) {
        let record = self.slot_map[storage_index as usize];
        if record.mask_list_index == FREE {
            return;
        }
        let list = &mut self.members[record.mask_list_index as usize];
        let pos = record.in_list_index as usize;
        list.swap_remove(pos);
        if pos < list.len() {
            let moved = list[pos];
            self.slot_map[moved as usize].in_list_index = pos as u32;
        }
    }

    fn mark_reallocated(&mut self, index: u32) {
        if !self.reallocated.contains(&index) && !self.new_archetypes.contains(&index) {
            self.reallocated.push(index);
        }
    }
}

impl Drop for SparseSetPool {
    fn drop(&mut self) {
        for index in 0..self.slot_map.len() {
            let record = self.slot_map[index];
            if record.mask_list_index == FREE {
                continue;
            }
            let mask = self.mask_list[record.mask_list_index as usize];
            for kind in mask::kinds(mask) {
                let rank = mask::rank(self.pool_mask, kind);
                self.columns[rank].drop_at(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;

    #[derive(Debug, PartialEq, Clone, Copy)]
    struct Pos(f32, f32);
    #[derive(Debug, PartialEq, Clone, Copy)]
    struct Vel(f32, f32);

    struct Fixture {
        pool: SparseSetPool,
        pos: ComponentKind,
        vel: ComponentKind,
    }

    fn fixture() -> Fixture {
        let mut reg = ComponentRegistry::new();
        let pos = reg.register::<Pos>("Pos").unwrap();
        let vel = reg.register::<Vel>("Vel").unwrap();
        let spec = PoolSpec::sparse("projectiles")
            .require(&[pos])
            .allow(&[vel]);
        let pool = SparseSetPool::new(PoolTag(1), &spec, reg.snapshot());
        Fixture { pool, pos, vel }
    }

    fn handle(index: u32) -> EntityHandle {
        EntityHandle {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_storage_index_stable_across_migrations() {
        let mut f = fixture();
        let l1 = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(1.0, 1.0)))
            .unwrap();
        let l2 = f
            .pool
            .add_entity(handle(1), EntityBuilder::new().with(f.pos, Pos(2.0, 2.0)))
            .unwrap();

        f.pool
            .queue_component_change(
                handle(1),
                l2,
                MigrationDirection::Add,
                f.vel,
                Some(ComponentValue::new(f.vel, Vel(0.5, 0.0))),
            )
            .unwrap();
        let results = f.pool.flush_migrations().unwrap();
        assert_eq!(results.len(), 1);
        let moved = results[0].location;
        assert_eq!(moved.storage_index, l2.storage_index);
        assert_ne!(moved.mask_list_index, l2.mask_list_index);
        assert!(results[0].swapped.is_none());

        // The untouched entity keeps its data.
        assert_eq!(
            *f.pool.get_component::<Pos>(l1, f.pos).unwrap(),
            Pos(1.0, 1.0)
        );
        assert_eq!(
            *f.pool.get_component::<Vel>(moved, f.vel).unwrap(),
            Vel(0.5, 0.0)
        );
    }

    #[test]
    fn test_remove_never_swaps() {
        let mut f = fixture();
        let l1 = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(1.0, 0.0)))
            .unwrap();
        let l2 = f
            .pool
            .add_entity(handle(1), EntityBuilder::new().with(f.pos, Pos(2.0, 0.0)))
            .unwrap();

        let swapped = f.pool.remove_entity(l1, PoolTag(1)).unwrap();
        assert!(swapped.is_none());
        assert_eq!(
            *f.pool.get_component::<Pos>(l2, f.pos).unwrap(),
            Pos(2.0, 0.0)
        );

        // Freed index is reused by the next create.
        let l3 = f
            .pool
            .add_entity(handle(2), EntityBuilder::new().with(f.pos, Pos(3.0, 0.0)))
            .unwrap();
        assert_eq!(l3.storage_index, l1.storage_index);
    }

    #[test]
    fn test_component_not_present() {
        let mut f = fixture();
        let l = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        assert_eq!(
            f.pool.get_component::<Vel>(l, f.vel).unwrap_err(),
            EcsError::ComponentNotPresent
        );
    }

    #[test]
    fn test_membership_lists_track_masks() {
        let mut f = fixture();
        let l1 = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        let l2 = f
            .pool
            .add_entity(
                handle(1),
                EntityBuilder::new()
                    .with(f.pos, Pos(0.0, 0.0))
                    .with(f.vel, Vel(0.0, 0.0)),
            )
            .unwrap();
        assert_ne!(l1.mask_list_index, l2.mask_list_index);
        assert_eq!(
            f.pool.members_of(l1.mask_list_index).unwrap(),
            &[l1.storage_index]
        );
        assert_eq!(
            f.pool.members_of(l2.mask_list_index).unwrap(),
            &[l2.storage_index]
        );
    }

    #[test]
    fn test_add_then_remove_restores_mask() {
        let mut f = fixture();
        let l = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        f.pool
            .queue_component_change(
                handle(0),
                l,
                MigrationDirection::Add,
                f.vel,
                Some(ComponentValue::new(f.vel, Vel(1.0, 1.0))),
            )
            .unwrap();
        let r1 = f.pool.flush_migrations().unwrap();
        let mid = r1[0].location;

        f.pool
            .queue_component_change(handle(0), mid, MigrationDirection::Remove, f.vel, None)
            .unwrap();
        let r2 = f.pool.flush_migrations().unwrap();
        let fin = r2[0].location;

        assert_eq!(fin.storage_index, l.storage_index);
        let final_mask = f.pool.mask_at(fin.mask_list_index).unwrap();
        assert_eq!(final_mask, mask::bit(f.pos));
        assert!(!mask::has(final_mask, f.vel));
    }
}
