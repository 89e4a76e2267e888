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

//! Archetype pool: SoA storage grouped by exact component mask.
//!
//! Every entity with the same mask lives in the same archetype; swap-remove
//! is the only deletion mechanism. A component change moves the entity to
//! the archetype of its new mask, so all mutation goes through the deferred
//! migration queue between flushes.

use std::any::TypeId;

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

/// SoA storage block for one exact mask. Columns are ordered by ascending
/// kind, so a kind's column index is its rank within the mask.
pub struct Archetype {
    mask: Mask,
    entities: Vec<EntityHandle>,
    columns: Vec<ComponentColumn>,
}

impl Archetype {
    fn new(mask: Mask, infos: &[ComponentInfo]) -> Self {
        let columns = mask::kinds(mask)
            .map(|kind| ComponentColumn::for_info(&infos[kind.index()]))
            .collect();
        Self {
            mask,
            entities: Vec::new(),
            columns,
        }
    }

    pub fn mask(&self) -> Mask {
        self.mask
    }

    pub fn entities(&self) -> &[EntityHandle] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn column(&self, kind: ComponentKind) -> Option<&ComponentColumn> {
        if !mask::has(self.mask, kind) {
            return None;
        }
        self.columns.get(mask::rank(self.mask, kind))
    }

    pub fn column_mut(&mut self, kind: ComponentKind) -> Option<&mut ComponentColumn> {
        if !mask::has(self.mask, kind) {
            return None;
        }
        self.columns.get_mut(mask::rank(self.mask, kind))
    }

    /// Base pointer, item size, and type of a column, for query batches.
    /// None when the kind is absent or the archetype is empty.
    pub fn column_base(&self, kind: ComponentKind) -> Option<(*mut u8, usize, TypeId)> {
        if self.entities.is_empty() {
            return None;
        }
        let col = self.column(kind)?;
        Some((col.ptr(0) as *mut u8, col.item_size(), col.type_id()))
    }

    /// Append a row with undefined component bytes.
    fn push_row(&mut self, entity: EntityHandle) -> usize {
        let row = self.entities.len();
        for col in &mut self.columns {
            col.ensure_capacity(row + 1);
        }
        self.entities.push(entity);
        row
    }

    /// Swap-remove a row. Kinds in `drop_mask` have their value dropped;
    /// the rest were moved out by the caller and only their bytes vacate.
    /// Returns the entity swapped into `row`, if any.
    fn swap_remove_row(&mut self, row: usize, drop_mask: Mask) -> Option<EntityHandle> {
        let last = self.entities.len() - 1;
        for (kind, col) in mask::kinds(self.mask).zip(self.columns.iter_mut()) {
            if mask::has(drop_mask, kind) {
                col.drop_at(row);
            }
            if row != last {
                col.copy_within(last, row);
            }
        }
        self.entities.swap_remove(row);
        if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        }
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for col in &mut self.columns {
            for row in 0..self.entities.len() {
                col.drop_at(row);
            }
        }
    }
}

/// Mask-grouped archetype storage engine.
pub struct ArchetypePool {
    tag: PoolTag,
    name: &'static str,
    required: Mask,
    pool_mask: Mask,
    infos: Vec<ComponentInfo>,
    archetypes: Vec<Archetype>,
    mask_index: AHashMap<Mask, u32>,
    migrations: MigrationQueue,
    entity_ops: EntityOpQueue,
    new_archetypes: Vec<u32>,
    reallocated: Vec<u32>,
}

impl ArchetypePool {
    pub fn new(tag: PoolTag, spec: &PoolSpec, infos: Vec<ComponentInfo>) -> Self {
        Self {
            tag,
            name: spec.name,
            required: spec.required,
            pool_mask: spec.pool_mask(),
            infos,
            archetypes: Vec::new(),
            mask_index: AHashMap::new(),
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

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetype(&self, index: u32) -> Option<&Archetype> {
        self.archetypes.get(index as usize)
    }

    pub fn live_entity_count(&self) -> usize {
        self.archetypes.iter().map(Archetype::len).sum()
    }

    pub fn mask_at(&self, mask_list_index: u32) -> Result<Mask> {
        self.archetypes
            .get(mask_list_index as usize)
            .map(Archetype::mask)
            .ok_or(EcsError::ArchetypeDoesNotExist)
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

    /// Immediate insertion into the archetype of the builder's mask.
    pub fn add_entity(
        &mut self,
        entity: EntityHandle,
        builder: EntityBuilder,
    ) -> Result<EntityLocation> {
        validate_builder(&builder, self.required, self.pool_mask, &self.infos)?;
        let arch_index = self.archetype_for(builder.mask());
        let arch = &mut self.archetypes[arch_index as usize];
        let row = arch.push_row(entity);
        for value in builder.into_components() {
            let kind = value.kind();
            if let Some(col) = arch.column_mut(kind) {
                // SAFETY: the slot was just allocated and the value's type
                // was checked against the registry in validate_builder.
                unsafe { value.write_to(col.ptr_mut(row)) };
            }
        }
        self.mark_reallocated(arch_index);
        Ok(EntityLocation {
            mask_list_index: arch_index,
            storage_index: row as u32,
        })
    }

    /// Immediate swap-remove. Returns the entity that now occupies the
    /// vacated slot, if any; the caller repoints its slot.
    pub fn remove_entity(
        &mut self,
        location: EntityLocation,
        expected: PoolTag,
    ) -> Result<Option<(EntityHandle, EntityLocation)>> {
        if expected != self.tag {
            return Err(EcsError::EntityPoolMismatch);
        }
        self.remove_at(location)
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

    /// Apply deferred entity ops: destroys first, highest storage index
    /// first so swap-remove never invalidates an unprocessed index, then
    /// creates.
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
            let swapped = self.remove_at(location)?;
            results.push(EntityOpResult {
                op: OpKind::Destroy,
                entity,
                location: Some(location),
                swapped,
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

    /// Apply deferred migrations. The `(source_mask asc, storage_index
    /// desc)` order guarantees swap-remove during the walk never moves an
    /// entity whose own migration is still pending.
    pub fn flush_migrations(&mut self) -> Result<Vec<MigrationResult>> {
        let mut entries = self.migrations.take_entries();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        entries.sort_by(|a, b| {
            let mask_a = self.archetypes[a.1.location.mask_list_index as usize].mask;
            let mask_b = self.archetypes[b.1.location.mask_list_index as usize].mask;
            mask_a
                .cmp(&mask_b)
                .then(b.1.location.storage_index.cmp(&a.1.location.storage_index))
        });

        let mut results = Vec::with_capacity(entries.len());
        for (entity, entry) in entries {
            let source = entry.location;
            let src_mask = self.mask_at(source.mask_list_index)?;
            let resolved = resolve_migration(src_mask, entry)?;

            if resolved.final_mask == src_mask {
                // No move. Rewritten kinds are replaced in place.
                let arch = &mut self.archetypes[source.mask_list_index as usize];
                for (kind, value) in resolved.writes {
                    if let Some(col) = arch.column_mut(kind) {
                        let row = source.storage_index as usize;
                        col.drop_at(row);
                        // SAFETY: slot vacated above; type checked at queue.
                        unsafe { value.write_to(col.ptr_mut(row)) };
                    }
                }
                self.mark_reallocated(source.mask_list_index);
                results.push(MigrationResult {
                    entity,
                    location: source,
                    swapped: None,
                });
                continue;
            }

            let dst_index = self.archetype_for(resolved.final_mask);
            let (src, dst) = self.two_archetypes_mut(source.mask_list_index, dst_index);
            let row = source.storage_index as usize;
            let dst_row = dst.push_row(entity);

            // Move every kind kept by the migration; the rest stay behind
            // and are dropped by the swap-remove below.
            let moved = src_mask & resolved.final_mask & !resolved.rewritten;
            for kind in mask::kinds(moved) {
                if let (Some(src_col), Some(dst_col)) = (src.column(kind), dst.column_mut(kind)) {
                    src_col.copy_slot_to(row, dst_col, dst_row);
                }
            }
            let drop_mask = (src_mask & !resolved.final_mask) | resolved.rewritten;
            let swapped = src.swap_remove_row(row, drop_mask);

            for (kind, value) in resolved.writes {
                if let Some(col) = dst.column_mut(kind) {
                    // SAFETY: slot allocated undefined by push_row; type
                    // checked at queue time.
                    unsafe { value.write_to(col.ptr_mut(dst_row)) };
                }
            }

            self.mark_reallocated(source.mask_list_index);
            self.mark_reallocated(dst_index);
            results.push(MigrationResult {
                entity,
                location: EntityLocation {
                    mask_list_index: dst_index,
                    storage_index: dst_row as u32,
                },
                swapped: swapped.map(|h| (h, source)),
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
        let arch = self
            .archetypes
            .get_mut(location.mask_list_index as usize)
            .ok_or(EcsError::ArchetypeDoesNotExist)?;
        let col = arch
            .column_mut(kind)
            .ok_or(EcsError::ComponentNotInArchetype)?;
        Ok(col.ptr_mut(location.storage_index as usize))
    }

    pub fn get_component<T: 'static>(
        &mut self,
        location: EntityLocation,
        kind: ComponentKind,
    ) -> Result<&mut T> {
        let name = self.infos[kind.index()].name;
        let arch = self
            .archetypes
            .get_mut(location.mask_list_index as usize)
            .ok_or(EcsError::ArchetypeDoesNotExist)?;
        let col = arch
            .column_mut(kind)
            .ok_or(EcsError::ComponentNotInArchetype)?;
        col.get_mut::<T>(location.storage_index as usize)
            .ok_or_else(|| EcsError::ComponentTypeMismatch(name.to_string()))
    }

    fn remove_at(
        &mut self,
        location: EntityLocation,
    ) -> Result<Option<(EntityHandle, EntityLocation)>> {
        let arch = self
            .archetypes
            .get_mut(location.mask_list_index as usize)
            .ok_or(EcsError::ArchetypeDoesNotExist)?;
        if location.storage_index as usize >= arch.len() {
            return Err(EcsError::ArchetypeDoesNotExist);
        }
        let mask = arch.mask;
        let swapped = arch.swap_remove_row(location.storage_index as usize, mask);
        if let Some(moved) = swapped {
            // The moved entity may itself have a migration pending against
            // its old index.
            self.migrations.repoint(moved, location);
        }
        self.mark_reallocated(location.mask_list_index);
        Ok(swapped.map(|h| (h, location)))
    }

    fn archetype_for(&mut self, mask: Mask) -> u32 {
        if let Some(&index) = self.mask_index.get(&mask) {
            return index;
        }
        let index = self.archetypes.len() as u32;
        self.archetypes.push(Archetype::new(mask, &self.infos));
        self.mask_index.insert(mask, index);
        self.new_archetypes.push(index);
        index
    }

    fn two_archetypes_mut(&mut self, a: u32, b: u32) -> (&mut Archetype, &mut Archetype) {
        let (a, b) = (a as usize, b as usize);
        debug_assert_ne!(a, b);
        if a < b {
            let (left, right) = self.archetypes.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    fn mark_reallocated(&mut self, index: u32) {
        if !self.reallocated.contains(&index) && !self.new_archetypes.contains(&index) {
            self.reallocated.push(index);
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
        pool: ArchetypePool,
        pos: ComponentKind,
        vel: ComponentKind,
    }

    fn fixture() -> Fixture {
        let mut reg = ComponentRegistry::new();
        let pos = reg.register::<Pos>("Pos").unwrap();
        let vel = reg.register::<Vel>("Vel").unwrap();
        let spec = PoolSpec::archetype("units")
            .require(&[pos])
            .allow(&[vel]);
        let pool = ArchetypePool::new(PoolTag(0), &spec, reg.snapshot());
        Fixture { pool, pos, vel }
    }

    fn handle(index: u32) -> EntityHandle {
        EntityHandle {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_add_entity_groups_by_mask() {
        let mut f = fixture();
        let l1 = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(1.0, 2.0)))
            .unwrap();
        let l2 = f
            .pool
            .add_entity(handle(1), EntityBuilder::new().with(f.pos, Pos(3.0, 4.0)))
            .unwrap();
        assert_eq!(l1.mask_list_index, l2.mask_list_index);
        assert_eq!(l1.storage_index, 0);
        assert_eq!(l2.storage_index, 1);

        let l3 = f
            .pool
            .add_entity(
                handle(2),
                EntityBuilder::new()
                    .with(f.pos, Pos(0.0, 0.0))
                    .with(f.vel, Vel(1.0, 0.0)),
            )
            .unwrap();
        assert_ne!(l3.mask_list_index, l1.mask_list_index);
        assert_eq!(f.pool.archetype_count(), 2);
    }

    #[test]
    fn test_missing_required_component_rejected() {
        let mut f = fixture();
        let err = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.vel, Vel(0.0, 0.0)))
            .unwrap_err();
        assert_eq!(err, EcsError::MissingRequiredComponent("Pos".to_string()));
    }

    #[test]
    fn test_swap_remove_reports_swapped_entity() {
        let mut f = fixture();
        let mk = |x: f32| EntityBuilder::new().with(f.pos, Pos(x, 0.0));
        let l0 = f.pool.add_entity(handle(0), mk(0.0)).unwrap();
        f.pool.add_entity(handle(1), mk(1.0)).unwrap();
        f.pool.add_entity(handle(2), mk(2.0)).unwrap();

        let swapped = f.pool.remove_entity(l0, PoolTag(0)).unwrap();
        let (h, loc) = swapped.unwrap();
        assert_eq!(h, handle(2));
        assert_eq!(loc.storage_index, 0);
        let moved = f.pool.get_component::<Pos>(loc, f.pos).unwrap();
        assert_eq!(*moved, Pos(2.0, 0.0));
    }

    #[test]
    fn test_pool_tag_mismatch() {
        let mut f = fixture();
        let l = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        assert_eq!(
            f.pool.remove_entity(l, PoolTag(9)).unwrap_err(),
            EcsError::EntityPoolMismatch
        );
    }

    #[test]
    fn test_migration_moves_between_archetypes() {
        let mut f = fixture();
        let l = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(5.0, 6.0)))
            .unwrap();
        f.pool
            .queue_component_change(
                handle(0),
                l,
                MigrationDirection::Add,
                f.vel,
                Some(ComponentValue::new(f.vel, Vel(1.0, 0.0))),
            )
            .unwrap();
        let results = f.pool.flush_migrations().unwrap();
        assert_eq!(results.len(), 1);
        let new_loc = results[0].location;
        assert_ne!(new_loc.mask_list_index, l.mask_list_index);
        assert_eq!(
            *f.pool.get_component::<Pos>(new_loc, f.pos).unwrap(),
            Pos(5.0, 6.0)
        );
        assert_eq!(
            *f.pool.get_component::<Vel>(new_loc, f.vel).unwrap(),
            Vel(1.0, 0.0)
        );
    }

    #[test]
    fn test_add_existing_component_rejected_at_queue() {
        let mut f = fixture();
        let l = f
            .pool
            .add_entity(
                handle(0),
                EntityBuilder::new()
                    .with(f.pos, Pos(0.0, 0.0))
                    .with(f.vel, Vel(0.0, 0.0)),
            )
            .unwrap();
        let err = f
            .pool
            .queue_component_change(
                handle(0),
                l,
                MigrationDirection::Add,
                f.vel,
                Some(ComponentValue::new(f.vel, Vel(1.0, 1.0))),
            )
            .unwrap_err();
        assert_eq!(err, EcsError::AddingExistingComponent);
    }

    #[test]
    fn test_remove_required_component_rejected() {
        let mut f = fixture();
        let l = f
            .pool
            .add_entity(handle(0), EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        assert_eq!(
            f.pool
                .queue_component_change(handle(0), l, MigrationDirection::Remove, f.pos, None)
                .unwrap_err(),
            EcsError::RemovingRequiredComponent
        );
    }
}
