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

//! Shared pool contract: deferred queues, flush results, and the tagged
//! dispatch over the two storage engines.

use rustc_hash::FxHashMap;

use crate::archetype::ArchetypePool;
use crate::builder::EntityBuilder;
use crate::component::{ComponentKind, ComponentValue};
use crate::entity::EntityHandle;
use crate::error::{EcsError, Result};
use crate::mask::{self, Mask};
use crate::sparse::SparseSetPool;

/// Identifies one registered pool. Assigned by the pool manager in
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTag(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStrategy {
    Archetype,
    Sparse,
}

/// Where an entity lives inside its pool. Named record instead of positional
/// indices; no `(usize, usize)` pairs cross a module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub mask_list_index: u32,
    pub storage_index: u32,
}

/// Pool registration record.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub name: &'static str,
    pub strategy: StorageStrategy,
    pub required: Mask,
    pub optional: Mask,
}

impl PoolSpec {
    pub fn archetype(name: &'static str) -> Self {
        Self {
            name,
            strategy: StorageStrategy::Archetype,
            required: mask::EMPTY,
            optional: mask::EMPTY,
        }
    }

    pub fn sparse(name: &'static str) -> Self {
        Self {
            name,
            strategy: StorageStrategy::Sparse,
            required: mask::EMPTY,
            optional: mask::EMPTY,
        }
    }

    pub fn require(mut self, kinds: &[ComponentKind]) -> Self {
        self.required |= mask::mask_of(kinds);
        self
    }

    pub fn allow(mut self, kinds: &[ComponentKind]) -> Self {
        self.optional |= mask::mask_of(kinds);
        self
    }

    pub fn pool_mask(&self) -> Mask {
        self.required | self.optional
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Destroy,
}

/// One applied entity operation, reported back to the pool manager.
#[derive(Debug)]
pub struct EntityOpResult {
    pub op: OpKind,
    pub entity: EntityHandle,
    /// None for a destroy that cancelled a same-tick pending create: the
    /// slot is released without storage ever having been written.
    pub location: Option<EntityLocation>,
    /// Entity moved into the vacated slot by swap-remove, with its new
    /// location. Always None for sparse pools.
    pub swapped: Option<(EntityHandle, EntityLocation)>,
}

/// One applied migration, reported back to the pool manager.
#[derive(Debug)]
pub struct MigrationResult {
    pub entity: EntityHandle,
    pub location: EntityLocation,
    pub swapped: Option<(EntityHandle, EntityLocation)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Add,
    Remove,
}

/// One queued component change.
#[derive(Debug)]
pub struct MigrationOp {
    pub direction: MigrationDirection,
    pub kind: ComponentKind,
    pub data: Option<ComponentValue>,
}

/// Pending ops for one entity, in enqueue order.
#[derive(Debug)]
pub struct MigrationEntry {
    pub location: EntityLocation,
    pub ops: Vec<MigrationOp>,
}

/// Per-entity list of pending add/remove operations.
#[derive(Default)]
pub struct MigrationQueue {
    entries: FxHashMap<EntityHandle, MigrationEntry>,
}

impl MigrationQueue {
    /// Append an op. Returns true when this created the entity's entry, so
    /// the caller can raise the slot's `is_migrating` flag exactly once.
    pub fn push(&mut self, entity: EntityHandle, location: EntityLocation, op: MigrationOp) -> bool {
        match self.entries.entry(entity) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().ops.push(op);
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(MigrationEntry {
                    location,
                    ops: vec![op],
                });
                true
            }
        }
    }

    /// Drop the entity's pending ops (entity destroyed in the same tick).
    pub fn cancel(&mut self, entity: EntityHandle) -> bool {
        self.entries.remove(&entity).is_some()
    }

    /// Re-anchor a pending entry after its entity was swap-moved by an
    /// entity-op flush earlier in the same tick.
    pub fn repoint(&mut self, entity: EntityHandle, location: EntityLocation) {
        if let Some(entry) = self.entries.get_mut(&entity) {
            entry.location = location;
        }
    }

    /// The mask the entity will hold once its queued ops are applied.
    pub fn effective_mask(&self, entity: EntityHandle, base: Mask) -> Mask {
        let Some(entry) = self.entries.get(&entity) else {
            return base;
        };
        entry.ops.iter().fold(base, |m, op| match op.direction {
            MigrationDirection::Add => mask::add(m, op.kind),
            MigrationDirection::Remove => mask::remove(m, op.kind),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn take_entries(&mut self) -> Vec<(EntityHandle, MigrationEntry)> {
        self.entries.drain().collect()
    }
}

/// Outcome of replaying one entity's op list against its current mask.
#[derive(Debug)]
pub struct ResolvedMigration {
    pub final_mask: Mask,
    /// Kinds present before and after whose value is replaced (removed then
    /// re-added within the same tick). The old value must be dropped instead
    /// of copied.
    pub rewritten: Mask,
    /// Data to write into the destination, one entry per net-added or
    /// rewritten kind.
    pub writes: Vec<(ComponentKind, ComponentValue)>,
}

/// Replay `entry.ops` in enqueue order. Validation happened at queue time;
/// a net-added kind with no surviving data is a `NullComponentData` fault.
pub fn resolve_migration(base: Mask, entry: MigrationEntry) -> Result<ResolvedMigration> {
    let mut final_mask = base;
    let mut pending: FxHashMap<ComponentKind, ComponentValue> = FxHashMap::default();

    for op in entry.ops {
        match op.direction {
            MigrationDirection::Add => {
                final_mask = mask::add(final_mask, op.kind);
                if let Some(data) = op.data {
                    pending.insert(op.kind, data);
                }
            }
            MigrationDirection::Remove => {
                final_mask = mask::remove(final_mask, op.kind);
                pending.remove(&op.kind);
            }
        }
    }

    let mut rewritten = mask::EMPTY;
    let mut writes = Vec::with_capacity(pending.len());
    for (kind, value) in pending {
        if !mask::has(final_mask, kind) {
            continue;
        }
        if mask::has(base, kind) {
            rewritten |= mask::bit(kind);
        }
        writes.push((kind, value));
    }

    // Every net-added kind must have data to write.
    let added = final_mask & !base;
    let written = writes
        .iter()
        .fold(mask::EMPTY, |m, (kind, _)| mask::add(m, *kind));
    if !mask::contains(written, added) {
        return Err(EcsError::NullComponentData);
    }

    Ok(ResolvedMigration {
        final_mask,
        rewritten,
        writes,
    })
}

/// Check a builder against a pool's masks and the registered component
/// types. Shared by both storage engines.
pub(crate) fn validate_builder(
    builder: &EntityBuilder,
    required: Mask,
    pool_mask: Mask,
    infos: &[crate::component::ComponentInfo],
) -> Result<()> {
    let bmask = builder.mask();
    if !mask::contains(bmask, required) {
        let missing = required & !bmask;
        if let Some(kind) = mask::kinds(missing).next() {
            return Err(EcsError::MissingRequiredComponent(
                infos[kind.index()].name.to_string(),
            ));
        }
    }
    if !mask::contains(pool_mask, bmask) {
        let outside = bmask & !pool_mask;
        if let Some(kind) = mask::kinds(outside).next() {
            return Err(EcsError::ComponentNotInPool(
                infos[kind.index()].name.to_string(),
            ));
        }
    }
    for value in builder.components() {
        let info = &infos[value.kind().index()];
        if info.type_id != value.type_id() {
            return Err(EcsError::ComponentTypeMismatch(info.name.to_string()));
        }
    }
    Ok(())
}

/// Check one queued component change against the entity's effective mask
/// (current mask plus already-queued ops). Shared by both storage engines.
pub(crate) fn validate_change(
    direction: MigrationDirection,
    kind: ComponentKind,
    effective: Mask,
    data: Option<&ComponentValue>,
    required: Mask,
    pool_mask: Mask,
    infos: &[crate::component::ComponentInfo],
) -> Result<()> {
    match direction {
        MigrationDirection::Add => {
            if !mask::has(pool_mask, kind) {
                return Err(EcsError::ComponentNotInPool(
                    infos[kind.index()].name.to_string(),
                ));
            }
            if mask::has(effective, kind) {
                return Err(EcsError::AddingExistingComponent);
            }
            let Some(value) = data else {
                return Err(EcsError::NullComponentData);
            };
            let info = &infos[kind.index()];
            if info.type_id != value.type_id() {
                return Err(EcsError::ComponentTypeMismatch(info.name.to_string()));
            }
        }
        MigrationDirection::Remove => {
            if mask::has(required, kind) {
                return Err(EcsError::RemovingRequiredComponent);
            }
            if !mask::has(effective, kind) {
                return Err(EcsError::RemovingNonexistentComponent);
            }
        }
    }
    Ok(())
}

/// Deferred create/destroy ordering. A destroy that finds a queued create
/// for the same handle cancels both.
#[derive(Default)]
pub struct EntityOpQueue {
    creates: Vec<(EntityHandle, EntityBuilder)>,
    destroys: Vec<(EntityHandle, EntityLocation)>,
    cancelled: Vec<EntityHandle>,
}

impl EntityOpQueue {
    pub fn queue_create(&mut self, entity: EntityHandle, builder: EntityBuilder) {
        self.creates.push((entity, builder));
    }

    /// Returns true when a pending create was cancelled instead.
    pub fn queue_destroy(&mut self, entity: EntityHandle, location: EntityLocation) -> bool {
        if let Some(pos) = self.creates.iter().position(|(e, _)| *e == entity) {
            self.creates.remove(pos);
            self.cancelled.push(entity);
            return true;
        }
        self.destroys.push((entity, location));
        false
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.destroys.is_empty() && self.cancelled.is_empty()
    }

    #[allow(clippy::type_complexity)]
    pub fn take(
        &mut self,
    ) -> (
        Vec<(EntityHandle, EntityBuilder)>,
        Vec<(EntityHandle, EntityLocation)>,
        Vec<EntityHandle>,
    ) {
        (
            std::mem::take(&mut self.creates),
            std::mem::take(&mut self.destroys),
            std::mem::take(&mut self.cancelled),
        )
    }
}

/// A registered pool: tagged dispatch over the two storage engines.
pub enum Pool {
    Archetype(ArchetypePool),
    Sparse(SparseSetPool),
}

impl Pool {
    pub fn tag(&self) -> PoolTag {
        match self {
            Pool::Archetype(p) => p.tag(),
            Pool::Sparse(p) => p.tag(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Pool::Archetype(p) => p.name(),
            Pool::Sparse(p) => p.name(),
        }
    }

    pub fn strategy(&self) -> StorageStrategy {
        match self {
            Pool::Archetype(_) => StorageStrategy::Archetype,
            Pool::Sparse(_) => StorageStrategy::Sparse,
        }
    }

    pub fn required_mask(&self) -> Mask {
        match self {
            Pool::Archetype(p) => p.required_mask(),
            Pool::Sparse(p) => p.required_mask(),
        }
    }

    pub fn pool_mask(&self) -> Mask {
        match self {
            Pool::Archetype(p) => p.pool_mask(),
            Pool::Sparse(p) => p.pool_mask(),
        }
    }

    /// Immediate insertion.
    pub fn add_entity(
        &mut self,
        entity: EntityHandle,
        builder: EntityBuilder,
    ) -> Result<EntityLocation> {
        match self {
            Pool::Archetype(p) => p.add_entity(entity, builder),
            Pool::Sparse(p) => p.add_entity(entity, builder),
        }
    }

    /// Immediate removal. Returns the entity swapped into the vacated slot,
    /// if any.
    pub fn remove_entity(
        &mut self,
        location: EntityLocation,
        expected: PoolTag,
    ) -> Result<Option<(EntityHandle, EntityLocation)>> {
        match self {
            Pool::Archetype(p) => p.remove_entity(location, expected),
            Pool::Sparse(p) => p.remove_entity(location, expected),
        }
    }

    pub fn queue_create(&mut self, entity: EntityHandle, builder: EntityBuilder) -> Result<()> {
        match self {
            Pool::Archetype(p) => p.queue_create(entity, builder),
            Pool::Sparse(p) => p.queue_create(entity, builder),
        }
    }

    /// Returns true when the destroy cancelled a same-tick pending create.
    pub fn queue_destroy(&mut self, entity: EntityHandle, location: EntityLocation) -> bool {
        match self {
            Pool::Archetype(p) => p.queue_destroy(entity, location),
            Pool::Sparse(p) => p.queue_destroy(entity, location),
        }
    }

    /// Enqueue a component change. Returns true when this opened the
    /// entity's migration entry (caller raises `is_migrating`).
    pub fn queue_component_change(
        &mut self,
        entity: EntityHandle,
        location: EntityLocation,
        direction: MigrationDirection,
        kind: ComponentKind,
        data: Option<ComponentValue>,
    ) -> Result<bool> {
        match self {
            Pool::Archetype(p) => p.queue_component_change(entity, location, direction, kind, data),
            Pool::Sparse(p) => p.queue_component_change(entity, location, direction, kind, data),
        }
    }

    /// The mask the entity will hold after its queued ops apply.
    pub fn effective_mask(&self, entity: EntityHandle, current: Mask) -> Mask {
        match self {
            Pool::Archetype(p) => p.migrations().effective_mask(entity, current),
            Pool::Sparse(p) => p.migrations().effective_mask(entity, current),
        }
    }

    pub fn flush_entity_ops(&mut self) -> Result<Vec<EntityOpResult>> {
        match self {
            Pool::Archetype(p) => p.flush_entity_ops(),
            Pool::Sparse(p) => p.flush_entity_ops(),
        }
    }

    pub fn flush_migrations(&mut self) -> Result<Vec<MigrationResult>> {
        match self {
            Pool::Archetype(p) => p.flush_migrations(),
            Pool::Sparse(p) => p.flush_migrations(),
        }
    }

    pub fn mask_at(&self, mask_list_index: u32) -> Result<Mask> {
        match self {
            Pool::Archetype(p) => p.mask_at(mask_list_index),
            Pool::Sparse(p) => p.mask_at(mask_list_index),
        }
    }

    pub fn has_component(&self, mask_list_index: u32, kind: ComponentKind) -> Result<bool> {
        Ok(mask::has(self.mask_at(mask_list_index)?, kind))
    }

    /// Raw pointer to one component slot, with its size and type for checked
    /// typed access.
    pub fn component_ptr(
        &mut self,
        location: EntityLocation,
        kind: ComponentKind,
    ) -> Result<*mut u8> {
        match self {
            Pool::Archetype(p) => p.component_ptr(location, kind),
            Pool::Sparse(p) => p.component_ptr(location, kind),
        }
    }

    /// Typed component access.
    pub fn get_component<T: 'static>(
        &mut self,
        location: EntityLocation,
        kind: ComponentKind,
    ) -> Result<&mut T> {
        match self {
            Pool::Archetype(p) => p.get_component(location, kind),
            Pool::Sparse(p) => p.get_component(location, kind),
        }
    }

    pub fn new_archetypes(&self) -> &[u32] {
        match self {
            Pool::Archetype(p) => p.new_archetypes(),
            Pool::Sparse(p) => p.new_archetypes(),
        }
    }

    pub fn reallocated_archetypes(&self) -> &[u32] {
        match self {
            Pool::Archetype(p) => p.reallocated_archetypes(),
            Pool::Sparse(p) => p.reallocated_archetypes(),
        }
    }

    pub fn clear_epoch_lists(&mut self) {
        match self {
            Pool::Archetype(p) => p.clear_epoch_lists(),
            Pool::Sparse(p) => p.clear_epoch_lists(),
        }
    }

    /// Number of archetypes (archetype pools) or virtual archetypes (sparse
    /// pools).
    pub fn mask_list_len(&self) -> usize {
        match self {
            Pool::Archetype(p) => p.archetype_count(),
            Pool::Sparse(p) => p.mask_list_len(),
        }
    }

    pub fn live_entity_count(&self) -> usize {
        match self {
            Pool::Archetype(p) => p.live_entity_count(),
            Pool::Sparse(p) => p.live_entity_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentValue;

    const A: ComponentKind = ComponentKind::new(0);
    const B: ComponentKind = ComponentKind::new(1);

    fn handle(index: u32) -> EntityHandle {
        EntityHandle {
            index,
            generation: 0,
        }
    }

    fn loc(mli: u32, si: u32) -> EntityLocation {
        EntityLocation {
            mask_list_index: mli,
            storage_index: si,
        }
    }

    #[test]
    fn test_migration_queue_single_entry_per_entity() {
        let mut q = MigrationQueue::default();
        let e = handle(0);
        let first = q.push(
            e,
            loc(0, 0),
            MigrationOp {
                direction: MigrationDirection::Add,
                kind: A,
                data: Some(ComponentValue::new(A, 1u32)),
            },
        );
        let second = q.push(
            e,
            loc(0, 0),
            MigrationOp {
                direction: MigrationDirection::Remove,
                kind: A,
                data: None,
            },
        );
        assert!(first);
        assert!(!second);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_effective_mask_replays_in_order() {
        let mut q = MigrationQueue::default();
        let e = handle(0);
        let base = mask::bit(B);
        for (dir, kind) in [
            (MigrationDirection::Add, A),
            (MigrationDirection::Remove, A),
            (MigrationDirection::Add, A),
        ] {
            q.push(
                e,
                loc(0, 0),
                MigrationOp {
                    direction: dir,
                    kind,
                    data: match dir {
                        MigrationDirection::Add => Some(ComponentValue::new(A, 0u32)),
                        MigrationDirection::Remove => None,
                    },
                },
            );
        }
        assert_eq!(q.effective_mask(e, base), mask::mask_of(&[A, B]));
    }

    #[test]
    fn test_resolve_add_then_remove_is_noop() {
        let entry = MigrationEntry {
            location: loc(0, 0),
            ops: vec![
                MigrationOp {
                    direction: MigrationDirection::Add,
                    kind: A,
                    data: Some(ComponentValue::new(A, 5u32)),
                },
                MigrationOp {
                    direction: MigrationDirection::Remove,
                    kind: A,
                    data: None,
                },
            ],
        };
        let resolved = resolve_migration(mask::bit(B), entry).unwrap();
        assert_eq!(resolved.final_mask, mask::bit(B));
        assert!(resolved.writes.is_empty());
    }

    #[test]
    fn test_resolve_remove_then_readd_rewrites() {
        let entry = MigrationEntry {
            location: loc(0, 0),
            ops: vec![
                MigrationOp {
                    direction: MigrationDirection::Remove,
                    kind: B,
                    data: None,
                },
                MigrationOp {
                    direction: MigrationDirection::Add,
                    kind: B,
                    data: Some(ComponentValue::new(B, 9u64)),
                },
            ],
        };
        let resolved = resolve_migration(mask::bit(B), entry).unwrap();
        assert_eq!(resolved.final_mask, mask::bit(B));
        assert_eq!(resolved.rewritten, mask::bit(B));
        assert_eq!(resolved.writes.len(), 1);
    }

    #[test]
    fn test_resolve_missing_data_is_null_component() {
        let entry = MigrationEntry {
            location: loc(0, 0),
            ops: vec![MigrationOp {
                direction: MigrationDirection::Add,
                kind: A,
                data: None,
            }],
        };
        assert_eq!(
            resolve_migration(mask::EMPTY, entry).unwrap_err(),
            EcsError::NullComponentData
        );
    }

    #[test]
    fn test_op_queue_create_then_destroy_cancels() {
        let mut q = EntityOpQueue::default();
        let e = handle(3);
        q.queue_create(e, EntityBuilder::new());
        assert!(q.queue_destroy(e, loc(0, 0)));
        let (creates, destroys, cancelled) = q.take();
        assert!(creates.is_empty());
        assert!(destroys.is_empty());
        assert_eq!(cancelled, vec![e]);
    }
}
