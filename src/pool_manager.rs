//! Pool manager: owns every registered pool and runs the flush phases.
//!
//! Flushing is two passes over all pools: entity ops first, migrations
//! second. Pools return result slices; only the manager touches entity
//! slots, so storage engines never see the slot table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::archetype::ArchetypePool;
use crate::component::ComponentInfo;
use crate::entity::EntityManager;
use crate::error::{EcsError, Result};
use crate::pool::{OpKind, Pool, PoolSpec, PoolTag, StorageStrategy};
use crate::sparse::SparseSetPool;

pub struct PoolManager {
    pools: Vec<Pool>,
    by_name: FxHashMap<&'static str, PoolTag>,
    /// Bumped once per flush. Queries compare against it to reject
    /// iteration without a same-epoch update.
    epoch: Arc<AtomicU64>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            pools: Vec::new(),
            by_name: FxHashMap::default(),
            epoch: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn register(&mut self, spec: PoolSpec, infos: Vec<ComponentInfo>) -> PoolTag {
        let tag = PoolTag(self.pools.len() as u32);
        let pool = match spec.strategy {
            StorageStrategy::Archetype => Pool::Archetype(ArchetypePool::new(tag, &spec, infos)),
            StorageStrategy::Sparse => Pool::Sparse(SparseSetPool::new(tag, &spec, infos)),
        };
        self.by_name.insert(spec.name, tag);
        self.pools.push(pool);
        tag
    }

    pub fn pool(&self, tag: PoolTag) -> Result<&Pool> {
        self.pools.get(tag.0 as usize).ok_or(EcsError::PoolNotFound)
    }

    pub fn pool_mut(&mut self, tag: PoolTag) -> Result<&mut Pool> {
        self.pools
            .get_mut(tag.0 as usize)
            .ok_or(EcsError::PoolNotFound)
    }

    pub fn tag_of(&self, name: &str) -> Result<PoolTag> {
        self.by_name.get(name).copied().ok_or(EcsError::PoolNotFound)
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn epoch_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.epoch)
    }

    /// Invalidate cached query batches after an immediate-mode structural
    /// change outside the flush path.
    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Run both flush phases across every pool and apply the results to the
    /// slot table, then advance the epoch.
    pub fn flush_all(&mut self, entities: &mut EntityManager) -> Result<()> {
        for pool in &mut self.pools {
            for result in pool.flush_entity_ops()? {
                match result.op {
                    OpKind::Create => {
                        if let Some(location) = result.location {
                            entities.finalize(result.entity, location)?;
                        }
                    }
                    OpKind::Destroy => {
                        entities.release(result.entity)?;
                        if let Some((moved, location)) = result.swapped {
                            let slot = entities.get_unchecked_mut(moved)?;
                            slot.mask_list_index = location.mask_list_index;
                            slot.storage_index = location.storage_index;
                        }
                    }
                }
            }
        }

        for pool in &mut self.pools {
            let results = pool.flush_migrations()?;
            Self::apply_migration_results(entities, results)?;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(epoch, "flush complete");
        Ok(())
    }

    /// Immediate-mode migration pass for a single pool, used by the entity
    /// API before the facade starts running. Advances the epoch: cached
    /// query pointers may now be stale.
    pub fn flush_pool_migrations(
        &mut self,
        tag: PoolTag,
        entities: &mut EntityManager,
    ) -> Result<()> {
        let results = self.pool_mut(tag)?.flush_migrations()?;
        Self::apply_migration_results(entities, results)?;
        self.epoch.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn apply_migration_results(
        entities: &mut EntityManager,
        results: Vec<crate::pool::MigrationResult>,
    ) -> Result<()> {
        for result in results {
            let slot = entities.get_unchecked_mut(result.entity)?;
            slot.mask_list_index = result.location.mask_list_index;
            slot.storage_index = result.location.storage_index;
            slot.is_migrating = false;
            if let Some((moved, location)) = result.swapped {
                let slot = entities.get_unchecked_mut(moved)?;
                slot.mask_list_index = location.mask_list_index;
                slot.storage_index = location.storage_index;
            }
        }
        Ok(())
    }

    /// End-of-tick cleanup: forget which archetypes were new or reallocated.
    pub fn clear_epoch_lists(&mut self) {
        for pool in &mut self.pools {
            pool.clear_epoch_lists();
        }
    }

    pub fn live_entity_count(&self) -> usize {
        self.pools.iter().map(Pool::live_entity_count).sum()
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EntityBuilder;
    use crate::component::ComponentRegistry;

    #[derive(Debug, PartialEq, Clone, Copy)]
    struct Pos(f32, f32);

    #[test]
    fn test_deferred_create_destroy_roundtrip() {
        let mut reg = ComponentRegistry::new();
        let pos = reg.register::<Pos>("Pos").unwrap();
        let mut pm = PoolManager::new();
        let tag = pm.register(PoolSpec::archetype("units").require(&[pos]), reg.snapshot());
        let mut em = EntityManager::new();

        let e = em.new_pending_slot(tag);
        pm.pool_mut(tag)
            .unwrap()
            .queue_create(e, EntityBuilder::new().with(pos, Pos(1.0, 2.0)))
            .unwrap();
        assert!(em.get(e).is_err());

        pm.flush_all(&mut em).unwrap();
        let slot = em.get(e).unwrap();
        assert!(!slot.is_pending_create);
        assert_eq!(pm.live_entity_count(), 1);

        let location = slot.location();
        em.get_unchecked_mut(e).unwrap().is_pending_destroy = true;
        pm.pool_mut(tag).unwrap().queue_destroy(e, location);
        pm.flush_all(&mut em).unwrap();
        assert_eq!(em.get(e), Err(EcsError::StaleEntity));
        assert_eq!(pm.live_entity_count(), 0);
    }

    #[test]
    fn test_epoch_advances_per_flush() {
        let mut pm = PoolManager::new();
        let mut em = EntityManager::new();
        let before = pm.epoch();
        pm.flush_all(&mut em).unwrap();
        pm.flush_all(&mut em).unwrap();
        assert_eq!(pm.epoch(), before + 2);
    }
}
