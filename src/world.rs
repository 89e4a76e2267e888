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

//! World facade: single entry point over the registries, pools, queries,
//! and systems.
//!
//! A tick is one call to `update`: flush every pool's entity ops, then
//! every pool's migrations, then run the systems in the persisted order,
//! then clear the epoch lists. While systems run, the world is `running`
//! and every mutation through the entity API defers to the next flush.

use parking_lot::Mutex;
use tracing::info;

use crate::builder::EntityBuilder;
use crate::component::{Component, ComponentKind, ComponentRegistry};
use crate::entity::{EntityHandle, EntityManager};
use crate::error::{EcsError, Result};
use crate::executor::SystemManager;
use crate::pool::{Pool, PoolSpec, PoolTag};
use crate::pool_manager::PoolManager;
use crate::query::{Query, QueryConfig};
use crate::system::{System, SystemContext};

/// Staged registrations, turned into a `World` by `build`.
///
/// `build` is the generation-time boundary: schedule conflicts, cycles, and
/// references to disabled systems are rejected here, before any tick runs.
#[derive(Default)]
pub struct WorldBuilder {
    registry: ComponentRegistry,
    pool_specs: Vec<PoolSpec>,
    systems: Vec<Box<dyn System>>,
}

impl WorldBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type. Registration order defines mask bit
    /// positions; the returned kind feeds pool specs and query configs.
    pub fn register_component<T: Component>(&mut self, name: &'static str) -> Result<ComponentKind> {
        self.registry.register::<T>(name)
    }

    pub fn register_pool(&mut self, spec: PoolSpec) -> &mut Self {
        self.pool_specs.push(spec);
        self
    }

    pub fn register_system<S: System + 'static>(&mut self, system: S) -> &mut Self {
        self.systems.push(Box::new(system));
        self
    }

    pub fn build(self) -> Result<World> {
        let infos = self.registry.snapshot();
        let mut pools = PoolManager::new();
        for spec in self.pool_specs {
            pools.register(spec, infos.clone());
        }

        let mut systems = SystemManager::build(self.systems, &self.registry)?;
        let mut entities = EntityManager::new();
        systems.init_all(&mut entities, &mut pools)?;

        info!(
            components = self.registry.kind_count(),
            pools = pools.pool_count(),
            systems = systems.len(),
            order = ?systems.order_names(),
            "world built"
        );
        Ok(World {
            registry: self.registry,
            entities,
            pools,
            systems,
            running: false,
        })
    }
}

pub struct World {
    registry: ComponentRegistry,
    entities: EntityManager,
    pools: PoolManager,
    systems: SystemManager,
    /// True only while systems run inside `update`. The single owner of
    /// the immediate-versus-deferred decision.
    running: bool,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl World {
    pub fn builder() -> WorldBuilder {
        WorldBuilder::new()
    }

    /// One tick: flush, run systems, clear epoch lists.
    pub fn update(&mut self) -> Result<()> {
        self.pools.flush_all(&mut self.entities)?;
        self.running = true;
        let outcome = self.systems.run_tick(&mut self.entities, &mut self.pools);
        self.running = false;
        self.pools.clear_epoch_lists();
        outcome
    }

    /// Flush pending mutations without running systems.
    pub fn flush(&mut self) -> Result<()> {
        self.pools.flush_all(&mut self.entities)
    }

    /// Tear down systems in declared order.
    pub fn shutdown(&mut self) -> Result<()> {
        self.systems.shutdown(&mut self.entities, &mut self.pools)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Pool manager handle, used to refresh ad-hoc queries after a flush.
    pub fn pool_manager(&self) -> &PoolManager {
        &self.pools
    }

    pub fn pool_tag(&self, name: &str) -> Result<PoolTag> {
        self.pools.tag_of(name)
    }

    pub fn pool(&self, tag: PoolTag) -> Result<&Pool> {
        self.pools.pool(tag)
    }

    pub fn pool_mut(&mut self, tag: PoolTag) -> Result<&mut Pool> {
        self.pools.pool_mut(tag)
    }

    pub fn system(&self, name: &str) -> Result<&dyn System> {
        self.systems.system(name)
    }

    pub fn system_mut(&mut self, name: &str) -> Result<&mut (dyn System + 'static)> {
        self.systems.system_mut(name)
    }

    /// Toggle a system. Reactivation forces its queries to rescan.
    pub fn set_system_active(&mut self, name: &str, active: bool) -> Result<()> {
        self.systems.set_active(name, active)
    }

    /// Ad-hoc query over the current pool state, initialized and ready to
    /// iterate. Refresh it with `Query::update` after any flush.
    pub fn query(&self, config: QueryConfig) -> Query {
        let mut query = Query::new(config);
        query.init(&self.pools);
        query
    }

    /// Query restricted to one pool; with no further predicate it
    /// enumerates every entity the pool holds.
    pub fn query_pool(&self, tag: PoolTag) -> Result<Query> {
        self.pools.pool(tag)?;
        let mut query = Query::new(QueryConfig::new()).with_pool(tag);
        query.init(&self.pools);
        Ok(query)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.live_count()
    }

    pub fn epoch(&self) -> u64 {
        self.pools.epoch()
    }

    // Entity API: dispatches to the right pool based on the entity's slot.

    pub fn create_entity(&mut self, tag: PoolTag, builder: EntityBuilder) -> Result<EntityHandle> {
        self.ctx().create_entity(tag, builder)
    }

    pub fn destroy_entity(&mut self, handle: EntityHandle) -> Result<()> {
        self.ctx().destroy_entity(handle)
    }

    pub fn add_component<T: Component>(
        &mut self,
        handle: EntityHandle,
        kind: ComponentKind,
        value: T,
    ) -> Result<()> {
        self.ctx().add_component(handle, kind, value)
    }

    pub fn remove_component(&mut self, handle: EntityHandle, kind: ComponentKind) -> Result<()> {
        self.ctx().remove_component(handle, kind)
    }

    pub fn get_component<T: 'static>(
        &mut self,
        handle: EntityHandle,
        kind: ComponentKind,
    ) -> Result<&mut T> {
        let slot = self.entities.resolve(handle)?;
        let tag = slot.pool_tag;
        let location = slot.location();
        self.pools.pool_mut(tag)?.get_component(location, kind)
    }

    pub fn has_component(&self, handle: EntityHandle, kind: ComponentKind) -> Result<bool> {
        let slot = self.entities.resolve(handle)?;
        self.pools
            .pool(slot.pool_tag)?
            .has_component(slot.mask_list_index, kind)
    }

    /// Slot metadata for a live entity.
    pub fn entity_slot(&self, handle: EntityHandle) -> Result<&crate::entity::EntitySlot> {
        self.entities.resolve(handle)
    }

    fn ctx(&mut self) -> SystemContext<'_> {
        SystemContext::new(&mut self.entities, &mut self.pools, self.running)
    }
}

// Process-wide facade instance. Init-once, teardown-once.

static GLOBAL: Mutex<Option<World>> = Mutex::new(None);

/// Install the process-wide world. Fails if one is already installed.
pub fn init_global(world: World) -> Result<()> {
    let mut slot = GLOBAL.lock();
    if slot.is_some() {
        return Err(EcsError::AlreadyInitialized);
    }
    info!("global world installed");
    *slot = Some(world);
    Ok(())
}

/// Run a closure against the process-wide world.
pub fn with_global<R>(f: impl FnOnce(&mut World) -> Result<R>) -> Result<R> {
    let mut slot = GLOBAL.lock();
    let world = slot.as_mut().ok_or(EcsError::NotInitialized)?;
    f(world)
}

/// Tear down the process-wide world, running system deinit hooks.
pub fn teardown_global() -> Result<()> {
    let mut slot = GLOBAL.lock();
    let mut world = slot.take().ok_or(EcsError::NotInitialized)?;
    world.shutdown()?;
    info!("global world torn down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Clone, Copy)]
    struct Pos(f32, f32);
    #[derive(Debug, PartialEq, Clone, Copy)]
    struct Vel(f32, f32);

    struct Fixture {
        world: World,
        pos: ComponentKind,
        vel: ComponentKind,
        units: PoolTag,
    }

    fn fixture() -> Fixture {
        let mut builder = World::builder();
        let pos = builder.register_component::<Pos>("Pos").unwrap();
        let vel = builder.register_component::<Vel>("Vel").unwrap();
        builder.register_pool(PoolSpec::archetype("units").require(&[pos]).allow(&[vel]));
        let world = builder.build().unwrap();
        let units = world.pool_tag("units").unwrap();
        Fixture {
            world,
            pos,
            vel,
            units,
        }
    }

    #[test]
    fn test_immediate_create_and_lookup() {
        let mut f = fixture();
        let e = f
            .world
            .create_entity(f.units, EntityBuilder::new().with(f.pos, Pos(1.0, 2.0)))
            .unwrap();
        assert_eq!(f.world.entity_count(), 1);
        assert_eq!(
            *f.world.get_component::<Pos>(e, f.pos).unwrap(),
            Pos(1.0, 2.0)
        );
        assert!(f.world.has_component(e, f.pos).unwrap());
        assert!(!f.world.has_component(e, f.vel).unwrap());
    }

    #[test]
    fn test_immediate_component_change() {
        let mut f = fixture();
        let e = f
            .world
            .create_entity(f.units, EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        f.world.add_component(e, f.vel, Vel(3.0, 4.0)).unwrap();
        assert_eq!(
            *f.world.get_component::<Vel>(e, f.vel).unwrap(),
            Vel(3.0, 4.0)
        );
        f.world.remove_component(e, f.vel).unwrap();
        assert!(!f.world.has_component(e, f.vel).unwrap());
    }

    #[test]
    fn test_immediate_destroy_goes_stale() {
        let mut f = fixture();
        let e = f
            .world
            .create_entity(f.units, EntityBuilder::new().with(f.pos, Pos(0.0, 0.0)))
            .unwrap();
        f.world.destroy_entity(e).unwrap();
        assert_eq!(
            f.world.get_component::<Pos>(e, f.pos).unwrap_err(),
            EcsError::StaleEntity
        );
        assert_eq!(f.world.entity_count(), 0);
    }

    #[test]
    fn test_query_pool_enumerates_one_pool() {
        let mut builder = World::builder();
        let pos = builder.register_component::<Pos>("Pos").unwrap();
        builder.register_pool(PoolSpec::archetype("units").require(&[pos]));
        builder.register_pool(PoolSpec::sparse("fx").require(&[pos]));
        let mut world = builder.build().unwrap();
        let units = world.pool_tag("units").unwrap();
        let fx = world.pool_tag("fx").unwrap();

        world
            .create_entity(units, EntityBuilder::new().with(pos, Pos(0.0, 0.0)))
            .unwrap();
        world
            .create_entity(fx, EntityBuilder::new().with(pos, Pos(1.0, 0.0)))
            .unwrap();

        let mut q = world.query_pool(units).unwrap();
        assert_eq!(q.matched_count(), 1);
        let batch = q.next().unwrap().unwrap();
        assert_eq!(batch.pool_tag(), units);
    }

    #[test]
    fn test_query_through_facade() {
        let mut f = fixture();
        for x in 0..3 {
            f.world
                .create_entity(
                    f.units,
                    EntityBuilder::new().with(f.pos, Pos(x as f32, 0.0)),
                )
                .unwrap();
        }
        let mut q = f.world.query(QueryConfig::new().read(&[f.pos]));
        assert_eq!(q.matched_count(), 3);
        assert!(q.next().is_ok());
    }
}
