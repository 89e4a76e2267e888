//! System trait, access metadata, and the per-tick context handed to
//! system hooks.

use crate::builder::EntityBuilder;
use crate::component::{Component, ComponentKind, ComponentValue};
use crate::entity::{EntityHandle, EntityManager};
use crate::error::{EcsError, Result};
use crate::mask::{self, Mask};
use crate::pool::{EntityLocation, MigrationDirection, PoolTag};
use crate::pool_manager::PoolManager;
use crate::query::{Query, QueryConfig};

/// Component footprint of a system: the union of its queries' read and
/// write sets plus any components reached through other entity handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccess {
    pub reads: Mask,
    pub writes: Mask,
}

impl SystemAccess {
    pub const fn empty() -> Self {
        Self {
            reads: mask::EMPTY,
            writes: mask::EMPTY,
        }
    }

    /// Derive the footprint from query configurations.
    pub fn from_queries(configs: &[QueryConfig]) -> Self {
        configs.iter().fold(Self::empty(), |acc, c| Self {
            reads: acc.reads | c.read,
            writes: acc.writes | c.write,
        })
    }

    /// Components read through other entity handles.
    pub const fn indirect_reads(mut self, kinds: &[ComponentKind]) -> Self {
        self.reads |= mask::mask_of(kinds);
        self
    }

    /// Components written through other entity handles.
    pub const fn indirect_writes(mut self, kinds: &[ComponentKind]) -> Self {
        self.writes |= mask::mask_of(kinds);
        self
    }

    /// A no-query system: touches no components at all.
    pub const fn is_empty(&self) -> bool {
        self.reads == 0 && self.writes == 0
    }
}

/// Static declaration attached to a system.
#[derive(Debug, Clone)]
pub struct SystemDesc {
    /// When false the system is dropped from the registry at build time.
    pub enabled: bool,
    pub runs_before: Vec<&'static str>,
    pub runs_after: Vec<&'static str>,
}

impl Default for SystemDesc {
    fn default() -> Self {
        Self {
            enabled: true,
            runs_before: Vec::new(),
            runs_after: Vec::new(),
        }
    }
}

impl SystemDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, name: &'static str) -> Self {
        self.runs_before.push(name);
        self
    }

    pub fn after(mut self, name: &'static str) -> Self {
        self.runs_after.push(name);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A user-defined procedure invoked once per tick.
pub trait System: Send {
    fn name(&self) -> &'static str;

    fn desc(&self) -> SystemDesc {
        SystemDesc::default()
    }

    /// Declared component footprint, used for scheduling.
    fn access(&self) -> SystemAccess;

    /// Every query the system owns, for init/refresh by the system manager.
    fn queries_mut(&mut self) -> Vec<&mut Query> {
        Vec::new()
    }

    fn init(&mut self, _ctx: &mut SystemContext<'_>) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, ctx: &mut SystemContext<'_>) -> Result<()>;

    fn deinit(&mut self, _ctx: &mut SystemContext<'_>) -> Result<()> {
        Ok(())
    }
}

pub type BoxedSystem = Box<dyn System>;

/// Mutation and lookup surface handed to systems (and backing the facade's
/// entity API). While the world is running, every mutation defers through
/// the pool queues; before that, mutations apply immediately.
pub struct SystemContext<'a> {
    pub(crate) entities: &'a mut EntityManager,
    pub(crate) pools: &'a mut PoolManager,
    pub(crate) running: bool,
}

impl<'a> SystemContext<'a> {
    pub(crate) fn new(
        entities: &'a mut EntityManager,
        pools: &'a mut PoolManager,
        running: bool,
    ) -> Self {
        Self {
            entities,
            pools,
            running,
        }
    }

    pub fn pool_manager(&self) -> &PoolManager {
        self.pools
    }

    pub fn entity_count(&self) -> usize {
        self.entities.live_count()
    }

    /// Create an entity in the given pool. Deferred while running: the
    /// handle is pending-create and invisible to lookups until the next
    /// flush.
    pub fn create_entity(&mut self, tag: PoolTag, builder: EntityBuilder) -> Result<EntityHandle> {
        if self.running {
            let handle = self.entities.new_pending_slot(tag);
            if let Err(err) = self.pools.pool_mut(tag)?.queue_create(handle, builder) {
                self.entities.release(handle)?;
                return Err(err);
            }
            Ok(handle)
        } else {
            let handle = self.entities.new_slot(
                tag,
                EntityLocation {
                    mask_list_index: u32::MAX,
                    storage_index: u32::MAX,
                },
            );
            match self.pools.pool_mut(tag)?.add_entity(handle, builder) {
                Ok(location) => {
                    self.entities.finalize(handle, location)?;
                    self.pools.bump_epoch();
                    Ok(handle)
                }
                Err(err) => {
                    self.entities.release(handle)?;
                    Err(err)
                }
            }
        }
    }

    /// Destroy an entity. Deferred while running; the slot stays resolvable
    /// (pending-destroy) until the next flush. Destroying an entity whose
    /// creation is still queued cancels both.
    pub fn destroy_entity(&mut self, handle: EntityHandle) -> Result<()> {
        let slot = self.entities.get_unchecked(handle)?;
        if slot.is_pending_destroy {
            return Err(EcsError::EntityPendingDestroy);
        }
        let tag = slot.pool_tag;
        let location = slot.location();
        let pending_create = slot.is_pending_create;

        if self.running || pending_create {
            self.pools.pool_mut(tag)?.queue_destroy(handle, location);
            self.entities.get_unchecked_mut(handle)?.is_pending_destroy = true;
            Ok(())
        } else {
            let swapped = self.pools.pool_mut(tag)?.remove_entity(location, tag)?;
            self.entities.release(handle)?;
            if let Some((moved, moved_location)) = swapped {
                let slot = self.entities.get_unchecked_mut(moved)?;
                slot.mask_list_index = moved_location.mask_list_index;
                slot.storage_index = moved_location.storage_index;
            }
            self.pools.bump_epoch();
            Ok(())
        }
    }

    /// Add a component. Deferred while running.
    pub fn add_component<T: Component>(
        &mut self,
        handle: EntityHandle,
        kind: ComponentKind,
        value: T,
    ) -> Result<()> {
        self.queue_change(
            handle,
            MigrationDirection::Add,
            kind,
            Some(ComponentValue::new(kind, value)),
        )
    }

    /// Remove a component. Deferred while running. Removing a pool-required
    /// component is rejected.
    pub fn remove_component(&mut self, handle: EntityHandle, kind: ComponentKind) -> Result<()> {
        self.queue_change(handle, MigrationDirection::Remove, kind, None)
    }

    /// Component lookup dispatching on the entity's slot. Succeeds on a
    /// pending-destroy entity: its storage stays valid until the flush.
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

    fn queue_change(
        &mut self,
        handle: EntityHandle,
        direction: MigrationDirection,
        kind: ComponentKind,
        data: Option<ComponentValue>,
    ) -> Result<()> {
        let slot = self.entities.get(handle)?;
        let tag = slot.pool_tag;
        let location = slot.location();

        let opened =
            self.pools
                .pool_mut(tag)?
                .queue_component_change(handle, location, direction, kind, data)?;
        if opened {
            self.entities.get_unchecked_mut(handle)?.is_migrating = true;
        }
        if !self.running {
            // Immediate mode: run this pool's migration pass on the spot.
            self.pools.flush_pool_migrations(tag, self.entities)?;
        }
        Ok(())
    }
}
