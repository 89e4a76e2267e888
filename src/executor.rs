//! System manager: instantiates enabled systems, keeps their queries fresh,
//! and invokes updates in the persisted schedule order.

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::component::ComponentRegistry;
use crate::entity::EntityManager;
use crate::error::{EcsError, Result};
use crate::pool_manager::PoolManager;
use crate::schedule::{build_order, SystemMeta};
use crate::system::{BoxedSystem, System, SystemContext};

struct SystemEntry {
    system: BoxedSystem,
    active: bool,
    /// Raised on reactivation: the next run rescans all archetypes instead
    /// of trusting incremental updates it missed.
    needs_full_refresh: bool,
}

pub struct SystemManager {
    systems: Vec<SystemEntry>,
    by_name: FxHashMap<&'static str, usize>,
    /// Execution order, computed once at build time and reused every tick.
    order: Vec<usize>,
}

impl SystemManager {
    /// Drop disabled systems, validate the dependency graph, and persist
    /// the execution order. This is the generation-time boundary: conflicts
    /// and cycles fail here, before any tick runs.
    pub(crate) fn build(systems: Vec<BoxedSystem>, registry: &ComponentRegistry) -> Result<Self> {
        let mut enabled = Vec::with_capacity(systems.len());
        let mut disabled_names = Vec::new();
        for system in systems {
            if system.desc().enabled {
                enabled.push(system);
            } else {
                debug!(system = system.name(), "dropping disabled system");
                disabled_names.push(system.name());
            }
        }

        let metas: Vec<SystemMeta> = enabled
            .iter()
            .map(|s| {
                let desc = s.desc();
                SystemMeta {
                    name: s.name(),
                    access: s.access(),
                    runs_before: desc.runs_before,
                    runs_after: desc.runs_after,
                }
            })
            .collect();
        let order = build_order(&metas, &disabled_names, registry)?;

        let by_name = enabled
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i))
            .collect();
        let systems = enabled
            .into_iter()
            .map(|system| SystemEntry {
                system,
                active: true,
                needs_full_refresh: false,
            })
            .collect();

        Ok(Self {
            systems,
            by_name,
            order,
        })
    }

    /// Initialize every system: full query scans, then the optional `init`
    /// hook, in declared order.
    pub(crate) fn init_all(
        &mut self,
        entities: &mut EntityManager,
        pools: &mut PoolManager,
    ) -> Result<()> {
        for entry in &mut self.systems {
            for query in entry.system.queries_mut() {
                query.init(pools);
            }
            let mut ctx = SystemContext::new(entities, pools, false);
            entry.system.init(&mut ctx)?;
        }
        Ok(())
    }

    /// One tick: walk the persisted order, refresh each active system's
    /// queries, then run its update.
    pub(crate) fn run_tick(
        &mut self,
        entities: &mut EntityManager,
        pools: &mut PoolManager,
    ) -> Result<()> {
        for i in 0..self.order.len() {
            let index = self.order[i];
            let entry = &mut self.systems[index];
            if !entry.active {
                continue;
            }
            trace!(system = entry.system.name(), "running system");
            if entry.needs_full_refresh {
                for query in entry.system.queries_mut() {
                    query.refresh(pools);
                }
                entry.needs_full_refresh = false;
            } else {
                for query in entry.system.queries_mut() {
                    query.update(pools)?;
                }
            }
            let mut ctx = SystemContext::new(entities, pools, true);
            entry.system.update(&mut ctx)?;
        }
        Ok(())
    }

    /// Call every system's `deinit` hook, in declared order.
    pub(crate) fn shutdown(
        &mut self,
        entities: &mut EntityManager,
        pools: &mut PoolManager,
    ) -> Result<()> {
        for entry in &mut self.systems {
            let mut ctx = SystemContext::new(entities, pools, false);
            entry.system.deinit(&mut ctx)?;
        }
        Ok(())
    }

    /// Toggle a system. Reactivation forces a full query rescan: the system
    /// missed the incremental new/reallocated lists while inactive.
    pub fn set_active(&mut self, name: &str, active: bool) -> Result<()> {
        let &index = self.by_name.get(name).ok_or(EcsError::SystemNotFound)?;
        let entry = &mut self.systems[index];
        if active && !entry.active {
            entry.needs_full_refresh = true;
        }
        entry.active = active;
        Ok(())
    }

    pub fn is_active(&self, name: &str) -> Result<bool> {
        let &index = self.by_name.get(name).ok_or(EcsError::SystemNotFound)?;
        Ok(self.systems[index].active)
    }

    pub fn system(&self, name: &str) -> Result<&dyn System> {
        let &index = self.by_name.get(name).ok_or(EcsError::SystemNotFound)?;
        Ok(self.systems[index].system.as_ref())
    }

    pub fn system_mut(&mut self, name: &str) -> Result<&mut (dyn System + 'static)> {
        let &index = self.by_name.get(name).ok_or(EcsError::SystemNotFound)?;
        Ok(self.systems[index].system.as_mut())
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// The persisted execution order as system names, for diagnostics.
    pub fn order_names(&self) -> Vec<&'static str> {
        self.order
            .iter()
            .map(|&i| self.systems[i].system.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{SystemAccess, SystemDesc};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recorder {
        name: &'static str,
        desc: SystemDesc,
        access: SystemAccess,
        ran: Arc<AtomicUsize>,
    }

    impl System for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn desc(&self) -> SystemDesc {
            self.desc.clone()
        }

        fn access(&self) -> SystemAccess {
            self.access
        }

        fn update(&mut self, _ctx: &mut SystemContext<'_>) -> Result<()> {
            self.ran.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn recorder(name: &'static str) -> (Recorder, Arc<AtomicUsize>) {
        let ran = Arc::new(AtomicUsize::new(0));
        (
            Recorder {
                name,
                desc: SystemDesc::new(),
                access: SystemAccess::empty(),
                ran: Arc::clone(&ran),
            },
            ran,
        )
    }

    #[test]
    fn test_disabled_systems_dropped() {
        let registry = ComponentRegistry::new();
        let (on, _) = recorder("on");
        let (mut off, _) = recorder("off");
        off.desc = SystemDesc::new().disabled();
        let systems: Vec<crate::system::BoxedSystem> = vec![Box::new(on), Box::new(off)];
        let manager = SystemManager::build(systems, &registry).unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.system("off").is_err());
        assert!(manager.system("on").is_ok());
    }

    #[test]
    fn test_inactive_system_skipped() {
        let registry = ComponentRegistry::new();
        let (system, ran) = recorder("a");
        let systems: Vec<crate::system::BoxedSystem> = vec![Box::new(system)];
        let mut manager = SystemManager::build(systems, &registry).unwrap();
        let mut entities = EntityManager::new();
        let mut pools = PoolManager::new();

        manager.set_active("a", false).unwrap();
        manager.run_tick(&mut entities, &mut pools).unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 0);

        manager.set_active("a", true).unwrap();
        manager.run_tick(&mut entities, &mut pools).unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_system_name() {
        let registry = ComponentRegistry::new();
        let mut manager = SystemManager::build(Vec::new(), &registry).unwrap();
        assert_eq!(
            manager.set_active("ghost", true).unwrap_err(),
            EcsError::SystemNotFound
        );
    }
}
