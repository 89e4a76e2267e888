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

//! Query engine: component predicates matched against pool storage, with
//! cached per-archetype iteration batches.
//!
//! A pool matches when its pool mask covers the query's read∪write set.
//! Inside a matching pool an archetype is visited in Direct mode (the pool's
//! required mask already covers the access set, every member matches) or
//! Lookup mode (each archetype mask is tested). Archetypes intersecting the
//! exclude mask are skipped in either mode.
//!
//! Batches cache raw column pointers, so a query must be refreshed after
//! every flush before it may iterate; a stale query fails `QueryNotUpdated`.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::component::ComponentKind;
use crate::entity::EntityHandle;
use crate::error::{EcsError, Result};
use crate::mask::{self, Mask};
use crate::pool::{Pool, PoolTag};
use crate::pool_manager::PoolManager;

/// Compile-time-constructible query predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryConfig {
    pub read: Mask,
    pub write: Mask,
    pub exclude: Mask,
}

impl QueryConfig {
    pub const fn new() -> Self {
        Self {
            read: mask::EMPTY,
            write: mask::EMPTY,
            exclude: mask::EMPTY,
        }
    }

    pub const fn read(mut self, kinds: &[ComponentKind]) -> Self {
        self.read |= mask::mask_of(kinds);
        self
    }

    pub const fn write(mut self, kinds: &[ComponentKind]) -> Self {
        self.write |= mask::mask_of(kinds);
        self
    }

    pub const fn exclude(mut self, kinds: &[ComponentKind]) -> Self {
        self.exclude |= mask::mask_of(kinds);
        self
    }

    /// Components the query touches at all.
    pub const fn access(&self) -> Mask {
        self.read | self.write
    }
}

#[derive(Debug)]
enum BatchColumn {
    /// Contiguous SoA column (archetype pools): base pointer plus stride.
    Dense {
        base: *mut u8,
        item_size: usize,
        type_id: TypeId,
    },
    /// One pointer per member (sparse pools).
    Scattered {
        ptrs: Vec<*mut u8>,
        item_size: usize,
        type_id: TypeId,
    },
}

/// Cached iteration unit: one archetype or virtual archetype.
#[derive(Debug)]
pub struct QueryBatch {
    pool_tag: PoolTag,
    mask_list_index: u32,
    entities: Vec<EntityHandle>,
    kinds: SmallVec<[ComponentKind; 8]>,
    columns: Vec<BatchColumn>,
}

// SAFETY: the pointers target component storage whose types are Send + Sync
// (Component bound); batches are only touched through the owning query.
unsafe impl Send for QueryBatch {}
unsafe impl Sync for QueryBatch {}

impl QueryBatch {
    pub fn pool_tag(&self) -> PoolTag {
        self.pool_tag
    }

    pub fn mask_list_index(&self) -> u32 {
        self.mask_list_index
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[EntityHandle] {
        &self.entities
    }

    pub fn entity(&self, row: usize) -> EntityHandle {
        self.entities[row]
    }

    pub fn get<T: 'static>(&self, kind: ComponentKind, row: usize) -> Option<&T> {
        let ptr = self.slot_ptr(kind, row, TypeId::of::<T>())?;
        // SAFETY: type and bounds checked in slot_ptr; the epoch guard on
        // the owning query keeps the pointer valid across flushes.
        Some(unsafe { &*(ptr as *const T) })
    }

    pub fn get_mut<T: 'static>(&mut self, kind: ComponentKind, row: usize) -> Option<&mut T> {
        let ptr = self.slot_ptr(kind, row, TypeId::of::<T>())?;
        // SAFETY: as in `get`, plus &mut self serializes access.
        Some(unsafe { &mut *(ptr as *mut T) })
    }

    fn slot_ptr(&self, kind: ComponentKind, row: usize, want: TypeId) -> Option<*mut u8> {
        if row >= self.entities.len() {
            return None;
        }
        let index = self.kinds.iter().position(|&k| k == kind)?;
        match &self.columns[index] {
            BatchColumn::Dense {
                base,
                item_size,
                type_id,
            } => {
                if *type_id != want {
                    return None;
                }
                Some(unsafe { base.add(row * item_size) })
            }
            BatchColumn::Scattered { ptrs, type_id, .. } => {
                if *type_id != want {
                    return None;
                }
                ptrs.get(row).copied()
            }
        }
    }
}

struct PoolState {
    tag: PoolTag,
    direct: bool,
    matches: Vec<u32>,
    batches: Vec<QueryBatch>,
}

/// A query plus its runtime cache of matches.
pub struct Query {
    config: QueryConfig,
    kinds: SmallVec<[ComponentKind; 8]>,
    pools: Vec<PoolState>,
    pool_filter: Option<PoolTag>,
    epoch: Option<Arc<AtomicU64>>,
    seen_epoch: u64,
    initialized: bool,
    cursor: (usize, usize),
}

impl Query {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            config,
            kinds: mask::kinds(config.access()).collect(),
            pools: Vec::new(),
            pool_filter: None,
            epoch: None,
            seen_epoch: 0,
            initialized: false,
            cursor: (0, 0),
        }
    }

    /// Restrict matching to a single pool. An empty config then enumerates
    /// everything that pool holds.
    pub fn with_pool(mut self, tag: PoolTag) -> Self {
        self.pool_filter = Some(tag);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Full scan of every archetype in every matching pool.
    pub fn init(&mut self, pools: &PoolManager) {
        let access = self.config.access();
        self.pools.clear();
        for pool in pools.pools() {
            if let Some(filter) = self.pool_filter {
                if pool.tag() != filter {
                    continue;
                }
            }
            if !mask::contains(pool.pool_mask(), access) {
                continue;
            }
            let direct = mask::contains(pool.required_mask(), access);
            let mut state = PoolState {
                tag: pool.tag(),
                direct,
                matches: Vec::new(),
                batches: Vec::new(),
            };
            for index in 0..pool.mask_list_len() as u32 {
                self.consider(&mut state, pool, index);
            }
            self.pools.push(state);
        }
        self.epoch = Some(pools.epoch_handle());
        self.seen_epoch = pools.epoch();
        self.initialized = true;
        self.cursor = (0, 0);
    }

    /// Incremental refresh: scan only archetypes the pools flagged as new or
    /// reallocated since the last tick, rebuilding stale pointer arrays.
    pub fn update(&mut self, pools: &PoolManager) -> Result<()> {
        if !self.initialized {
            self.init(pools);
            return Ok(());
        }
        if self.seen_epoch == pools.epoch() {
            return Ok(());
        }
        let mut states = std::mem::take(&mut self.pools);
        for state in &mut states {
            let pool = pools.pool(state.tag)?;
            for &index in pool.new_archetypes() {
                self.consider(state, pool, index);
            }
            for &index in pool.reallocated_archetypes() {
                self.consider(state, pool, index);
            }
        }
        self.pools = states;
        self.seen_epoch = pools.epoch();
        self.cursor = (0, 0);
        Ok(())
    }

    /// Full rescan, discarding the cache. Used when a system is reactivated
    /// after missing epochs of incremental updates.
    pub fn refresh(&mut self, pools: &PoolManager) {
        self.init(pools);
    }

    /// Sequential batch protocol. Returns one archetype batch at a time;
    /// after exhaustion returns None and rewinds.
    pub fn next(&mut self) -> Result<Option<&mut QueryBatch>> {
        self.check_updated()?;
        loop {
            let (pi, mi) = self.cursor;
            if pi >= self.pools.len() {
                self.cursor = (0, 0);
                return Ok(None);
            }
            if mi >= self.pools[pi].batches.len() {
                self.cursor = (pi + 1, 0);
                continue;
            }
            self.cursor = (pi, mi + 1);
            if self.pools[pi].batches[mi].is_empty() {
                continue;
            }
            return Ok(Some(&mut self.pools[pi].batches[mi]));
        }
    }

    /// Closure protocol: invoked once per matching entity until it returns
    /// false or matches are exhausted.
    pub fn for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(EntityHandle, &mut QueryBatch, usize) -> bool,
    {
        self.check_updated()?;
        for state in &mut self.pools {
            for batch in &mut state.batches {
                for row in 0..batch.len() {
                    let entity = batch.entity(row);
                    if !f(entity, batch, row) {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Total entities across all cached batches.
    pub fn matched_count(&self) -> usize {
        self.pools
            .iter()
            .flat_map(|s| s.batches.iter())
            .map(QueryBatch::len)
            .sum()
    }

    fn check_updated(&self) -> Result<()> {
        let Some(epoch) = &self.epoch else {
            return Err(EcsError::QueryNotUpdated);
        };
        if self.seen_epoch != epoch.load(Ordering::Relaxed) {
            return Err(EcsError::QueryNotUpdated);
        }
        Ok(())
    }

    /// Admit, re-cache, or ignore one archetype.
    fn consider(&self, state: &mut PoolState, pool: &Pool, index: u32) {
        let Ok(arch_mask) = pool.mask_at(index) else {
            return;
        };
        if let Some(pos) = state.matches.iter().position(|&m| m == index) {
            // Re-cached: the old pointer arrays are dropped with the batch.
            state.batches[pos] = self.build_batch(pool, index);
            return;
        }
        if !self.matches_mask(state.direct, arch_mask) {
            return;
        }
        state.matches.push(index);
        state.batches.push(self.build_batch(pool, index));
    }

    fn matches_mask(&self, direct: bool, arch_mask: Mask) -> bool {
        if mask::intersects(arch_mask, self.config.exclude) {
            return false;
        }
        direct || mask::contains(arch_mask, self.config.access())
    }

    fn build_batch(&self, pool: &Pool, index: u32) -> QueryBatch {
        let mut batch = QueryBatch {
            pool_tag: pool.tag(),
            mask_list_index: index,
            entities: Vec::new(),
            kinds: self.kinds.clone(),
            columns: Vec::new(),
        };
        match pool {
            Pool::Archetype(p) => {
                let Some(arch) = p.archetype(index) else {
                    return batch;
                };
                batch.entities = arch.entities().to_vec();
                if batch.entities.is_empty() {
                    batch.kinds.clear();
                    return batch;
                }
                for &kind in &batch.kinds {
                    if let Some((base, item_size, type_id)) = arch.column_base(kind) {
                        batch.columns.push(BatchColumn::Dense {
                            base,
                            item_size,
                            type_id,
                        });
                    }
                }
            }
            Pool::Sparse(p) => {
                let Ok(members) = p.members_of(index) else {
                    return batch;
                };
                let members = members.to_vec();
                for &storage_index in &members {
                    if let Some(handle) = p.handle_at(storage_index) {
                        batch.entities.push(handle);
                    }
                }
                for &kind in &batch.kinds {
                    let Some(col) = p.column(kind) else { continue };
                    let ptrs = members
                        .iter()
                        .map(|&si| col.ptr(si as usize) as *mut u8)
                        .collect();
                    batch.columns.push(BatchColumn::Scattered {
                        ptrs,
                        item_size: col.item_size(),
                        type_id: col.type_id(),
                    });
                }
            }
        }
        batch
    }
}
