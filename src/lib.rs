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

//! Entity Component System with pluggable storage pools.
//!
//! Entities live in registered pools, each backed by one of two storage
//! engines: archetype (SoA grouped by exact component mask) or sparse set
//! (flat SoA with stable indices). Mutations defer through per-pool queues
//! and flush at tick boundaries; queries cache per-archetype batches; the
//! scheduler orders systems from their declared component footprints.

pub mod archetype;
pub mod builder;
pub mod column;
pub mod component;
pub mod entity;
pub mod error;
pub mod mask;
pub mod pool;
pub mod pool_manager;
pub mod query;
pub mod schedule;
pub mod sparse;
pub mod system;
pub mod world;

mod executor;

// Re-exports for convenience
pub use archetype::{Archetype, ArchetypePool};
pub use builder::EntityBuilder;
pub use component::{Component, ComponentKind, ComponentRegistry, ComponentValue};
pub use entity::{EntityHandle, EntityManager, EntitySlot};
pub use error::{EcsError, Result};
pub use executor::SystemManager;
pub use mask::Mask;
pub use pool::{
    EntityLocation, MigrationDirection, Pool, PoolSpec, PoolTag, StorageStrategy,
};
pub use pool_manager::PoolManager;
pub use query::{Query, QueryBatch, QueryConfig};
pub use sparse::SparseSetPool;
pub use system::{BoxedSystem, System, SystemAccess, SystemContext, SystemDesc};
pub use world::{init_global, teardown_global, with_global, World, WorldBuilder};
