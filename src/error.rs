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

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Global facade accessed before `init_global`
    NotInitialized,

    /// `init_global` called while a facade is already installed
    AlreadyInitialized,

    /// Handle generation no longer matches the slot
    StaleEntity,

    /// Entity is queued for creation and not yet observable
    EntityPendingCreate,

    /// Entity is queued for destruction
    EntityPendingDestroy,

    /// Slot does not belong to the pool that was asked to operate on it
    EntityPoolMismatch,

    /// Component already present on the entity
    AddingExistingComponent,

    /// Component absent from the entity
    RemovingNonexistentComponent,

    /// Component is part of the pool's required set and cannot be removed
    RemovingRequiredComponent,

    /// Queued Add migration carried no component data
    NullComponentData,

    /// Component not part of the entity's archetype (archetype pools)
    ComponentNotInArchetype,

    /// Component slot is empty (sparse pools)
    ComponentNotPresent,

    /// No archetype exists at the given index
    ArchetypeDoesNotExist,

    /// Query iterated without an update in the current epoch
    QueryNotUpdated,

    /// Builder is missing a component the pool requires
    MissingRequiredComponent(String),

    /// Builder carries a component outside the pool's allowed set
    ComponentNotInPool(String),

    /// Value type does not match the kind's registered type
    ComponentTypeMismatch(String),

    /// Component type was never registered
    ComponentNotRegistered,

    /// Too many component kinds for the mask width
    TooManyComponents,

    /// Too many systems for the system-mask width
    TooManySystems,

    /// No pool registered under the given tag
    PoolNotFound,

    /// No system registered under the given name
    SystemNotFound,

    /// Topological sort could not place every system
    DependencyCycle(Vec<String>),

    /// Two systems write the same component with no ordering between them
    WriteWriteConflict {
        first: String,
        second: String,
        component: String,
    },

    /// An enabled system references a disabled one
    DisabledSystemReference { from: String, to: String },

    /// A system references a name that is not in the registry
    UnknownSystemReference { from: String, to: String },
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::NotInitialized => write!(f, "ECS facade not initialized"),
            EcsError::AlreadyInitialized => write!(f, "ECS facade already initialized"),
            EcsError::StaleEntity => write!(f, "Stale entity handle"),
            EcsError::EntityPendingCreate => write!(f, "Entity is pending creation"),
            EcsError::EntityPendingDestroy => write!(f, "Entity is pending destruction"),
            EcsError::EntityPoolMismatch => write!(f, "Entity does not belong to this pool"),
            EcsError::AddingExistingComponent => write!(f, "Component already present on entity"),
            EcsError::RemovingNonexistentComponent => {
                write!(f, "Component not present on entity")
            }
            EcsError::RemovingRequiredComponent => {
                write!(f, "Cannot remove a pool-required component")
            }
            EcsError::NullComponentData => write!(f, "Queued component add carried no data"),
            EcsError::ComponentNotInArchetype => {
                write!(f, "Component not part of the entity's archetype")
            }
            EcsError::ComponentNotPresent => write!(f, "Component slot is empty"),
            EcsError::ArchetypeDoesNotExist => write!(f, "Archetype does not exist"),
            EcsError::QueryNotUpdated => {
                write!(f, "Query iterated without an update this epoch")
            }
            EcsError::MissingRequiredComponent(name) => {
                write!(f, "Builder missing required component: {name}")
            }
            EcsError::ComponentNotInPool(name) => {
                write!(f, "Component not allowed in this pool: {name}")
            }
            EcsError::ComponentTypeMismatch(name) => {
                write!(f, "Value type mismatch for component: {name}")
            }
            EcsError::ComponentNotRegistered => write!(f, "Component type not registered"),
            EcsError::TooManyComponents => {
                write!(f, "Component kind count exceeds mask width")
            }
            EcsError::TooManySystems => {
                write!(f, "System count exceeds system-mask width")
            }
            EcsError::PoolNotFound => write!(f, "Pool not found"),
            EcsError::SystemNotFound => write!(f, "System not found"),
            EcsError::DependencyCycle(names) => {
                write!(f, "System dependency cycle involving: {}", names.join(", "))
            }
            EcsError::WriteWriteConflict {
                first,
                second,
                component,
            } => write!(
                f,
                "Unordered write-write conflict between '{first}' and '{second}' on component '{component}'"
            ),
            EcsError::DisabledSystemReference { from, to } => {
                write!(f, "System '{from}' references disabled system '{to}'")
            }
            EcsError::UnknownSystemReference { from, to } => {
                write!(f, "System '{from}' references unknown system '{to}'")
            }
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
