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

//! Component registry and type-erased component values.
//!
//! Components are plain Rust types. The registry assigns each type a
//! `ComponentKind` in registration order; that order defines mask bit
//! positions and is stable for the lifetime of the world.

use std::any::{Any, TypeId};

use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::mask::MAX_COMPONENT_KINDS;

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Index of a component kind inside the registry. Doubles as the kind's mask
/// bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKind(u8);

impl ComponentKind {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Layout and identity of one registered component type.
#[derive(Clone, Copy)]
pub struct ComponentInfo {
    pub name: &'static str,
    pub type_id: TypeId,
    pub item_size: usize,
    pub align: usize,
    pub drop_fn: Option<unsafe fn(*mut u8)>,
}

impl ComponentInfo {
    pub fn of<T: Component>(name: &'static str) -> Self {
        Self {
            name,
            type_id: TypeId::of::<T>(),
            item_size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe {
                    std::ptr::drop_in_place(ptr as *mut T);
                })
            } else {
                None
            },
        }
    }
}

/// Ordered enumeration of all component kinds.
///
/// No mutation after world construction; every pool, query, and system is
/// built against the kinds handed out here.
#[derive(Default)]
pub struct ComponentRegistry {
    infos: Vec<ComponentInfo>,
    by_type: FxHashMap<TypeId, ComponentKind>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type. Returns the kind whose index is the
    /// registration order. Registering the same type twice returns the
    /// original kind.
    pub fn register<T: Component>(&mut self, name: &'static str) -> Result<ComponentKind> {
        let type_id = TypeId::of::<T>();
        if let Some(&kind) = self.by_type.get(&type_id) {
            return Ok(kind);
        }
        if self.infos.len() >= MAX_COMPONENT_KINDS {
            return Err(EcsError::TooManyComponents);
        }
        let kind = ComponentKind::new(self.infos.len() as u8);
        self.infos.push(ComponentInfo::of::<T>(name));
        self.by_type.insert(type_id, kind);
        Ok(kind)
    }

    pub fn kind_count(&self) -> usize {
        self.infos.len()
    }

    pub fn name(&self, kind: ComponentKind) -> &'static str {
        self.infos[kind.index()].name
    }

    pub fn info(&self, kind: ComponentKind) -> &ComponentInfo {
        &self.infos[kind.index()]
    }

    pub fn kind_of<T: Component>(&self) -> Result<ComponentKind> {
        self.by_type
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or(EcsError::ComponentNotRegistered)
    }

    /// Copy of the info table, indexed by kind. Pools capture one at
    /// construction so flushes need no registry reference.
    pub fn snapshot(&self) -> Vec<ComponentInfo> {
        self.infos.clone()
    }

    /// Check a value's concrete type against the kind's registered type.
    pub fn check_type(&self, kind: ComponentKind, type_id: TypeId) -> Result<()> {
        let info = self.info(kind);
        if info.type_id != type_id {
            return Err(EcsError::ComponentTypeMismatch(info.name.to_string()));
        }
        Ok(())
    }
}

/// Owned, type-erased component payload used by builders and deferred Add
/// operations. The write fn downcasts back to the concrete type and moves
/// the value into raw column storage.
pub struct ComponentValue {
    kind: ComponentKind,
    type_id: TypeId,
    value: Box<dyn Any + Send + Sync>,
    write_fn: unsafe fn(Box<dyn Any + Send + Sync>, *mut u8),
}

impl ComponentValue {
    pub fn new<T: Component>(kind: ComponentKind, value: T) -> Self {
        Self {
            kind,
            type_id: TypeId::of::<T>(),
            value: Box::new(value),
            write_fn: write_erased::<T>,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Move the payload into `dst`.
    ///
    /// # Safety
    /// `dst` must point to uninitialized, properly aligned storage for the
    /// payload's concrete type; the caller must have verified the type via
    /// the registry.
    pub unsafe fn write_to(self, dst: *mut u8) {
        (self.write_fn)(self.value, dst);
    }
}

impl std::fmt::Debug for ComponentValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentValue")
            .field("kind", &self.kind)
            .finish()
    }
}

unsafe fn write_erased<T: Component>(value: Box<dyn Any + Send + Sync>, dst: *mut u8) {
    if let Ok(value) = value.downcast::<T>() {
        std::ptr::write(dst.cast::<T>(), *value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Health(u32);

    #[test]
    fn test_registration_order_defines_kinds() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<u32>("A").unwrap();
        let b = reg.register::<f32>("B").unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(reg.kind_count(), 2);
        assert_eq!(reg.name(a), "A");
        assert_eq!(reg.kind_of::<f32>().unwrap(), b);
    }

    #[test]
    fn test_duplicate_registration_is_idempotent() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<u32>("A").unwrap();
        let again = reg.register::<u32>("A").unwrap();
        assert_eq!(a, again);
        assert_eq!(reg.kind_count(), 1);
    }

    #[test]
    fn test_type_check() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<Health>("Health").unwrap();
        assert!(reg.check_type(a, TypeId::of::<Health>()).is_ok());
        assert_eq!(
            reg.check_type(a, TypeId::of::<u32>()),
            Err(EcsError::ComponentTypeMismatch("Health".to_string()))
        );
    }

    #[test]
    fn test_component_value_roundtrip() {
        let kind = ComponentKind::new(0);
        let value = ComponentValue::new(kind, Health(7));
        assert_eq!(value.type_id(), TypeId::of::<Health>());

        let mut slot = std::mem::MaybeUninit::<Health>::uninit();
        unsafe {
            value.write_to(slot.as_mut_ptr().cast());
            assert_eq!(slot.assume_init(), Health(7));
        }
    }
}
