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

//! Entity builder: the typed record used to create an entity.
//!
//! Required components of the target pool must be present; optional ones may
//! be absent. The builder's component set uniquely determines the entity's
//! initial mask. Setting the same kind twice keeps the last value, matching
//! one-field-per-component record semantics.

use smallvec::SmallVec;

use crate::component::{Component, ComponentKind, ComponentValue};
use crate::mask::{self, Mask};

#[derive(Default, Debug)]
pub struct EntityBuilder {
    components: SmallVec<[ComponentValue; 8]>,
}

impl EntityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chainable typed insert.
    pub fn with<T: Component>(mut self, kind: ComponentKind, value: T) -> Self {
        self.set(ComponentValue::new(kind, value));
        self
    }

    pub fn set(&mut self, value: ComponentValue) {
        if let Some(existing) = self
            .components
            .iter_mut()
            .find(|c| c.kind() == value.kind())
        {
            *existing = value;
        } else {
            self.components.push(value);
        }
    }

    /// Initial mask of the entity this builder creates.
    pub fn mask(&self) -> Mask {
        self.components
            .iter()
            .fold(mask::EMPTY, |m, c| mask::add(m, c.kind()))
    }

    pub fn components(&self) -> &[ComponentValue] {
        &self.components
    }

    pub fn into_components(self) -> SmallVec<[ComponentValue; 8]> {
        self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
