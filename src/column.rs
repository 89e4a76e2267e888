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

//! Type-erased SoA component column.
//!
//! One column stores the values of a single component kind as a raw,
//! properly aligned buffer. Columns do not track which slots are live; the
//! owning pool does, and the owning pool drops live values before the column
//! releases its buffer.

use std::alloc::{self, Layout};
use std::any::TypeId;
use std::ptr::NonNull;

use crate::component::ComponentInfo;

pub struct ComponentColumn {
    data: NonNull<u8>,
    cap: usize,
    item_size: usize,
    align: usize,
    type_id: TypeId,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

impl ComponentColumn {
    pub fn for_info(info: &ComponentInfo) -> Self {
        Self {
            data: NonNull::dangling(),
            cap: 0,
            item_size: info.item_size,
            align: info.align.max(1),
            type_id: info.type_id,
            drop_fn: info.drop_fn,
        }
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Grow so that `items` slots are addressable. Existing bytes are
    /// preserved; new slots are uninitialized.
    pub fn ensure_capacity(&mut self, items: usize) {
        if items > self.cap {
            let new_cap = items.max(self.cap * 2).max(4);
            self.grow_to(new_cap);
        }
    }

    pub fn ptr(&self, index: usize) -> *const u8 {
        debug_assert!(index < self.cap || self.item_size == 0);
        if self.item_size == 0 {
            return self.align as *const u8;
        }
        unsafe { self.data.as_ptr().add(index * self.item_size) }
    }

    pub fn ptr_mut(&mut self, index: usize) -> *mut u8 {
        debug_assert!(index < self.cap || self.item_size == 0);
        if self.item_size == 0 {
            return self.align as *mut u8;
        }
        unsafe { self.data.as_ptr().add(index * self.item_size) }
    }

    /// Typed read of a live slot. Returns None on a type mismatch.
    pub fn get<T: 'static>(&self, index: usize) -> Option<&T> {
        if TypeId::of::<T>() != self.type_id {
            return None;
        }
        // SAFETY: type checked above; the owner guarantees the slot is live.
        Some(unsafe { &*(self.ptr(index) as *const T) })
    }

    /// Typed write access to a live slot. Returns None on a type mismatch.
    pub fn get_mut<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        if TypeId::of::<T>() != self.type_id {
            return None;
        }
        // SAFETY: type checked above; the owner guarantees the slot is live.
        Some(unsafe { &mut *(self.ptr_mut(index) as *mut T) })
    }

    /// Drop the value at `index` in place. The slot bytes become garbage.
    pub fn drop_at(&mut self, index: usize) {
        if let Some(drop_fn) = self.drop_fn {
            unsafe { drop_fn(self.ptr_mut(index)) };
        }
    }

    /// Raw copy of one slot into another column of the same kind. The source
    /// slot must not be dropped afterwards; ownership moves with the bytes.
    pub fn copy_slot_to(&self, index: usize, dst: &mut ComponentColumn, dst_index: usize) {
        debug_assert_eq!(self.type_id, dst.type_id);
        if self.item_size == 0 {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(index), dst.ptr_mut(dst_index), self.item_size);
        }
    }

    /// Raw copy of slot `from` over slot `to` within this column. Used by
    /// swap-remove after the vacated slot's value has been dropped or moved.
    pub fn copy_within(&mut self, from: usize, to: usize) {
        if self.item_size == 0 || from == to {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.as_ptr().add(from * self.item_size),
                self.data.as_ptr().add(to * self.item_size),
                self.item_size,
            );
        }
    }

    fn grow_to(&mut self, new_cap: usize) {
        if self.item_size == 0 {
            self.cap = new_cap;
            return;
        }
        let new_layout = Layout::from_size_align(self.item_size * new_cap, self.align)
            .expect("component column layout overflow");
        let new_ptr = unsafe {
            if self.cap == 0 {
                alloc::alloc(new_layout)
            } else {
                let old_layout =
                    Layout::from_size_align_unchecked(self.item_size * self.cap, self.align);
                alloc::realloc(self.data.as_ptr(), old_layout, new_layout.size())
            }
        };
        let Some(ptr) = NonNull::new(new_ptr) else {
            alloc::handle_alloc_error(new_layout);
        };
        self.data = ptr;
        self.cap = new_cap;
    }
}

impl Drop for ComponentColumn {
    fn drop(&mut self) {
        // Live values were already dropped by the owning pool.
        if self.item_size != 0 && self.cap != 0 {
            unsafe {
                let layout =
                    Layout::from_size_align_unchecked(self.item_size * self.cap, self.align);
                alloc::dealloc(self.data.as_ptr(), layout);
            }
        }
    }
}

// SAFETY: the buffer only ever holds values of a single component type, and
// Component requires Send + Sync. Access goes through the owning pool.
unsafe impl Send for ComponentColumn {}
unsafe impl Sync for ComponentColumn {}
