/*
Copyright 2025  The hvcore Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::HvError;
use crate::mem::PAGE_SIZE;
use crate::Result;

/// A four-byte diagnostic tag carried by every [`TaggedBuffer`], the host
/// port of a kernel pool tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tag(pub [u8; 4]);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// An owned, tagged allocation with a page-aligned usable window.
///
/// The raw block is one page larger than the usable size; the usable
/// window starts at the first page boundary at or above the raw base and
/// is zeroed on construction. The raw block is released when the buffer
/// is dropped, on every exit path.
pub struct TaggedBuffer {
    raw: NonNull<u8>,
    layout: Layout,
    // offset of the page-aligned usable window within the raw block
    aligned_offset: usize,
    size: usize,
    tag: Tag,
}

impl TaggedBuffer {
    /// Allocate `size + PAGE_SIZE` raw bytes, round the base up to the
    /// next page boundary, and zero exactly `size` bytes from the
    /// aligned address.
    ///
    /// Returns `InsufficientResources` if the underlying allocation
    /// fails and `InvalidParameter` for a zero size.
    pub fn zeroed(size: usize, tag: Tag) -> Result<Self> {
        if size == 0 {
            return Err(HvError::InvalidParameter("zero-sized tagged buffer"));
        }

        let raw_size = size
            .checked_add(PAGE_SIZE)
            .ok_or(HvError::InvalidParameter("tagged buffer size overflow"))?;
        let layout = Layout::from_size_align(raw_size, std::mem::align_of::<u64>())
            .map_err(|_| HvError::InvalidParameter("unrepresentable buffer layout"))?;

        // SAFETY: layout has non-zero size and a valid alignment.
        let raw = unsafe { alloc(layout) };
        let Some(raw) = NonNull::new(raw) else {
            return Err(HvError::InsufficientResources("tagged buffer allocation"));
        };

        let raw_addr = raw.as_ptr() as usize;
        let aligned_addr = (raw_addr + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1);
        let aligned_offset = aligned_addr - raw_addr;

        // SAFETY: aligned_offset < PAGE_SIZE, so [aligned, aligned + size)
        // lies inside the raw_size-byte block.
        unsafe {
            std::ptr::write_bytes(raw.as_ptr().add(aligned_offset), 0, size);
        }

        log::trace!(
            "TaggedBuffer: allocated {} bytes (tag={}, aligned at +{:#x})",
            size,
            tag,
            aligned_offset
        );

        Ok(Self {
            raw,
            layout,
            aligned_offset,
            size,
            tag,
        })
    }

    /// The page-aligned start of the usable window.
    pub fn aligned_ptr(&self) -> *const u8 {
        // SAFETY: aligned_offset is in bounds of the raw block.
        unsafe { self.raw.as_ptr().add(self.aligned_offset) }
    }

    /// The usable size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the usable window is empty; never true for a constructed
    /// buffer.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The diagnostic tag this buffer carries.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The usable window as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the window is owned, initialized (zeroed) and in bounds.
        unsafe { std::slice::from_raw_parts(self.aligned_ptr(), self.size) }
    }

    /// The usable window as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for as_slice, plus &mut self guarantees exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(self.raw.as_ptr().add(self.aligned_offset), self.size)
        }
    }

    /// The usable window viewed as 64-bit entries. The window is page
    /// aligned, so the cast alignment always holds; trailing bytes past
    /// the last full entry are not included.
    pub fn as_mut_u64_slice(&mut self) -> &mut [u64] {
        let entries = self.size / std::mem::size_of::<u64>();
        // SAFETY: page alignment satisfies u64 alignment, and
        // entries * 8 <= size keeps the view in bounds.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.raw.as_ptr().add(self.aligned_offset) as *mut u64,
                entries,
            )
        }
    }

    /// As [`Self::as_mut_u64_slice`], read-only.
    pub fn as_u64_slice(&self) -> &[u64] {
        let entries = self.size / std::mem::size_of::<u64>();
        // SAFETY: see as_mut_u64_slice.
        unsafe { std::slice::from_raw_parts(self.aligned_ptr() as *const u64, entries) }
    }
}

impl Drop for TaggedBuffer {
    fn drop(&mut self) {
        log::trace!("TaggedBuffer: freeing {} bytes (tag={})", self.size, self.tag);
        // SAFETY: raw was produced by alloc with this exact layout and is
        // released exactly once (Drop).
        unsafe { dealloc(self.raw.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for TaggedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedBuffer")
            .field("tag", &format_args!("{}", self.tag))
            .field("len", &self.size)
            .field("aligned_ptr", &self.aligned_ptr())
            .finish()
    }
}

// SAFETY: the buffer exclusively owns its heap block; no aliasing pointers
// escape except through &self/&mut self borrows.
unsafe impl Send for TaggedBuffer {}
// SAFETY: shared references only permit reads of the owned block.
unsafe impl Sync for TaggedBuffer {}

/// The allocation seam for control regions and translation tables.
///
/// The default [`PoolAllocator`] delegates to [`TaggedBuffer::zeroed`];
/// tests substitute failing allocators to exercise the all-or-nothing
/// rollback contracts.
pub trait RegionAllocator: Send + Sync {
    /// Allocate a zeroed, page-aligned, tagged buffer of `size` usable
    /// bytes.
    fn allocate(&self, size: usize, tag: Tag) -> Result<TaggedBuffer>;
}

/// The default allocator, backed by the process heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolAllocator;

impl RegionAllocator for PoolAllocator {
    fn allocate(&self, size: usize, tag: Tag) -> Result<TaggedBuffer> {
        TaggedBuffer::zeroed(size, tag)
    }
}

/// Fails every allocation after the first `n` succeed; used by the
/// rollback tests in the hypervisor and sandbox modules.
#[cfg(test)]
pub(crate) struct FailAfter {
    remaining: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl FailAfter {
    pub(crate) fn new(successes: u32) -> Self {
        Self {
            remaining: std::sync::atomic::AtomicU32::new(successes),
        }
    }
}

#[cfg(test)]
impl RegionAllocator for FailAfter {
    fn allocate(&self, size: usize, tag: Tag) -> Result<TaggedBuffer> {
        use std::sync::atomic::Ordering;
        let prev = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .ok();
        match prev {
            Some(_) => TaggedBuffer::zeroed(size, tag),
            None => Err(HvError::InsufficientResources("forced allocation failure")),
        }
    }
}
