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

use crate::mem::{RegionAllocator, Tag, TaggedBuffer, PAGE_SIZE};
use crate::Result;

const EPT_TAG: Tag = Tag(*b"eptp");

/// Number of page-units standing in for the levels of a real 4-level
/// translation hierarchy.
const TABLE_PAGES: usize = 4;
/// Synthetic entries stamped into the top-level table.
const ENTRY_COUNT: usize = 512;
/// Low-bit mask marking an entry present, readable, writable and
/// executable.
const ENTRY_RWX: u64 = 0x7;

/// A placeholder second-level translation table owned by one sandbox.
///
/// A functional implementation would build a pointer-linked 4-level
/// hierarchy here; this one allocates a flat block of [`TABLE_PAGES`]
/// pages and stamps [`ENTRY_COUNT`] synthetic identity entries so the
/// surrounding lifecycle (ownership, rollback, teardown) is exercised
/// for real. Nothing walks these entries.
#[derive(Debug, Default)]
pub struct IdentityMap {
    table: Option<TaggedBuffer>,
    page_count: u64,
    byte_size: u64,
}

impl IdentityMap {
    /// Create an unbuilt instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the table block and stamp the synthetic identity
    /// entries: entry `i` is `(i << 12) | 0x7`, the low three bits
    /// marking present/read/write/execute.
    ///
    /// Returns `InsufficientResources` if the allocation fails; the
    /// instance stays unbuilt in that case. Building an already-built
    /// instance replaces the previous table.
    pub fn build_identity_map(&mut self, allocator: &dyn RegionAllocator) -> Result<()> {
        log::info!("IdentityMap: building placeholder table");

        let mut table = allocator.allocate(TABLE_PAGES * PAGE_SIZE, EPT_TAG)?;

        let entries = table.as_mut_u64_slice();
        for (i, entry) in entries.iter_mut().take(ENTRY_COUNT).enumerate() {
            *entry = ((i as u64) << 12) | ENTRY_RWX;
        }

        self.table = Some(table);
        self.page_count = TABLE_PAGES as u64;
        self.byte_size = (TABLE_PAGES * PAGE_SIZE) as u64;

        log::info!(
            "IdentityMap: allocated {} bytes ({} pages), {} entries stamped",
            self.byte_size,
            self.page_count,
            ENTRY_COUNT
        );
        Ok(())
    }

    /// Release the table block and reset the counters. A no-op on an
    /// unbuilt or already-destroyed instance.
    pub fn destroy(&mut self) {
        if self.table.take().is_some() {
            self.page_count = 0;
            self.byte_size = 0;
            log::info!("IdentityMap: freed table");
        }
    }

    /// Whether a table block is currently held.
    pub fn is_built(&self) -> bool {
        self.table.is_some()
    }

    /// Pages held by the table, 0 when unbuilt.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Bytes held by the table, 0 when unbuilt.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// The stamped entries; empty when unbuilt.
    pub fn entries(&self) -> &[u64] {
        match &self.table {
            Some(table) => &table.as_u64_slice()[..ENTRY_COUNT],
            None => &[],
        }
    }
}

// Dropping the TaggedBuffer releases the block; destroy() exists for the
// explicit-teardown paths (sandbox destruction, table shutdown).
