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

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{instrument, Span};

use crate::error::HvError;
use crate::log_then_return;
use crate::mem::ept::IdentityMap;
use crate::mem::{PoolAllocator, RegionAllocator};
use crate::Result;

/// One slot of the sandbox table.
///
/// State machine per slot: Free -> (create) -> Active -> (destroy |
/// table shutdown) -> Free. An active slot always carries a non-zero id
/// and a built identity map.
#[derive(Default)]
struct SandboxEntry {
    active: bool,
    id: u32,
    created: Option<Instant>,
    ept: IdentityMap,
}

impl SandboxEntry {
    fn reset(&mut self) {
        self.ept.destroy();
        self.active = false;
        self.id = 0;
        self.created = None;
    }
}

/// A fixed-capacity, mutex-guarded registry of sandbox contexts, each
/// owning one placeholder identity map.
///
/// Every read and mutation of the slot array happens under the table
/// mutex, so observers never see a half-updated slot. Critical sections
/// stay allocation-free and bounded by the table capacity: identity maps
/// are built before the lock is taken and torn down after it is
/// released wherever the contract allows.
pub struct SandboxTable {
    entries: Mutex<Vec<SandboxEntry>>,
    allocator: Arc<dyn RegionAllocator>,
}

impl SandboxTable {
    /// Active sandboxes the table can hold simultaneously.
    pub const MAX_SANDBOXES: usize = 16;

    /// Create a table with every slot free, using the default
    /// allocator.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(PoolAllocator))
    }

    /// Create a table with a caller-supplied allocator for the identity
    /// maps.
    pub fn with_allocator(allocator: Arc<dyn RegionAllocator>) -> Self {
        let entries = (0..Self::MAX_SANDBOXES)
            .map(|_| SandboxEntry::default())
            .collect();
        log::info!(
            "SandboxTable: ready (capacity={})",
            Self::MAX_SANDBOXES
        );
        Self {
            entries: Mutex::new(entries),
            allocator,
        }
    }

    /// Create a sandbox with the caller-supplied non-zero id.
    ///
    /// Fails with `InvalidParameter` for id 0, `NameCollision` if the id
    /// is already active, `InsufficientResources` if every slot is
    /// taken or the identity-map allocation fails. On any failure no
    /// record of the id exists.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn create_sandbox(&self, id: u32) -> Result<()> {
        if id == 0 {
            return Err(HvError::InvalidParameter("sandbox id must be non-zero"));
        }

        // Built before the lock: the critical section must not allocate.
        let mut ept = IdentityMap::new();
        if let Err(e) = ept.build_identity_map(self.allocator.as_ref()) {
            log_then_return!(e);
        }

        // Scope the guard so the loser's pre-built map is destroyed
        // after the lock is released.
        let insert_result = {
            let mut entries = self.entries.lock()?;

            if entries.iter().any(|e| e.active && e.id == id) {
                Err(HvError::NameCollision(id))
            } else {
                match entries.iter_mut().find(|e| !e.active) {
                    None => Err(HvError::InsufficientResources("sandbox table full")),
                    Some(slot) => {
                        slot.ept = std::mem::take(&mut ept);
                        slot.id = id;
                        slot.active = true;
                        slot.created = Some(Instant::now());
                        Ok((slot.ept.page_count(), slot.ept.byte_size()))
                    }
                }
            }
        };

        match insert_result {
            Ok((pages, bytes)) => {
                log::info!(
                    "SandboxTable: id={} created (ept_pages={}, bytes={})",
                    id,
                    pages,
                    bytes
                );
                Ok(())
            }
            Err(e) => {
                ept.destroy();
                log_then_return!(e);
            }
        }
    }

    /// Destroy the active sandbox with the given id, releasing its
    /// identity map and freeing the slot.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn destroy_sandbox(&self, id: u32) -> Result<()> {
        if id == 0 {
            return Err(HvError::InvalidParameter("sandbox id must be non-zero"));
        }

        let mut entries = self.entries.lock()?;
        let Some(slot) = entries.iter_mut().find(|e| e.active && e.id == id) else {
            return Err(HvError::NotFound(id));
        };
        let age = slot.created.map(|t| t.elapsed());
        slot.reset();
        drop(entries);

        log::info!("SandboxTable: id={} destroyed (age={:?})", id, age);
        Ok(())
    }

    /// List active sandbox ids in ascending slot order.
    ///
    /// Returns the total number of active sandboxes. When a buffer is
    /// supplied, ids are written into its prefix as they are found; if
    /// the buffer is smaller than the total, the call returns
    /// `BufferTooSmall` — the first `capacity` ids have already been
    /// written by then, so treat partial output as usable only if you
    /// explicitly accept it.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn list_sandboxes(&self, out_ids: Option<&mut [u32]>) -> Result<u32> {
        let capacity = out_ids.as_ref().map(|b| b.len() as u32);
        let mut needed: u32 = 0;
        {
            let entries = self.entries.lock()?;
            let mut out_ids = out_ids;
            for entry in entries.iter().filter(|e| e.active) {
                if let Some(buf) = out_ids.as_deref_mut() {
                    if (needed as usize) < buf.len() {
                        buf[needed as usize] = entry.id;
                    }
                }
                needed += 1;
            }
        }

        match capacity {
            Some(capacity) if capacity < needed => {
                Err(HvError::BufferTooSmall { needed, capacity })
            }
            _ => Ok(needed),
        }
    }

    /// Count active sandboxes.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn get_active_count(&self) -> Result<u32> {
        let entries = self.entries.lock()?;
        Ok(entries.iter().filter(|e| e.active).count() as u32)
    }

    /// Destroy every active sandbox and return every slot to Free.
    /// Idempotent.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn shutdown(&self) -> Result<()> {
        let mut entries = self.entries.lock()?;
        for entry in entries.iter_mut().filter(|e| e.active) {
            entry.reset();
        }
        drop(entries);

        log::info!("SandboxTable: all sandboxes cleared");
        Ok(())
    }
}

impl Default for SandboxTable {
    fn default() -> Self {
        Self::new()
    }
}
