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

use tracing::{instrument, Span};

use crate::hypervisor::VmxManager;
use crate::mem::ept::IdentityMap;
use crate::mem::{PoolAllocator, RegionAllocator};
use crate::sandbox::SandboxTable;
use crate::Result;

/// The process-wide core state: one capability/region manager, one
/// sandbox table, and one demonstration identity map for the BUILD_EPT
/// request.
///
/// Construct exactly one at startup and pass it by reference to every
/// entry point; tear it down once with [`HvContext::shutdown`]. The
/// sandbox table is internally locked; the VMX manager requires external
/// serialization and the context's own mutex provides it.
pub struct HvContext {
    pub(crate) vmx: Mutex<VmxManager>,
    pub(crate) sandboxes: SandboxTable,
    pub(crate) demo_ept: Mutex<IdentityMap>,
    pub(crate) allocator: Arc<dyn RegionAllocator>,
}

impl HvContext {
    /// Initialize the core: probe capability, allocate the per-CPU
    /// state array, and reset the sandbox table.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn new() -> Result<Self> {
        Self::with_allocator(Arc::new(PoolAllocator))
    }

    /// As [`HvContext::new`], with a caller-supplied region allocator.
    pub fn with_allocator(allocator: Arc<dyn RegionAllocator>) -> Result<Self> {
        log::info!("HvContext: initializing core");

        let mut vmx = VmxManager::with_allocator(allocator.clone());
        vmx.initialize()?;

        let ctx = Self {
            vmx: Mutex::new(vmx),
            sandboxes: SandboxTable::with_allocator(allocator.clone()),
            demo_ept: Mutex::new(IdentityMap::new()),
            allocator,
        };

        log::info!("HvContext: core initialized");
        Ok(ctx)
    }

    /// Access the capability/region manager under the context's
    /// serializing mutex.
    pub fn vmx(&self) -> &Mutex<VmxManager> {
        &self.vmx
    }

    /// The sandbox registry.
    pub fn sandboxes(&self) -> &SandboxTable {
        &self.sandboxes
    }

    /// Tear the core down: destroy every sandbox, free all per-CPU
    /// regions and state, and release the demo identity map.
    /// Idempotent; also runs implicitly through buffer ownership when
    /// the context is dropped.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn shutdown(&self) -> Result<()> {
        log::info!("HvContext: shutting down core");
        self.sandboxes.shutdown()?;
        self.vmx.lock()?.shutdown();
        self.demo_ept.lock()?.destroy();
        log::info!("HvContext: shutdown complete");
        Ok(())
    }
}
