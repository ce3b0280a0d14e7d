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

/// Cpuid and MSR capability probing.
pub mod caps;

use std::sync::Arc;

use tracing::{instrument, Span};

use crate::error::HvError;
use crate::log_then_return;
use crate::mem::phys::virt_to_phys;
use crate::mem::{PoolAllocator, RegionAllocator, Tag, TaggedBuffer, PAGE_SIZE};
use crate::Result;

pub use caps::FeatureControlFlags;

const VMX_TAG: Tag = Tag(*b"vmxr");

/// One aligned control region attached to a logical processor: the
/// owned buffer plus the physical address of its aligned window.
#[derive(Debug)]
pub struct VmxRegion {
    buffer: TaggedBuffer,
    physical: u64,
}

impl VmxRegion {
    /// The page-aligned virtual address of the region.
    pub fn virtual_addr(&self) -> *const u8 {
        self.buffer.aligned_ptr()
    }

    /// The physical address of the region (best-effort, see
    /// `mem::phys`).
    pub fn physical_addr(&self) -> u64 {
        self.physical
    }

    /// Usable region size in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the region is empty; never true for an attached region.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Per-logical-processor VMX state.
#[derive(Debug, Default)]
pub struct VmxState {
    supported: bool,
    enabled: bool,
    vmxon: Option<VmxRegion>,
    // Reserved for the VM-control-structure region a functional port
    // would allocate next; nothing populates it today, but teardown
    // releases it so the lifecycle is already symmetric.
    vmcs: Option<VmxRegion>,
}

impl VmxState {
    /// Whether cpuid reported VMX support when this entry was created.
    pub fn supported(&self) -> bool {
        self.supported
    }

    /// Whether VMX operation has been turned on for this processor;
    /// always false in this core (no VM entry is performed).
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The VMX-on region, when allocated.
    pub fn vmxon(&self) -> Option<&VmxRegion> {
        self.vmxon.as_ref()
    }

    /// The VM-control-structure region, when allocated.
    pub fn vmcs(&self) -> Option<&VmxRegion> {
        self.vmcs.as_ref()
    }
}

/// Probes CPU virtualization capability and manages one aligned control
/// region per logical processor.
///
/// The manager has no internal locking: `initialize`, the region
/// operations and `shutdown` must be serialized by the owner.
/// [`crate::HvContext`] wraps the manager in a mutex and is that owner.
pub struct VmxManager {
    per_cpu: Vec<VmxState>,
    processor_count: u32,

    ia32_vmx_basic: u64,
    ia32_feature_control: u64,
    suggested_region_size: u32,

    vmx_supported: bool,

    allocator: Arc<dyn RegionAllocator>,
}

impl VmxManager {
    /// Create an uninitialized manager using the default allocator.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(PoolAllocator))
    }

    /// Create an uninitialized manager with a caller-supplied region
    /// allocator.
    pub fn with_allocator(allocator: Arc<dyn RegionAllocator>) -> Self {
        Self {
            per_cpu: Vec::new(),
            processor_count: 0,
            ia32_vmx_basic: 0,
            ia32_feature_control: 0,
            suggested_region_size: PAGE_SIZE as u32,
            vmx_supported: false,
            allocator,
        }
    }

    /// Probe CPU capability and allocate the per-processor state array.
    ///
    /// Capability MSR reads that trap are recovered as zero with a
    /// warning; a zero logical-processor count is fatal
    /// (`Unsuccessful`). Calling this on an already-initialized manager
    /// is an `InvalidDeviceState` error.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn initialize(&mut self) -> Result<()> {
        if !self.per_cpu.is_empty() {
            log_then_return!(HvError::InvalidDeviceState("VmxManager already initialized"));
        }

        log::info!("VmxManager: beginning capability checks");

        self.vmx_supported = caps::cpuid_reports_vmx();
        if self.vmx_supported {
            log::info!("VmxManager: cpuid reports vmx supported");
        } else {
            log::warn!("VmxManager: cpuid reports vmx NOT supported");
        }

        self.ia32_feature_control = match caps::read_msr(caps::IA32_FEATURE_CONTROL) {
            Ok(value) => {
                log::info!("VmxManager: IA32_FEATURE_CONTROL (0x3A) = {:#x}", value);
                value
            }
            Err(_) => {
                log::warn!("VmxManager: reading IA32_FEATURE_CONTROL faulted, assuming 0");
                0
            }
        };
        let fc = FeatureControlFlags::from_bits_truncate(self.ia32_feature_control);
        log::info!(
            "VmxManager: feature control locked={}, vmxon outside smx={}",
            fc.contains(FeatureControlFlags::LOCKED),
            fc.contains(FeatureControlFlags::VMXON_OUTSIDE_SMX)
        );

        match caps::read_msr(caps::IA32_VMX_BASIC) {
            Ok(value) => {
                self.ia32_vmx_basic = value;
                log::info!(
                    "VmxManager: IA32_VMX_BASIC (0x480) = {:#x}, revision id = {:#x}",
                    value,
                    caps::vmx_basic_revision_id(value)
                );
                self.suggested_region_size = caps::vmx_basic_region_size(value);
            }
            Err(_) => {
                log::warn!("VmxManager: reading IA32_VMX_BASIC faulted, assuming 0");
                self.ia32_vmx_basic = 0;
                self.suggested_region_size = PAGE_SIZE as u32;
            }
        }
        log::info!(
            "VmxManager: suggested region size = {} bytes",
            self.suggested_region_size
        );

        let count = match std::thread::available_parallelism() {
            Ok(count) => count.get() as u32,
            Err(e) => {
                log_then_return!(HvError::Unsuccessful(format!(
                    "logical processor count unavailable: {e}"
                )));
            }
        };

        let mut per_cpu = Vec::new();
        if per_cpu.try_reserve_exact(count as usize).is_err() {
            log_then_return!(HvError::InsufficientResources("per-CPU state array"));
        }
        for _ in 0..count {
            per_cpu.push(VmxState {
                supported: self.vmx_supported,
                enabled: false,
                vmxon: None,
                vmcs: None,
            });
        }
        self.per_cpu = per_cpu;
        self.processor_count = count;

        log::info!(
            "VmxManager: initialized: cpu_count={}, vmx_supported={}, suggested_region={}",
            self.processor_count,
            self.vmx_supported,
            self.suggested_region_size
        );
        Ok(())
    }

    /// Allocate one aligned VMX-on region per logical processor.
    ///
    /// All-or-nothing: if allocation fails at processor `k`, every
    /// region attached for processors below `k` is freed before
    /// `InsufficientResources` is returned, and no per-CPU entry keeps a
    /// region.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn allocate_vmxon_region(&mut self) -> Result<()> {
        if self.per_cpu.is_empty() {
            log_then_return!(HvError::InvalidDeviceState("per-CPU state not initialized"));
        }

        log::info!("VmxManager: allocating vmxon regions per cpu");

        let size = self.suggested_region_size as usize;
        for i in 0..self.per_cpu.len() {
            let buffer = match self.allocator.allocate(size, VMX_TAG) {
                Ok(buffer) => buffer,
                Err(_) => {
                    log::error!("VmxManager: vmxon allocation failed on cpu {}", i);
                    for entry in &mut self.per_cpu[..i] {
                        entry.vmxon = None;
                    }
                    return Err(HvError::InsufficientResources("vmxon region"));
                }
            };

            let physical = virt_to_phys(buffer.aligned_ptr() as usize);
            log::info!(
                "VmxManager: cpu={} vmxon_virtual={:p} vmxon_physical={:#x}",
                i,
                buffer.aligned_ptr(),
                physical
            );
            self.per_cpu[i].vmxon = Some(VmxRegion { buffer, physical });
        }

        Ok(())
    }

    /// Free any region attached to a per-CPU entry. Idempotent; a no-op
    /// on already-freed entries and on an uninitialized manager.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn free_vmxon_region(&mut self) {
        for entry in &mut self.per_cpu {
            entry.vmxon = None;
            entry.vmcs = None;
        }
    }

    /// Free all regions and the per-CPU state array. Idempotent.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn shutdown(&mut self) {
        log::info!("VmxManager: shutdown, freeing resources");
        self.free_vmxon_region();
        self.per_cpu = Vec::new();
        self.processor_count = 0;
        log::info!("VmxManager: shutdown complete");
    }

    /// Whether cpuid reported VMX support at initialization.
    pub fn is_vmx_supported(&self) -> bool {
        self.vmx_supported
    }

    /// Whether the per-CPU state array exists.
    pub fn is_initialized(&self) -> bool {
        !self.per_cpu.is_empty()
    }

    /// Logical processors discovered at initialization; 0 before
    /// `initialize` and after `shutdown`.
    pub fn processor_count(&self) -> u32 {
        self.processor_count
    }

    /// The per-processor control-region size suggested by
    /// IA32_VMX_BASIC, at least one page.
    pub fn suggested_region_size(&self) -> u32 {
        self.suggested_region_size
    }

    /// The raw IA32_VMX_BASIC value (0 if the read faulted).
    pub fn vmx_basic(&self) -> u64 {
        self.ia32_vmx_basic
    }

    /// The decoded IA32_FEATURE_CONTROL flags (empty if the read
    /// faulted).
    pub fn feature_control(&self) -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(self.ia32_feature_control)
    }

    /// Whether firmware has locked the CPU with VMXON permitted outside
    /// SMX operation.
    pub fn vmxon_permitted(&self) -> bool {
        let fc = self.feature_control();
        fc.contains(FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_OUTSIDE_SMX)
    }

    /// Read-only view of the per-CPU state.
    pub fn per_cpu(&self) -> &[VmxState] {
        &self.per_cpu
    }

    /// Populate the per-CPU array directly, bypassing the host probe, so
    /// rollback behavior can be tested with a chosen processor count.
    #[cfg(test)]
    pub(crate) fn initialize_for_test(&mut self, cpus: u32) {
        assert!(self.per_cpu.is_empty());
        self.per_cpu = (0..cpus).map(|_| VmxState::default()).collect();
        self.processor_count = cpus;
    }
}

impl Default for VmxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::tagged::FailAfter;

    use super::*;

    #[test]
    fn allocate_before_initialize_is_invalid_state() {
        let mut vmx = VmxManager::new();
        let err = vmx.allocate_vmxon_region().unwrap_err();
        assert!(matches!(err, HvError::InvalidDeviceState(_)));
    }

    #[test]
    fn initialize_populates_per_cpu_state() {
        let mut vmx = VmxManager::new();
        vmx.initialize().unwrap();

        assert!(vmx.is_initialized());
        assert!(vmx.processor_count() > 0);
        assert_eq!(vmx.per_cpu().len(), vmx.processor_count() as usize);
        assert!(vmx.suggested_region_size() >= PAGE_SIZE as u32);
        for entry in vmx.per_cpu() {
            assert_eq!(entry.supported(), vmx.is_vmx_supported());
            assert!(!entry.enabled());
            assert!(entry.vmxon().is_none());
        }

        let err = vmx.initialize().unwrap_err();
        assert!(matches!(err, HvError::InvalidDeviceState(_)));
    }

    #[test]
    fn allocate_attaches_one_region_per_cpu() {
        let mut vmx = VmxManager::new();
        vmx.initialize_for_test(4);
        vmx.allocate_vmxon_region().unwrap();

        for entry in vmx.per_cpu() {
            let region = entry.vmxon().expect("region attached");
            assert_eq!(region.virtual_addr() as usize % PAGE_SIZE, 0);
            assert_eq!(region.len(), vmx.suggested_region_size() as usize);
            assert_ne!(region.physical_addr(), 0);
        }
    }

    #[test]
    fn allocation_failure_rolls_back_earlier_regions() {
        // Forced failure at processor index 2 of 4.
        let mut vmx = VmxManager::with_allocator(Arc::new(FailAfter::new(2)));
        vmx.initialize_for_test(4);

        let err = vmx.allocate_vmxon_region().unwrap_err();
        assert!(matches!(err, HvError::InsufficientResources(_)));
        for (i, entry) in vmx.per_cpu().iter().enumerate() {
            assert!(entry.vmxon().is_none(), "cpu {} kept a region", i);
        }
    }

    #[test]
    fn free_and_shutdown_are_idempotent() {
        let mut vmx = VmxManager::new();
        vmx.free_vmxon_region(); // uninitialized: no-op

        vmx.initialize_for_test(2);
        vmx.allocate_vmxon_region().unwrap();
        vmx.free_vmxon_region();
        assert!(vmx.per_cpu().iter().all(|e| e.vmxon().is_none()));
        vmx.free_vmxon_region(); // already freed: no-op

        vmx.shutdown();
        assert!(!vmx.is_initialized());
        assert_eq!(vmx.processor_count(), 0);
        vmx.shutdown();
    }
}
