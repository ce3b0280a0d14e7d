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

//! Capability probing: cpuid feature detection and fallible reads of the
//! VMX capability-reporting MSRs.
//!
//! MSR reads are privileged; in a host process they go through the msr
//! device node and routinely fail without root. Every failure surfaces
//! as [`HvError::PrivilegedReadFault`] and the caller substitutes a
//! default value — capability probing degrades, it never aborts.

use bitflags::bitflags;

use crate::error::HvError;
use crate::mem::PAGE_SIZE;
use crate::Result;

/// IA32_FEATURE_CONTROL MSR index
pub const IA32_FEATURE_CONTROL: u32 = 0x3A;
/// IA32_VMX_BASIC MSR index
pub const IA32_VMX_BASIC: u32 = 0x480;

bitflags! {
    /// Relevant bits of IA32_FEATURE_CONTROL.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// BIOS has locked the register; VMXON legality is final.
        const LOCKED = 1;
        /// VMXON permitted inside SMX operation.
        const VMXON_IN_SMX = 1 << 1;
        /// VMXON permitted outside SMX operation.
        const VMXON_OUTSIDE_SMX = 1 << 2;
    }
}

/// Whether cpuid leaf 1 reports VMX (ECX bit 5).
///
/// A hypervisor hosting this process may mask the bit even on capable
/// hardware.
pub(crate) fn cpuid_reports_vmx() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            // SAFETY: cpuid leaf 1 is valid on every x86-64 processor.
            let regs = unsafe { core::arch::x86_64::__cpuid(1) };
            regs.ecx & (1 << 5) != 0
        } else {
            false
        }
    }
}

/// Read an MSR by its 32-bit index from logical processor 0.
///
/// Any failure (missing msr device node, insufficient privilege, short
/// read) is reported as `PrivilegedReadFault`; callers are expected to
/// recover locally.
pub(crate) fn read_msr(index: u32) -> Result<u64> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            use std::fs::File;
            use std::io::{Read, Seek, SeekFrom};

            // The msr device exposes one 8-byte register per file offset.
            let fault = |_| HvError::PrivilegedReadFault(index);
            let mut file = File::open("/dev/cpu/0/msr").map_err(fault)?;
            file.seek(SeekFrom::Start(index as u64)).map_err(fault)?;
            let mut value = [0u8; 8];
            file.read_exact(&mut value).map_err(fault)?;
            Ok(u64::from_le_bytes(value))
        } else {
            Err(HvError::PrivilegedReadFault(index))
        }
    }
}

/// The VMCS revision identifier, bits 30:0 of IA32_VMX_BASIC.
pub(crate) fn vmx_basic_revision_id(vmx_basic: u64) -> u32 {
    (vmx_basic & 0x7FFF_FFFF) as u32
}

/// The suggested per-processor control-region size, bits 43:32 of
/// IA32_VMX_BASIC; one page when the field is zero or below one page.
pub(crate) fn vmx_basic_region_size(vmx_basic: u64) -> u32 {
    let field = ((vmx_basic >> 32) & 0xFFF) as u32;
    if field == 0 || (field as usize) < PAGE_SIZE {
        PAGE_SIZE as u32
    } else {
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_size_defaults_to_one_page() {
        assert_eq!(vmx_basic_region_size(0), PAGE_SIZE as u32);
        assert_eq!(vmx_basic_region_size(0x500 << 32), PAGE_SIZE as u32);
        assert_eq!(vmx_basic_region_size(0x1000 << 32), 0x1000);
    }

    #[test]
    fn revision_id_masks_high_bit() {
        assert_eq!(vmx_basic_revision_id(0xFFFF_FFFF), 0x7FFF_FFFF);
        assert_eq!(vmx_basic_revision_id(0x12 | (0x1000 << 32)), 0x12);
    }

    #[test]
    fn feature_control_decodes() {
        let flags = FeatureControlFlags::from_bits_truncate(0b101);
        assert!(flags.contains(FeatureControlFlags::LOCKED));
        assert!(flags.contains(FeatureControlFlags::VMXON_OUTSIDE_SMX));
        assert!(!flags.contains(FeatureControlFlags::VMXON_IN_SMX));
    }

    #[test]
    fn msr_read_fault_is_typed() {
        // Whatever the environment, a failure must be the recoverable kind.
        if let Err(e) = read_msr(IA32_VMX_BASIC) {
            assert!(matches!(e, HvError::PrivilegedReadFault(IA32_VMX_BASIC)));
        }
    }
}
