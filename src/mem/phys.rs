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

//! Best-effort virtual-to-physical translation for control regions.
//!
//! A privileged kernel port would ask the memory manager directly. In a
//! host process the only honest source is `/proc/self/pagemap`, and the
//! kernel masks frame numbers from unprivileged readers, so this helper
//! degrades to the virtual address itself as an explicit stand-in rather
//! than failing region allocation. The translation is diagnostic data
//! here; nothing walks it.

/// Translate a virtual address to a physical address, falling back to
/// the virtual address value when no authoritative answer is available.
pub(crate) fn virt_to_phys(va: usize) -> u64 {
    match pagemap_lookup(va) {
        Some(pa) => pa,
        None => {
            log::debug!(
                "virt_to_phys: no pagemap frame for {:#x}, using virtual address as stand-in",
                va
            );
            va as u64
        }
    }
}

#[cfg(target_os = "linux")]
fn pagemap_lookup(va: usize) -> Option<u64> {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    use crate::mem::PAGE_SIZE;

    // One 8-byte record per virtual page: bit 63 = present,
    // bits 54:0 = page frame number.
    const PAGEMAP_PRESENT: u64 = 1 << 63;
    const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

    let mut file = File::open("/proc/self/pagemap").ok()?;
    let record_offset = (va / PAGE_SIZE) as u64 * 8;
    file.seek(SeekFrom::Start(record_offset)).ok()?;

    let mut record = [0u8; 8];
    file.read_exact(&mut record).ok()?;
    let entry = u64::from_le_bytes(record);

    if entry & PAGEMAP_PRESENT == 0 {
        return None;
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    // Unprivileged readers see a zeroed PFN since Linux 4.2.
    if pfn == 0 {
        return None;
    }
    Some(pfn * PAGE_SIZE as u64 + (va % PAGE_SIZE) as u64)
}

#[cfg(not(target_os = "linux"))]
fn pagemap_lookup(_va: usize) -> Option<u64> {
    None
}
