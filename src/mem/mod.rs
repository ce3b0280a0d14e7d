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

/// The placeholder second-level translation table owned by a sandbox.
pub mod ept;
/// Best-effort virtual-to-physical translation.
pub(crate) mod phys;
/// Ownership-tracked tagged allocations.
pub mod tagged;

pub use tagged::{PoolAllocator, RegionAllocator, Tag, TaggedBuffer};

/// The page size every region and table in this crate is aligned and
/// sized against.
pub const PAGE_SIZE: usize = 0x1000;
