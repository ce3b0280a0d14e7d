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

//! hvcore is a host-side x86-64 hardware-virtualization enablement core.
//! It probes the CPU for VMX capability, manages one aligned control
//! region per logical processor, and tracks a fixed-capacity table of
//! sandbox contexts, each owning a placeholder second-level translation
//! table.
//!
//! The crate is driven through [`dispatch::handle_request`] by an outer
//! shell that owns the transport; the shell, the logger implementation
//! and any client tooling live outside this crate. Logging goes through
//! the [`log`] facade and is emitted before the originating operation
//! returns.
//!
//! None of this performs a real VM entry: the identity map is a
//! structural placeholder and no multi-level translation walker exists
//! here.

#![warn(missing_docs)]

/// The process-wide context owning the managers; constructed once at
/// startup and passed by reference to every entry point.
pub mod context;
/// The typed request/response boundary consumed by the outer shell.
pub mod dispatch;
/// The error types for this crate.
pub mod error;
/// VMX capability probing and per-processor control-region lifecycle.
pub mod hypervisor;
/// Memory primitives: tagged buffers, the identity-map builder, and
/// best-effort physical translation.
pub mod mem;
/// The fixed-capacity sandbox registry.
pub mod sandbox;

pub use context::HvContext;
pub use dispatch::{handle_request, Request, Response, VmxCaps};
/// Re-export of the crate error type
pub use error::HvError;
pub use hypervisor::VmxManager;
pub use mem::ept::IdentityMap;
pub use sandbox::SandboxTable;

/// The universal `Result` type for this crate
pub type Result<T> = core::result::Result<T, error::HvError>;
