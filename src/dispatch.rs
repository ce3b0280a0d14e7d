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

//! The request/response boundary consumed by the outer dispatch shell.
//!
//! Each request kind maps 1:1 to a core operation; the shell owns the
//! transport (device node, socket, whatever) and this module owns the
//! meaning. [`Request::parse`] additionally accepts the raw
//! little-endian function-code form for shells that forward control
//! requests verbatim.

use tracing::{instrument, Span};

use crate::context::HvContext;
use crate::error::HvError;
use crate::sandbox::SandboxTable;
use crate::Result;

/// Base of the function-code space; codes below it are reserved to the
/// shell.
pub const FUNCTION_BASE: u32 = 0x800;
/// Health check; no core call.
pub const FUNC_NOP: u32 = FUNCTION_BASE;
/// Read-only capability snapshot.
pub const FUNC_QUERY_CAPS: u32 = FUNCTION_BASE + 1;
/// Build the demonstration identity map.
pub const FUNC_BUILD_EPT: u32 = FUNCTION_BASE + 2;
/// Create a sandbox; payload is a little-endian u32 id.
pub const FUNC_SANDBOX_CREATE: u32 = FUNCTION_BASE + 10;
/// Destroy a sandbox; payload is a little-endian u32 id.
pub const FUNC_SANDBOX_DESTROY: u32 = FUNCTION_BASE + 11;
/// List active sandbox ids.
pub const FUNC_SANDBOX_LIST: u32 = FUNCTION_BASE + 12;

/// A typed control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Health check; completes without touching the core.
    Nop,
    /// Capability snapshot across both managers.
    QueryCaps,
    /// Build the context's demonstration identity map.
    BuildEpt,
    /// Create a sandbox with the given non-zero id.
    SandboxCreate {
        /// Caller-chosen sandbox id
        id: u32,
    },
    /// Destroy the sandbox with the given id.
    SandboxDestroy {
        /// Id of the sandbox to destroy
        id: u32,
    },
    /// List active sandbox ids.
    SandboxList {
        /// Most ids the caller can accept
        capacity: u32,
    },
}

impl Request {
    /// Decode a raw control request: a function code, an input payload,
    /// and the caller's output capacity in bytes.
    ///
    /// Unknown function codes fail with `InvalidDeviceRequest` before
    /// any core call; a short id payload is `InvalidParameter`.
    pub fn parse(code: u32, payload: &[u8], out_len: usize) -> Result<Self> {
        match code {
            FUNC_NOP => Ok(Request::Nop),
            FUNC_QUERY_CAPS => Ok(Request::QueryCaps),
            FUNC_BUILD_EPT => Ok(Request::BuildEpt),
            FUNC_SANDBOX_CREATE => Ok(Request::SandboxCreate {
                id: parse_id(payload)?,
            }),
            FUNC_SANDBOX_DESTROY => Ok(Request::SandboxDestroy {
                id: parse_id(payload)?,
            }),
            FUNC_SANDBOX_LIST => Ok(Request::SandboxList {
                capacity: (out_len / core::mem::size_of::<u32>()) as u32,
            }),
            unknown => {
                log::warn!("Request::parse: unknown function code {:#x}", unknown);
                Err(HvError::InvalidDeviceRequest(unknown))
            }
        }
    }
}

fn parse_id(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(HvError::InvalidParameter("id payload shorter than 4 bytes"))?;
    Ok(u32::from_le_bytes(bytes))
}

/// The capability snapshot returned by [`Request::QueryCaps`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmxCaps {
    /// Whether cpuid reported VMX support
    pub vmx_supported: bool,
    /// Logical processors discovered at initialization
    pub cpu_count: u32,
    /// Suggested per-processor control-region size in bytes
    pub suggested_region_size: u32,
    /// Pages held by the demonstration identity map (0 if unbuilt)
    pub ept_page_count: u32,
    /// Active sandboxes
    pub sandbox_count: u32,
}

/// A typed response, one variant per request kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// NOP completed.
    Nop,
    /// Capability snapshot.
    Caps(VmxCaps),
    /// The demonstration identity map was built.
    EptBuilt,
    /// The sandbox was created.
    SandboxCreated,
    /// The sandbox was destroyed.
    SandboxDestroyed,
    /// Active sandbox ids, ascending by slot index.
    SandboxList(Vec<u32>),
}

impl Response {
    /// Encode the response payload in the raw little-endian wire shape:
    /// the capability snapshot as five u32 fields (`vmx_supported` as
    /// 0/1), the id list as count * 4 bytes, everything else empty.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Nop
            | Response::EptBuilt
            | Response::SandboxCreated
            | Response::SandboxDestroyed => Vec::new(),
            Response::Caps(caps) => {
                let fields = [
                    caps.vmx_supported as u32,
                    caps.cpu_count,
                    caps.suggested_region_size,
                    caps.ept_page_count,
                    caps.sandbox_count,
                ];
                fields.iter().flat_map(|f| f.to_le_bytes()).collect()
            }
            Response::SandboxList(ids) => {
                ids.iter().flat_map(|id| id.to_le_bytes()).collect()
            }
        }
    }
}

/// Execute one typed request against the core.
///
/// Every failure is a specific [`HvError`] kind so the shell can map
/// each category to a distinct external status.
#[instrument(skip_all, parent = Span::current(), level = "Trace")]
pub fn handle_request(ctx: &HvContext, request: Request) -> Result<Response> {
    log::info!("handle_request: {:?}", request);

    match request {
        Request::Nop => Ok(Response::Nop),

        Request::QueryCaps => {
            let (vmx_supported, cpu_count, suggested_region_size) = {
                let vmx = ctx.vmx.lock()?;
                (
                    vmx.is_vmx_supported(),
                    vmx.processor_count(),
                    vmx.suggested_region_size(),
                )
            };
            let ept_page_count = ctx.demo_ept.lock()?.page_count() as u32;
            let sandbox_count = ctx.sandboxes.get_active_count()?;
            Ok(Response::Caps(VmxCaps {
                vmx_supported,
                cpu_count,
                suggested_region_size,
                ept_page_count,
                sandbox_count,
            }))
        }

        Request::BuildEpt => {
            // Rebuild outside any table lock; the demo map has its own.
            let mut ept = ctx.demo_ept.lock()?;
            ept.destroy();
            ept.build_identity_map(ctx.allocator.as_ref())?;
            Ok(Response::EptBuilt)
        }

        Request::SandboxCreate { id } => {
            ctx.sandboxes.create_sandbox(id)?;
            Ok(Response::SandboxCreated)
        }

        Request::SandboxDestroy { id } => {
            ctx.sandboxes.destroy_sandbox(id)?;
            Ok(Response::SandboxDestroyed)
        }

        Request::SandboxList { capacity } => {
            let capacity = (capacity as usize).min(SandboxTable::MAX_SANDBOXES);
            let mut ids = vec![0u32; capacity];
            let total = ctx.sandboxes.list_sandboxes(Some(&mut ids))? as usize;
            ids.truncate(total);
            Ok(Response::SandboxList(ids))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code_is_rejected_before_any_core_call() {
        let err = Request::parse(0x7ff, &[], 0).unwrap_err();
        assert!(matches!(err, HvError::InvalidDeviceRequest(0x7ff)));
    }

    #[test]
    fn id_payloads_decode_little_endian() {
        let req = Request::parse(FUNC_SANDBOX_CREATE, &42u32.to_le_bytes(), 0).unwrap();
        assert_eq!(req, Request::SandboxCreate { id: 42 });

        let err = Request::parse(FUNC_SANDBOX_DESTROY, &[1, 2], 0).unwrap_err();
        assert!(matches!(err, HvError::InvalidParameter(_)));
    }

    #[test]
    fn list_capacity_comes_from_output_length() {
        let req = Request::parse(FUNC_SANDBOX_LIST, &[], 10).unwrap();
        assert_eq!(req, Request::SandboxList { capacity: 2 });
    }

    #[test]
    fn nop_round_trips_without_core_state() {
        let ctx = HvContext::new().unwrap();
        let resp = handle_request(&ctx, Request::Nop).unwrap();
        assert_eq!(resp, Response::Nop);
        assert!(resp.encode().is_empty());
    }

    #[test]
    fn query_caps_reflects_core_state() {
        let ctx = HvContext::new().unwrap();
        handle_request(&ctx, Request::SandboxCreate { id: 9 }).unwrap();
        handle_request(&ctx, Request::BuildEpt).unwrap();

        let resp = handle_request(&ctx, Request::QueryCaps).unwrap();
        let Response::Caps(caps) = resp else {
            panic!("expected caps");
        };
        assert!(caps.cpu_count > 0);
        assert!(caps.suggested_region_size >= 0x1000);
        assert_eq!(caps.ept_page_count, 4);
        assert_eq!(caps.sandbox_count, 1);

        let wire = Response::Caps(caps).encode();
        assert_eq!(wire.len(), 20);
        assert_eq!(
            u32::from_le_bytes(wire[4..8].try_into().unwrap()),
            caps.cpu_count
        );
    }

    #[test]
    fn sandbox_list_encodes_ids() {
        let ctx = HvContext::new().unwrap();
        for id in [3, 1, 2] {
            handle_request(&ctx, Request::SandboxCreate { id }).unwrap();
        }

        let resp = handle_request(&ctx, Request::SandboxList { capacity: 16 }).unwrap();
        let Response::SandboxList(ids) = &resp else {
            panic!("expected id list");
        };
        assert_eq!(ids, &[3, 1, 2]); // ascending slot order = creation order here

        let wire = resp.encode();
        assert_eq!(wire.len() / 4, 3);
        assert_eq!(u32::from_le_bytes(wire[0..4].try_into().unwrap()), 3);
    }

    #[test]
    fn short_list_capacity_is_buffer_too_small() {
        let ctx = HvContext::new().unwrap();
        for id in 1..=4 {
            handle_request(&ctx, Request::SandboxCreate { id }).unwrap();
        }
        let err = handle_request(&ctx, Request::SandboxList { capacity: 2 }).unwrap_err();
        assert!(matches!(
            err,
            HvError::BufferTooSmall {
                needed: 4,
                capacity: 2
            }
        ));
    }
}
