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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;
use hvcore::mem::{RegionAllocator, Tag, TaggedBuffer};
use hvcore::{handle_request, HvContext, HvError, Request, Response, SandboxTable, VmxManager};

/// Allocator that fails once `successes` allocations have been served.
struct FailAfter {
    remaining: AtomicU32,
}

impl FailAfter {
    fn new(successes: u32) -> Self {
        Self {
            remaining: AtomicU32::new(successes),
        }
    }
}

impl RegionAllocator for FailAfter {
    fn allocate(&self, size: usize, tag: Tag) -> hvcore::Result<TaggedBuffer> {
        match self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        {
            Ok(_) => TaggedBuffer::zeroed(size, tag),
            Err(_) => Err(HvError::InsufficientResources("forced failure")),
        }
    }
}

#[test]
fn duplicate_create_collides_and_count_stays_one() {
    let table = SandboxTable::new();
    table.create_sandbox(5).unwrap();

    let err = table.create_sandbox(5).unwrap_err();
    assert!(matches!(err, HvError::NameCollision(5)));
    assert_eq!(table.get_active_count().unwrap(), 1);
}

#[test]
fn destroy_without_create_is_not_found() {
    let table = SandboxTable::new();
    assert!(matches!(
        table.destroy_sandbox(5).unwrap_err(),
        HvError::NotFound(5)
    ));
}

#[test]
fn full_table_rejects_seventeenth_sandbox() {
    let table = SandboxTable::new();
    for id in 1..=16 {
        table.create_sandbox(id).unwrap();
    }
    assert!(matches!(
        table.create_sandbox(17).unwrap_err(),
        HvError::InsufficientResources(_)
    ));

    let mut ids = [0u32; 16];
    let total = table.list_sandboxes(Some(&mut ids)).unwrap();
    assert_eq!(total, 16);
    let expected: Vec<u32> = (1..=16).collect();
    assert_eq!(&ids[..], &expected[..]);
    assert_eq!(total, table.get_active_count().unwrap());
}

#[test]
fn small_buffer_gets_partial_prefix_and_full_count() {
    let table = SandboxTable::new();
    for id in [1, 2, 3, 4, 5] {
        table.create_sandbox(id).unwrap();
    }

    let mut ids = [0u32; 2];
    let err = table.list_sandboxes(Some(&mut ids)).unwrap_err();
    let HvError::BufferTooSmall { needed, capacity } = err else {
        panic!("expected BufferTooSmall, got {:?}", err);
    };
    assert_eq!(needed, 5);
    assert_eq!(capacity, 2);
    // The first two active ids by slot order were written before the
    // size check.
    assert_eq!(ids, [1, 2]);
}

#[test]
fn vmxon_rollback_frees_every_region_on_forced_failure() {
    // processor_count comes from the host; the property holds for any
    // failure index below it, so force the failure at the first cpu
    // after some successes when the machine has enough cpus.
    let mut vmx = VmxManager::with_allocator(Arc::new(FailAfter::new(2)));
    vmx.initialize().unwrap();

    if vmx.processor_count() <= 2 {
        // Not enough processors to fail mid-way here; the unit tests
        // cover a fixed 4-cpu layout.
        return;
    }

    let err = vmx.allocate_vmxon_region().unwrap_err();
    assert!(matches!(err, HvError::InsufficientResources(_)));
    for (i, entry) in vmx.per_cpu().iter().enumerate() {
        assert!(entry.vmxon().is_none(), "cpu {} kept its region", i);
    }
}

#[test]
fn create_and_destroy_sandboxes_on_different_threads() {
    let ctx = Arc::new(HvContext::new().unwrap());
    let created = Arc::new(ArrayQueue::<u32>::new(10));

    let handles = (1..=10u32)
        .map(|id| {
            let ctx = ctx.clone();
            let created = created.clone();
            thread::spawn(move || {
                handle_request(&ctx, Request::SandboxCreate { id })
                    .unwrap_or_else(|_| panic!("failed to create sandbox {}", id));
                created
                    .push(id)
                    .unwrap_or_else(|_| panic!("failed to queue sandbox {}", id));
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ctx.sandboxes().get_active_count().unwrap(), 10);

    let handles = (0..10)
        .map(|i| {
            let ctx = ctx.clone();
            let created = created.clone();
            thread::spawn(move || {
                let id = created
                    .pop()
                    .unwrap_or_else(|| panic!("no sandbox to destroy on thread {}", i));
                handle_request(&ctx, Request::SandboxDestroy { id })
                    .unwrap_or_else(|_| panic!("failed to destroy sandbox {}", id));
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ctx.sandboxes().get_active_count().unwrap(), 0);
}

#[test]
fn dispatch_round_trip_matches_table_state() {
    let ctx = HvContext::new().unwrap();

    for id in [11, 22, 33] {
        assert_eq!(
            handle_request(&ctx, Request::SandboxCreate { id }).unwrap(),
            Response::SandboxCreated
        );
    }

    let resp = handle_request(&ctx, Request::SandboxList { capacity: 16 }).unwrap();
    assert_eq!(resp, Response::SandboxList(vec![11, 22, 33]));

    let Response::Caps(caps) = handle_request(&ctx, Request::QueryCaps).unwrap() else {
        panic!("expected caps");
    };
    assert_eq!(caps.sandbox_count, 3);

    ctx.shutdown().unwrap();
    assert_eq!(ctx.sandboxes().get_active_count().unwrap(), 0);
}

#[test]
fn raw_request_parsing_guards_the_core() {
    let ctx = HvContext::new().unwrap();

    // Unknown code: rejected before any core call.
    let err = Request::parse(0x900, &[], 0).unwrap_err();
    assert!(matches!(err, HvError::InvalidDeviceRequest(0x900)));

    // Well-formed raw create, then a list sized from the output length.
    let req = Request::parse(hvcore::dispatch::FUNC_SANDBOX_CREATE, &7u32.to_le_bytes(), 0)
        .unwrap();
    handle_request(&ctx, req).unwrap();

    let req = Request::parse(hvcore::dispatch::FUNC_SANDBOX_LIST, &[], 64).unwrap();
    let resp = handle_request(&ctx, req).unwrap();
    assert_eq!(resp.encode(), 7u32.to_le_bytes().to_vec());
}
