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

use std::error::Error;
use std::sync::{MutexGuard, PoisonError};

use thiserror::Error;

/// The error type for hvcore operations
#[derive(Error, Debug)]
pub enum HvError {
    /// A supplied output buffer is smaller than the data available.
    ///
    /// Note: `list_sandboxes` has already written the first `capacity`
    /// ids into the buffer when this is returned; see its docs for the
    /// partial-output contract.
    #[error("Buffer too small: needed {needed}, capacity {capacity}")]
    BufferTooSmall {
        /// Number of elements available
        needed: u32,
        /// Number of elements the caller's buffer can hold
        capacity: u32,
    },

    /// A request carried a function code this core does not recognize
    #[error("Invalid device request: unknown function code {0:#x}")]
    InvalidDeviceRequest(u32),

    /// An operation was called before the state it depends on was set up
    #[error("Invalid device state: {0}")]
    InvalidDeviceState(&'static str),

    /// A parameter failed validation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// An allocation failed, or a fixed-capacity table is full
    #[error("Insufficient resources: {0}")]
    InsufficientResources(&'static str),

    /// A sandbox id is already in use by an active sandbox
    #[error("Name collision: sandbox id {0} already active")]
    NameCollision(u32),

    /// No active sandbox has the given id
    #[error("Not found: no active sandbox with id {0}")]
    NotFound(u32),

    /// A privileged register read trapped.
    ///
    /// Never escapes the crate: capability probing substitutes a default
    /// value, logs a warning and continues.
    #[error("Privileged read of MSR {0:#x} faulted")]
    PrivilegedReadFault(u32),

    /// The operation could not complete for an environmental reason
    #[error("Unsuccessful: {0}")]
    Unsuccessful(String),
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for HvError {
    // Implemented this way rather than carrying the PoisonError as a source,
    // which would require Box<dyn Error + Send + Sync>. Good enough, and it
    // lets callers use the ? operator on lock() calls.
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from("lock poisoned"),
        };
        HvError::Unsuccessful(source)
    }
}

/// Logs an error at `error` level, then returns it from the enclosing
/// function.
#[macro_export]
macro_rules! log_then_return {
    ($err:expr $(,)?) => {{
        let __err = $err;
        log::error!("{}", &__err);
        return Err(__err);
    }};
}
