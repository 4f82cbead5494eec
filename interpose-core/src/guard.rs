// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One-shot guard for chain-control handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-shot flag shared by all clones of a chain-control handle.
///
/// Each guarded call-site gets a fresh guard when the engine hands a handle
/// to an interceptor, so an interceptor that calls its continuation or
/// completion handle more than once cannot double-advance the chain,
/// double-invoke the operation, or double-resolve an error. The flag lives
/// with the handle (per invocation, per call-site), not with the registered
/// interceptor, so concurrent invocations never share it.
#[derive(Debug, Clone)]
pub struct CallGuard {
    spent: Arc<AtomicBool>,
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CallGuard {
    /// Create an unspent guard.
    pub fn new() -> Self {
        Self {
            spent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the guard. Returns `true` exactly once across all clones;
    /// every later claim returns `false`.
    pub fn claim(&self) -> bool {
        !self.spent.swap(true, Ordering::AcqRel)
    }

    /// Whether the guard has already been claimed.
    pub fn is_spent(&self) -> bool {
        self.spent.load(Ordering::Acquire)
    }
}
