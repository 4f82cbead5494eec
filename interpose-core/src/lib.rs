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

//! Interpose: an interceptor composition engine.
//!
//! Interpose lets a caller attach ordered "before" and "after" behaviors
//! around a single in-process operation without modifying the operation
//! itself: validation, auditing, or derived side effects around
//! data-mutating calls.
//!
//! # Architecture
//!
//! Every call to a wrapped operation interleaves four kinds of stages:
//!
//! - **Sync pres** run strictly serially, each advancing the chain through
//!   its continuation.
//! - **Async pres** participate in the same serial cursor *and* hold the
//!   operation back through a counted barrier until their out-of-band
//!   completion handles fire, in any order.
//! - The **operation** runs at most once, exactly when the serial cursor
//!   has exhausted the pre list and the barrier has counted down to zero.
//! - **Posts** run strictly serially after the operation; the caller's
//!   trailing completion (if any) receives the final argument vector.
//!
//! The argument vector threads mutably through every stage, a propagated
//! error resolves through exactly one sink (trailing completion, then the
//! operation's default error handler, then a raise back to the caller),
//! and every chain-control handle is idempotent: repeat calls are
//! discarded.
//!
//! The engine never spawns concurrency itself. Interceptors may defer
//! their handles to timers, tasks, or any other host primitive; the chain
//! suspends and resumes on whichever thread fires the handle next.
//!
//! # Example
//!
//! ```rust,ignore
//! use interpose_core::{
//!     InterceptorRegistry, OperationDispatcher, PreInterceptor, PostInterceptor,
//! };
//! use std::sync::Arc;
//!
//! let registry = Arc::new(InterceptorRegistry::new());
//! registry.register_operation("save", Arc::new(|doc: &Document, args, chain| {
//!     // ... write the document ...
//!     None
//! }), None);
//!
//! registry.add_pre("save", PreInterceptor::sync(|_, next, args| {
//!     let _ = next.proceed_with(vec![normalize(args)]);
//! }))?;
//! registry.add_post("save", PostInterceptor::new(|_, next, _| {
//!     let _ = next.proceed();
//! }))?;
//!
//! let dispatcher = OperationDispatcher::new(registry);
//! dispatcher.invoke(&doc, "save", vec![payload], None)?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod guard;
pub mod interceptor;
pub mod invocation;
pub mod operation;
pub mod registry;

// Re-exports
pub use config::{ChainConfig, ChainConfigError, InterceptorRef, OperationWiring};
pub use dispatcher::{DispatchError, DispatchOutcome, OperationDispatcher};
pub use guard::CallGuard;
pub use interceptor::{
    AsyncPreFn, InterceptorMode, PostFn, PostInterceptor, PreInterceptor, SyncPreFn,
};
pub use invocation::{AsyncCompletion, Continuation};
pub use operation::{
    CallArgs, CompletionFn, ErrorHandlerFn, Interceptable, OperationDefinition, OperationFn,
};
pub use registry::{InterceptorRegistry, RegistryError};
