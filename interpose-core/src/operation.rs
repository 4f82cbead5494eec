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

//! Operation contracts: implementations, completion callbacks, and the
//! per-operation definition stored in the registry.

use crate::interceptor::{InterceptorMode, PostInterceptor, PreInterceptor};
use crate::invocation::Continuation;
use serde_json::Value;
use std::sync::Arc;

/// The mutable argument vector threaded through a chain.
///
/// Every stage observes the current vector; a stage that calls its
/// continuation with replacement values rewrites it for all downstream
/// stages (remaining pres, the operation, and all posts).
pub type CallArgs = Vec<Value>;

/// A wrapped operation's raw implementation.
///
/// Receives the target instance, the current argument vector, and, when
/// the caller supplied a trailing completion callable, a guarded
/// [`Continuation`] that starts the post chain before finally invoking the
/// caller's completion. Implementations signal failure through that handle
/// (`fail`), mirroring the error-first callback convention. The return
/// value passes through to the caller unmodified when the operation has
/// neither posts nor a trailing completion.
pub type OperationFn<T> =
    Arc<dyn Fn(&T, &CallArgs, Option<Continuation<T>>) -> Option<Value> + Send + Sync>;

/// The caller's trailing completion callable, error-first: it receives
/// either the final argument vector or the propagated error that aborted
/// the chain.
pub type CompletionFn<T> = Arc<dyn Fn(&T, Result<CallArgs, anyhow::Error>) + Send + Sync>;

/// An operation's default error handler, invoked with the target instance
/// as execution context when the caller supplied no trailing completion.
pub type ErrorHandlerFn<T> = Arc<dyn Fn(&T, anyhow::Error) + Send + Sync>;

/// A target type that exposes raw operations for interception.
///
/// Adding a pre or post interceptor to an operation that has not been
/// registered yet auto-registers it against the member this trait declares;
/// if no implementation is reachable the registration fails with
/// [`RegistryError::NoImplementation`](crate::registry::RegistryError::NoImplementation).
pub trait Interceptable: Send + Sync + Sized + 'static {
    /// The raw implementation for `name`, if the type declares one.
    fn raw_operation(name: &str) -> Option<OperationFn<Self>>;
}

/// Everything the registry knows about one interceptable operation.
///
/// Shared by all instances of a target type; mutated only by registry
/// operations. Invocations clone it at dispatch time, so the lists are
/// stable for the duration of any invocation that has begun traversing
/// them.
pub struct OperationDefinition<T> {
    pub(crate) implementation: OperationFn<T>,
    pub(crate) error_handler: Option<ErrorHandlerFn<T>>,
    pub(crate) pres: Vec<PreInterceptor<T>>,
    pub(crate) posts: Vec<PostInterceptor<T>>,
    /// Always equals the number of `Async` entries in `pres`.
    pub(crate) async_pres: usize,
}

impl<T> OperationDefinition<T> {
    pub(crate) fn new(
        implementation: OperationFn<T>,
        error_handler: Option<ErrorHandlerFn<T>>,
    ) -> Self {
        Self {
            implementation,
            error_handler,
            pres: Vec::new(),
            posts: Vec::new(),
            async_pres: 0,
        }
    }

    /// Recompute the asynchronous-pre count from the pre list.
    pub(crate) fn recount_async_pres(&mut self) {
        self.async_pres = self
            .pres
            .iter()
            .filter(|pre| pre.mode() == InterceptorMode::Async)
            .count();
    }
}

impl<T> Clone for OperationDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            implementation: Arc::clone(&self.implementation),
            error_handler: self.error_handler.clone(),
            pres: self.pres.clone(),
            posts: self.posts.clone(),
            async_pres: self.async_pres,
        }
    }
}
