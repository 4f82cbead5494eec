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

//! Per-call chain state and the invocation engine.
//!
//! An [`Invocation`] owns everything one call to a wrapped operation needs:
//! a snapshot of the operation's interceptor lists, the mutable argument
//! vector, the serial pre cursor, the outstanding-async counter, and the
//! settled flag. Two independent gates guard the operation: the serial
//! cursor must exhaust the pre list AND the async counter must reach zero,
//! in either order.
//!
//! Chain-control handles do not call into each other recursively. Every
//! handle call enqueues a [`Step`] into the invocation's mailbox; whichever
//! call finds no driver active drains the mailbox in FIFO order. A step
//! queued synchronously from inside an interceptor therefore executes after
//! that interceptor returns, and a handle fired later from a timer or task
//! resumes the chain on its own thread. The state lock is never held across
//! a user-supplied callable.

use crate::dispatcher::DispatchError;
use crate::guard::CallGuard;
use crate::interceptor::{PostInterceptor, PreInterceptor};
use crate::operation::{CallArgs, CompletionFn, ErrorHandlerFn, OperationDefinition, OperationFn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// Which serial chain a continuation advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pre,
    Post,
}

/// One unit of chain progress, queued by a chain-control handle.
enum Step {
    /// Advance the serial pre cursor, optionally rewriting the vector.
    AdvancePre { replacement: Option<CallArgs> },
    /// An asynchronous pre signalled out-of-band completion.
    AsyncDone,
    /// Both gates cleared: call the implementation.
    RunOperation,
    /// Advance the post cursor, optionally rewriting the vector.
    AdvancePost { replacement: Option<CallArgs> },
    /// Route a propagated error through the resolved sink.
    Fail { error: anyhow::Error },
}

/// The sink that absorbs a propagated error, fixed once per invocation:
/// the caller's trailing completion if one was supplied, else the
/// operation's default error handler, else the error is raised back to
/// whichever call was driving the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorSink {
    Completion,
    Handler,
    Raise,
}

struct ChainState {
    args: CallArgs,
    /// Index of the next pre to run.
    next_pre: usize,
    /// The serial cursor has exhausted the pre list.
    serial_done: bool,
    /// Outstanding asynchronous-pre completions.
    asyncs_left: usize,
    /// Index of the next post to run.
    next_post: usize,
    /// The implementation has been (or is being) called.
    operation_started: bool,
    /// The chain fully resolved or an error was routed; every later step
    /// and handle call is discarded.
    settled: bool,
    /// A driver is currently draining the mailbox.
    driving: bool,
    mailbox: VecDeque<Step>,
    return_value: Option<Value>,
}

/// State for one call to a wrapped operation.
///
/// Exclusively owned by that call: concurrent invocations of the same
/// operation each get their own `Invocation` and share nothing beyond the
/// read-only definition snapshot.
pub(crate) struct Invocation<T> {
    id: Uuid,
    operation: String,
    target: Arc<T>,
    implementation: OperationFn<T>,
    error_handler: Option<ErrorHandlerFn<T>>,
    pres: Vec<PreInterceptor<T>>,
    posts: Vec<PostInterceptor<T>>,
    completion: Option<CompletionFn<T>>,
    sink: ErrorSink,
    state: Mutex<ChainState>,
}

impl<T: Send + Sync + 'static> Invocation<T> {
    pub(crate) fn new(
        operation: impl Into<String>,
        target: Arc<T>,
        definition: OperationDefinition<T>,
        args: CallArgs,
        completion: Option<CompletionFn<T>>,
    ) -> Arc<Self> {
        let OperationDefinition {
            implementation,
            error_handler,
            pres,
            posts,
            async_pres,
        } = definition;
        debug_assert_eq!(
            async_pres,
            pres.iter()
                .filter(|p| p.mode() == crate::interceptor::InterceptorMode::Async)
                .count(),
            "asynchronous-pre count out of sync with the pre list"
        );

        let sink = if completion.is_some() {
            ErrorSink::Completion
        } else if error_handler.is_some() {
            ErrorSink::Handler
        } else {
            ErrorSink::Raise
        };

        Arc::new(Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            target,
            implementation,
            error_handler,
            pres,
            posts,
            completion,
            sink,
            state: Mutex::new(ChainState {
                args,
                next_pre: 0,
                serial_done: false,
                asyncs_left: async_pres,
                next_post: 0,
                operation_started: false,
                settled: false,
                driving: false,
                mailbox: VecDeque::new(),
                return_value: None,
            }),
        })
    }

    /// Kick off the chain. Runs synchronously as far as the interceptors
    /// allow; returns once the chain settles or suspends.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<(), DispatchError> {
        tracing::debug!(
            operation = %self.operation,
            invocation = %self.id,
            pres = self.pres.len(),
            posts = self.posts.len(),
            sink = ?self.sink,
            "invocation started"
        );
        self.submit(Step::AdvancePre { replacement: None })
    }

    /// Whether the chain has fully resolved, and the implementation's
    /// return value if it ran. Called by the dispatcher after `begin`.
    pub(crate) fn settled_value(&self) -> Option<Option<Value>> {
        let state = self.state.lock();
        if state.settled {
            Some(state.return_value.clone())
        } else {
            None
        }
    }

    /// Enqueue a step; become the driver if none is active.
    fn submit(self: &Arc<Self>, step: Step) -> Result<(), DispatchError> {
        {
            let mut state = self.state.lock();
            if state.settled {
                tracing::trace!(
                    operation = %self.operation,
                    invocation = %self.id,
                    "step after settlement discarded"
                );
                return Ok(());
            }
            state.mailbox.push_back(step);
            if state.driving {
                return Ok(());
            }
            state.driving = true;
        }
        self.drive()
    }

    /// Drain the mailbox. Interceptors invoked from here may enqueue
    /// further steps, synchronously or from other threads; the loop ends
    /// when the mailbox is empty (chain suspended or settled) or when an
    /// error reaches the raise sink.
    fn drive(self: &Arc<Self>) -> Result<(), DispatchError> {
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.settled {
                    state.mailbox.clear();
                    state.driving = false;
                    return Ok(());
                }
                match state.mailbox.pop_front() {
                    Some(step) => step,
                    None => {
                        state.driving = false;
                        return Ok(());
                    }
                }
            };
            if let Err(error) = self.execute(step) {
                self.state.lock().driving = false;
                return Err(error);
            }
        }
    }

    fn execute(self: &Arc<Self>, step: Step) -> Result<(), DispatchError> {
        match step {
            Step::AdvancePre { replacement } => self.advance_pre(replacement),
            Step::AsyncDone => self.async_done(),
            Step::RunOperation => self.run_operation(),
            Step::AdvancePost { replacement } => self.advance_post(replacement),
            Step::Fail { error } => self.route_error(error),
        }
    }

    /// Serial pre cursor: rewrite, advance, invoke the next entry with
    /// freshly guarded handles, or clear the serial gate on exhaustion.
    fn advance_pre(self: &Arc<Self>, replacement: Option<CallArgs>) -> Result<(), DispatchError> {
        let next = {
            let mut state = self.state.lock();
            if let Some(replacement) = replacement {
                rewrite_args(&mut state.args, replacement, self.completion.is_some());
            }
            let index = state.next_pre;
            state.next_pre += 1;
            if index < self.pres.len() {
                Some((self.pres[index].clone(), state.args.clone()))
            } else {
                state.serial_done = true;
                tracing::trace!(
                    operation = %self.operation,
                    invocation = %self.id,
                    asyncs_left = state.asyncs_left,
                    "pre chain exhausted"
                );
                if state.asyncs_left == 0 && !state.operation_started {
                    state.operation_started = true;
                    state.mailbox.push_back(Step::RunOperation);
                }
                None
            }
        };

        if let Some((entry, args)) = next {
            let continuation = Continuation::new(self, Stage::Pre);
            match entry {
                PreInterceptor::Sync(callable) => {
                    callable(&self.target, continuation, &args);
                }
                PreInterceptor::Async(callable) => {
                    let completion = AsyncCompletion::new(self);
                    callable(&self.target, continuation, completion, &args);
                }
            }
        }
        Ok(())
    }

    /// Counted barrier: one asynchronous pre finished. The operation fires
    /// only when the counter is zero and the serial gate is also clear.
    fn async_done(self: &Arc<Self>) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        state.asyncs_left = state.asyncs_left.saturating_sub(1);
        tracing::trace!(
            operation = %self.operation,
            invocation = %self.id,
            asyncs_left = state.asyncs_left,
            serial_done = state.serial_done,
            "asynchronous pre completed"
        );
        if state.asyncs_left == 0 && state.serial_done && !state.operation_started {
            state.operation_started = true;
            state.mailbox.push_back(Step::RunOperation);
        }
        Ok(())
    }

    /// Call the implementation with the current vector. When the caller
    /// supplied a trailing completion it is replaced by a guarded
    /// continuation that starts the post chain; when posts exist without a
    /// trailing completion the post chain starts as soon as the
    /// implementation returns.
    fn run_operation(self: &Arc<Self>) -> Result<(), DispatchError> {
        let args = self.state.lock().args.clone();
        tracing::debug!(
            operation = %self.operation,
            invocation = %self.id,
            "calling implementation"
        );

        let post_chain = self
            .completion
            .is_some()
            .then(|| Continuation::new(self, Stage::Post));
        let returned = (self.implementation)(&self.target, &args, post_chain);

        let mut state = self.state.lock();
        state.return_value = returned;
        if self.completion.is_none() {
            if self.posts.is_empty() {
                state.settled = true;
            } else {
                state.mailbox.push_back(Step::AdvancePost { replacement: None });
            }
        }
        Ok(())
    }

    /// Serial post cursor; on exhaustion the caller's trailing completion
    /// receives the final vector and the invocation settles.
    fn advance_post(self: &Arc<Self>, replacement: Option<CallArgs>) -> Result<(), DispatchError> {
        enum PostAction<T> {
            Invoke(PostInterceptor<T>, CallArgs),
            Finish(CallArgs),
            Settle,
        }

        let action = {
            let mut state = self.state.lock();
            if let Some(replacement) = replacement {
                rewrite_args(&mut state.args, replacement, self.completion.is_some());
            }
            let index = state.next_post;
            state.next_post += 1;
            if index < self.posts.len() {
                PostAction::Invoke(self.posts[index].clone(), state.args.clone())
            } else {
                state.settled = true;
                tracing::debug!(
                    operation = %self.operation,
                    invocation = %self.id,
                    "chain resolved"
                );
                if self.completion.is_some() {
                    PostAction::Finish(state.args.clone())
                } else {
                    PostAction::Settle
                }
            }
        };

        match action {
            PostAction::Invoke(entry, args) => {
                let continuation = Continuation::new(self, Stage::Post);
                (entry.callable)(&self.target, continuation, &args);
            }
            PostAction::Finish(args) => {
                if let Some(completion) = &self.completion {
                    completion(&self.target, Ok(args));
                }
            }
            PostAction::Settle => {}
        }
        Ok(())
    }

    /// Error Router: exactly one sink per invocation, resolved at call
    /// time. After routing, no further chain stage executes.
    fn route_error(self: &Arc<Self>, error: anyhow::Error) -> Result<(), DispatchError> {
        {
            let mut state = self.state.lock();
            if state.settled {
                return Ok(());
            }
            state.settled = true;
            state.mailbox.clear();
        }
        tracing::debug!(
            operation = %self.operation,
            invocation = %self.id,
            sink = ?self.sink,
            error = %error,
            "routing propagated error"
        );
        match self.sink {
            ErrorSink::Completion => {
                if let Some(completion) = &self.completion {
                    completion(&self.target, Err(error));
                }
                Ok(())
            }
            ErrorSink::Handler => {
                if let Some(handler) = &self.error_handler {
                    handler(&self.target, error);
                }
                Ok(())
            }
            ErrorSink::Raise => Err(DispatchError::Aborted {
                operation: self.operation.clone(),
                source: error,
            }),
        }
    }
}

/// Continuation call semantics, shared by the pre chain, the post chain,
/// and the operation's completion handle: an empty replacement leaves the
/// vector unchanged; a replacement whose first element is `Null` while the
/// caller supplied a trailing completion preserves the error-first
/// "no error" convention and leaves the vector unchanged; anything else
/// becomes the vector for all downstream stages.
fn rewrite_args(args: &mut CallArgs, replacement: CallArgs, has_completion: bool) {
    if replacement.is_empty() {
        return;
    }
    if has_completion && replacement.first().map_or(false, Value::is_null) {
        return;
    }
    *args = replacement;
}

/// The chain-control callable that advances to the next stage.
///
/// Handed to every pre, every post, and (standing in for the caller's
/// trailing completion) to the implementation. Clones share one guard, so
/// only the first call across all clones has effect. The handle is `Send`
/// and may be called from any thread at any later time; a chain suspended
/// on a deferred continuation resumes on the calling thread.
pub struct Continuation<T> {
    invocation: Arc<Invocation<T>>,
    stage: Stage,
    guard: CallGuard,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            invocation: Arc::clone(&self.invocation),
            stage: self.stage,
            guard: self.guard.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Continuation<T> {
    fn new(invocation: &Arc<Invocation<T>>, stage: Stage) -> Self {
        Self {
            invocation: Arc::clone(invocation),
            stage,
            guard: CallGuard::new(),
        }
    }

    /// Proceed to the next stage with the vector unchanged.
    pub fn proceed(&self) -> Result<(), DispatchError> {
        self.advance(None)
    }

    /// Proceed to the next stage, offering `replacement` as the new
    /// argument vector (subject to the no-error convention; see module
    /// docs).
    pub fn proceed_with(&self, replacement: CallArgs) -> Result<(), DispatchError> {
        self.advance(Some(replacement))
    }

    /// Abort the chain: remaining stages never run and `error` resolves
    /// through the invocation's error sink.
    ///
    /// `Err` is returned only when no sink could absorb the error and this
    /// call was driving the chain: the propagated error comes back to the
    /// caller's stack exactly as if the raw operation had failed there.
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> Result<(), DispatchError> {
        if !self.guard.claim() {
            self.discard();
            return Ok(());
        }
        self.invocation.submit(Step::Fail {
            error: error.into(),
        })
    }

    fn advance(&self, replacement: Option<CallArgs>) -> Result<(), DispatchError> {
        if !self.guard.claim() {
            self.discard();
            return Ok(());
        }
        let step = match self.stage {
            Stage::Pre => Step::AdvancePre { replacement },
            Stage::Post => Step::AdvancePost { replacement },
        };
        self.invocation.submit(step)
    }

    fn discard(&self) {
        tracing::trace!(
            operation = %self.invocation.operation,
            invocation = %self.invocation.id,
            stage = ?self.stage,
            "repeat continuation call discarded"
        );
    }
}

/// The second chain-control callable handed only to asynchronous pres.
///
/// Signals out-of-band completion, decrementing the invocation's
/// outstanding-async counter independently of the serial cursor. May fire
/// before, after, or interleaved with any serial progress.
pub struct AsyncCompletion<T> {
    invocation: Arc<Invocation<T>>,
    guard: CallGuard,
}

impl<T> Clone for AsyncCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            invocation: Arc::clone(&self.invocation),
            guard: self.guard.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> AsyncCompletion<T> {
    fn new(invocation: &Arc<Invocation<T>>) -> Self {
        Self {
            invocation: Arc::clone(invocation),
            guard: CallGuard::new(),
        }
    }

    /// Signal completion without error.
    pub fn complete(&self) -> Result<(), DispatchError> {
        if !self.guard.claim() {
            tracing::trace!(
                operation = %self.invocation.operation,
                invocation = %self.invocation.id,
                "repeat completion call discarded"
            );
            return Ok(());
        }
        self.invocation.submit(Step::AsyncDone)
    }

    /// Abort the chain with `error`, regardless of counter value or
    /// cursor position. Error semantics match [`Continuation::fail`].
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> Result<(), DispatchError> {
        if !self.guard.claim() {
            tracing::trace!(
                operation = %self.invocation.operation,
                invocation = %self.invocation.id,
                "repeat completion call discarded"
            );
            return Ok(());
        }
        self.invocation.submit(Step::Fail {
            error: error.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rewrite_empty_keeps_vector() {
        let mut args = vec![json!("path"), json!("val")];
        rewrite_args(&mut args, vec![], true);
        assert_eq!(args, vec![json!("path"), json!("val")]);
    }

    #[test]
    fn test_rewrite_replaces_vector() {
        let mut args = vec![json!("path"), json!("val")];
        rewrite_args(&mut args, vec![json!("foo"), json!("bar")], true);
        assert_eq!(args, vec![json!("foo"), json!("bar")]);
    }

    #[test]
    fn test_rewrite_null_with_completion_keeps_vector() {
        let mut args = vec![json!("path")];
        rewrite_args(&mut args, vec![Value::Null], true);
        assert_eq!(args, vec![json!("path")]);
    }

    #[test]
    fn test_rewrite_null_without_completion_replaces() {
        let mut args = vec![json!("path")];
        rewrite_args(&mut args, vec![Value::Null], false);
        assert_eq!(args, vec![Value::Null]);
    }

    #[test]
    fn test_rewrite_null_first_with_completion_keeps_vector() {
        // the no-error convention tests only the leading element
        let mut args = vec![json!("path")];
        rewrite_args(&mut args, vec![Value::Null, json!("x")], true);
        assert_eq!(args, vec![json!("path")]);
    }
}
