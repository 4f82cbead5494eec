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

//! Typed interceptor contract.
//!
//! Interceptors are stored as tagged variants: a `Sync` pre receives one
//! chain-control handle (its continuation), an `Async` pre receives two
//! (continuation plus an out-of-band completion handle), and a post always
//! receives one. The mode is part of the type, so a malformed interceptor
//! cannot be registered in the first place.

use crate::invocation::{AsyncCompletion, Continuation};
use crate::operation::CallArgs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Execution mode of a pre-interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptorMode {
    /// Serial: done as soon as its continuation is called.
    Sync,
    /// Counted: participates in the serial cursor through its continuation
    /// and additionally holds the operation back until its completion
    /// handle fires.
    Async,
}

impl fmt::Display for InterceptorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptorMode::Sync => write!(f, "sync"),
            InterceptorMode::Async => write!(f, "async"),
        }
    }
}

/// A synchronous pre-interceptor: `(target, continuation, args)`.
pub type SyncPreFn<T> = Arc<dyn Fn(&T, Continuation<T>, &CallArgs) + Send + Sync>;

/// An asynchronous pre-interceptor: `(target, continuation, completion, args)`.
pub type AsyncPreFn<T> =
    Arc<dyn Fn(&T, Continuation<T>, AsyncCompletion<T>, &CallArgs) + Send + Sync>;

/// A post-interceptor callable: `(target, continuation, args)`.
pub type PostFn<T> = Arc<dyn Fn(&T, Continuation<T>, &CallArgs) + Send + Sync>;

/// A pre-interceptor entry: the callable tagged with its mode.
pub enum PreInterceptor<T> {
    Sync(SyncPreFn<T>),
    Async(AsyncPreFn<T>),
}

impl<T> PreInterceptor<T> {
    /// Wrap a synchronous pre-interceptor.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&T, Continuation<T>, &CallArgs) + Send + Sync + 'static,
    {
        PreInterceptor::Sync(Arc::new(f))
    }

    /// Wrap an asynchronous pre-interceptor.
    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(&T, Continuation<T>, AsyncCompletion<T>, &CallArgs) + Send + Sync + 'static,
    {
        PreInterceptor::Async(Arc::new(f))
    }

    /// The entry's mode.
    pub fn mode(&self) -> InterceptorMode {
        match self {
            PreInterceptor::Sync(_) => InterceptorMode::Sync,
            PreInterceptor::Async(_) => InterceptorMode::Async,
        }
    }

    /// Identity comparison: true when both entries wrap the same callable.
    /// Removal by identity uses this, so hold on to the entry you added.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PreInterceptor::Sync(a), PreInterceptor::Sync(b)) => Arc::ptr_eq(a, b),
            (PreInterceptor::Async(a), PreInterceptor::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> Clone for PreInterceptor<T> {
    fn clone(&self) -> Self {
        match self {
            PreInterceptor::Sync(f) => PreInterceptor::Sync(Arc::clone(f)),
            PreInterceptor::Async(f) => PreInterceptor::Async(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for PreInterceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreInterceptor").field(&self.mode()).finish()
    }
}

/// A post-interceptor entry. Posts are always serial; there is no mode.
pub struct PostInterceptor<T> {
    pub(crate) callable: PostFn<T>,
}

impl<T> PostInterceptor<T> {
    /// Wrap a post-interceptor.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&T, Continuation<T>, &CallArgs) + Send + Sync + 'static,
    {
        Self {
            callable: Arc::new(f),
        }
    }

    /// Identity comparison, as for [`PreInterceptor::ptr_eq`].
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.callable, &other.callable)
    }
}

impl<T> Clone for PostInterceptor<T> {
    fn clone(&self) -> Self {
        Self {
            callable: Arc::clone(&self.callable),
        }
    }
}

impl<T> fmt::Debug for PostInterceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostInterceptor").finish()
    }
}
