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

//! Interceptor registry: per-operation definitions and their ordered
//! pre/post lists, plus named interceptors for declarative wiring.

use crate::config::ChainConfig;
use crate::interceptor::{InterceptorMode, PostInterceptor, PreInterceptor};
use crate::operation::{ErrorHandlerFn, Interceptable, OperationDefinition, OperationFn};
use dashmap::DashMap;
use thiserror::Error;

/// Errors that can occur during registry operations.
///
/// These are configuration errors: they surface synchronously from the
/// registry call that caused them and are never routed through an
/// invocation's error sink.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Operation `{0}` has no reachable implementation")]
    NoImplementation(String),

    #[error("No interceptor named `{0}` is registered")]
    UnknownInterceptor(String),

    #[error("No error handler named `{0}` is registered")]
    UnknownErrorHandler(String),

    #[error("An interceptor named `{0}` is already registered")]
    DuplicateInterceptor(String),

    #[error("Interceptor `{name}` is wired as {declared} but registered as {registered}")]
    ModeMismatch {
        name: String,
        declared: InterceptorMode,
        registered: InterceptorMode,
    },
}

/// Registry of interceptable operations for one target type.
///
/// Stores, per operation name, the implementation, the optional default
/// error handler, and the ordered pre/post lists. All methods take `&self`;
/// list mutations affect only invocations that start afterward, because
/// every invocation snapshots its definition at dispatch time.
pub struct InterceptorRegistry<T> {
    operations: DashMap<String, OperationDefinition<T>>,
    named_pres: DashMap<String, PreInterceptor<T>>,
    named_posts: DashMap<String, PostInterceptor<T>>,
    named_error_handlers: DashMap<String, ErrorHandlerFn<T>>,
}

impl<T: Interceptable> Default for InterceptorRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Interceptable> InterceptorRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
            named_pres: DashMap::new(),
            named_posts: DashMap::new(),
            named_error_handlers: DashMap::new(),
        }
    }

    /// Define an interceptable operation. Idempotent: an operation that is
    /// already defined keeps its definition, interceptor lists included.
    pub fn register_operation(
        &self,
        name: &str,
        implementation: OperationFn<T>,
        error_handler: Option<ErrorHandlerFn<T>>,
    ) -> &Self {
        self.operations
            .entry(name.to_string())
            .or_insert_with(|| OperationDefinition::new(implementation, error_handler));
        self
    }

    /// Define several operations at once.
    pub fn register_operations<S>(
        &self,
        implementations: impl IntoIterator<Item = (S, OperationFn<T>)>,
    ) -> &Self
    where
        S: Into<String>,
    {
        for (name, implementation) in implementations {
            self.register_operation(&name.into(), implementation, None);
        }
        self
    }

    /// Replace or set the default error handler of a registered operation.
    pub fn set_error_handler(
        &self,
        name: &str,
        handler: ErrorHandlerFn<T>,
    ) -> Result<&Self, RegistryError> {
        self.ensure_registered(name)?;
        if let Some(mut definition) = self.operations.get_mut(name) {
            definition.error_handler = Some(handler);
        }
        Ok(self)
    }

    /// Append a pre-interceptor, auto-registering the operation against the
    /// target type's declared raw member if it is not defined yet.
    pub fn add_pre(&self, name: &str, pre: PreInterceptor<T>) -> Result<&Self, RegistryError> {
        self.ensure_registered(name)?;
        if let Some(mut definition) = self.operations.get_mut(name) {
            if pre.mode() == InterceptorMode::Async {
                definition.async_pres += 1;
            }
            definition.pres.push(pre);
        }
        Ok(self)
    }

    /// Like [`add_pre`](Self::add_pre), also supplying a default error
    /// handler for the operation. The handler takes effect only when this
    /// call performs the lazy registration; an operation that is already
    /// defined keeps whatever handler it has.
    pub fn add_pre_with_error_handler(
        &self,
        name: &str,
        pre: PreInterceptor<T>,
        handler: ErrorHandlerFn<T>,
    ) -> Result<&Self, RegistryError> {
        if !self.is_registered(name) {
            match T::raw_operation(name) {
                Some(implementation) => {
                    self.register_operation(name, implementation, Some(handler));
                }
                None => return Err(RegistryError::NoImplementation(name.to_string())),
            }
        }
        self.add_pre(name, pre)
    }

    /// Append a post-interceptor, auto-registering as for [`add_pre`](Self::add_pre).
    pub fn add_post(&self, name: &str, post: PostInterceptor<T>) -> Result<&Self, RegistryError> {
        self.ensure_registered(name)?;
        if let Some(mut definition) = self.operations.get_mut(name) {
            definition.posts.push(post);
        }
        Ok(self)
    }

    /// Remove pre-interceptors: every entry with `entry`'s identity, or the
    /// whole pre list when `entry` is `None`. The post list is untouched.
    pub fn remove_pre(&self, name: &str, entry: Option<&PreInterceptor<T>>) -> &Self {
        if let Some(mut definition) = self.operations.get_mut(name) {
            match entry {
                None => definition.pres.clear(),
                Some(target) => definition.pres.retain(|candidate| !candidate.ptr_eq(target)),
            }
            definition.recount_async_pres();
        }
        self
    }

    /// Remove post-interceptors, as for [`remove_pre`](Self::remove_pre).
    pub fn remove_post(&self, name: &str, entry: Option<&PostInterceptor<T>>) -> &Self {
        if let Some(mut definition) = self.operations.get_mut(name) {
            match entry {
                None => definition.posts.clear(),
                Some(target) => definition
                    .posts
                    .retain(|candidate| !candidate.ptr_eq(target)),
            }
        }
        self
    }

    /// Clear both interceptor lists of one operation, keeping the
    /// operation itself registered.
    pub fn clear_interceptors(&self, name: &str) -> &Self {
        if let Some(mut definition) = self.operations.get_mut(name) {
            definition.pres.clear();
            definition.posts.clear();
            definition.async_pres = 0;
        }
        self
    }

    /// Drop every operation and every named interceptor.
    pub fn clear(&self) {
        self.operations.clear();
        self.named_pres.clear();
        self.named_posts.clear();
        self.named_error_handlers.clear();
    }

    /// Whether `name` is a registered operation.
    pub fn is_registered(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Number of registered operations.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Number of pre-interceptors on `name` (zero when unregistered).
    pub fn pre_count(&self, name: &str) -> usize {
        self.operations.get(name).map_or(0, |d| d.pres.len())
    }

    /// Number of post-interceptors on `name` (zero when unregistered).
    pub fn post_count(&self, name: &str) -> usize {
        self.operations.get(name).map_or(0, |d| d.posts.len())
    }

    /// Register a pre-interceptor under a name for declarative wiring.
    pub fn register_named_pre(
        &self,
        name: &str,
        pre: PreInterceptor<T>,
    ) -> Result<&Self, RegistryError> {
        if self.named_pres.contains_key(name) {
            return Err(RegistryError::DuplicateInterceptor(name.to_string()));
        }
        self.named_pres.insert(name.to_string(), pre);
        Ok(self)
    }

    /// Register a post-interceptor under a name for declarative wiring.
    pub fn register_named_post(
        &self,
        name: &str,
        post: PostInterceptor<T>,
    ) -> Result<&Self, RegistryError> {
        if self.named_posts.contains_key(name) {
            return Err(RegistryError::DuplicateInterceptor(name.to_string()));
        }
        self.named_posts.insert(name.to_string(), post);
        Ok(self)
    }

    /// Register an error handler under a name for declarative wiring.
    pub fn register_named_error_handler(
        &self,
        name: &str,
        handler: ErrorHandlerFn<T>,
    ) -> Result<&Self, RegistryError> {
        if self.named_error_handlers.contains_key(name) {
            return Err(RegistryError::DuplicateInterceptor(name.to_string()));
        }
        self.named_error_handlers.insert(name.to_string(), handler);
        Ok(self)
    }

    /// Get a named pre-interceptor.
    pub fn named_pre(&self, name: &str) -> Option<PreInterceptor<T>> {
        self.named_pres.get(name).map(|p| p.clone())
    }

    /// Get a named post-interceptor.
    pub fn named_post(&self, name: &str) -> Option<PostInterceptor<T>> {
        self.named_posts.get(name).map(|p| p.clone())
    }

    /// Wire operations from a validated [`ChainConfig`], resolving named
    /// interceptors and error handlers in declaration order.
    pub fn apply_config(&self, config: &ChainConfig) -> Result<&Self, RegistryError> {
        for wiring in &config.operations {
            if let Some(handler_name) = &wiring.error_handler {
                let handler = self
                    .named_error_handlers
                    .get(handler_name)
                    .map(|h| h.clone())
                    .ok_or_else(|| RegistryError::UnknownErrorHandler(handler_name.clone()))?;
                self.set_error_handler(&wiring.operation, handler)?;
            }

            for reference in &wiring.pre {
                if !reference.enabled() {
                    continue;
                }
                let pre = self
                    .named_pre(reference.name())
                    .ok_or_else(|| RegistryError::UnknownInterceptor(reference.name().to_string()))?;
                if let Some(declared) = reference.declared_mode() {
                    if declared != pre.mode() {
                        return Err(RegistryError::ModeMismatch {
                            name: reference.name().to_string(),
                            declared,
                            registered: pre.mode(),
                        });
                    }
                }
                self.add_pre(&wiring.operation, pre)?;
            }

            for reference in &wiring.post {
                if !reference.enabled() {
                    continue;
                }
                let post = self
                    .named_post(reference.name())
                    .ok_or_else(|| RegistryError::UnknownInterceptor(reference.name().to_string()))?;
                self.add_post(&wiring.operation, post)?;
            }

            tracing::debug!(
                operation = %wiring.operation,
                pres = self.pre_count(&wiring.operation),
                posts = self.post_count(&wiring.operation),
                "operation wired from config"
            );
        }
        Ok(self)
    }

    /// Snapshot an operation's definition for one invocation, lazily
    /// registering the target type's declared raw member if needed. The
    /// snapshot keeps the interceptor lists stable for the whole
    /// invocation, whatever the registry does afterward.
    pub(crate) fn snapshot(&self, name: &str) -> Result<OperationDefinition<T>, RegistryError> {
        self.ensure_registered(name)?;
        self.operations
            .get(name)
            .map(|definition| definition.clone())
            .ok_or_else(|| RegistryError::NoImplementation(name.to_string()))
    }

    fn ensure_registered(&self, name: &str) -> Result<(), RegistryError> {
        if self.operations.contains_key(name) {
            return Ok(());
        }
        match T::raw_operation(name) {
            Some(implementation) => {
                self.operations
                    .entry(name.to_string())
                    .or_insert_with(|| OperationDefinition::new(implementation, None));
                Ok(())
            }
            None => Err(RegistryError::NoImplementation(name.to_string())),
        }
    }
}
