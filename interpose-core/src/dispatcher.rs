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

//! Operation dispatcher: the call surface of a wrapped operation.
//!
//! `invoke` is where a call site meets the engine. It is also the one
//! boundary where the caller's trailing completion callable is separated
//! from the data arguments; inside the engine the two never mix.

use crate::invocation::Invocation;
use crate::operation::{CallArgs, CompletionFn, Interceptable};
use crate::registry::{InterceptorRegistry, RegistryError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Result of invoking a wrapped operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The chain fully resolved within the call. Carries the
    /// implementation's return value when it produced one.
    Completed(Option<Value>),
    /// An asynchronous pre or a deferred continuation is still
    /// outstanding; resolution arrives through the chain-control handles,
    /// the trailing completion, or the error sink.
    Pending,
}

/// Errors surfaced by `invoke` itself.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A propagated error reached the raise sink: the caller supplied no
    /// trailing completion and the operation has no default error handler.
    #[error("Operation `{operation}` aborted: {source}")]
    Aborted {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Dispatcher for invoking wrapped operations against a registry.
///
/// Distinct invocations are fully independent: each gets its own
/// [`Invocation`] state and a snapshot of the operation's interceptor
/// lists, so concurrent calls (even on the same target instance) need no
/// coordination here.
pub struct OperationDispatcher<T> {
    registry: Arc<InterceptorRegistry<T>>,
}

impl<T> Clone for OperationDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Interceptable> OperationDispatcher<T> {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<InterceptorRegistry<T>>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher reads from.
    pub fn registry(&self) -> &Arc<InterceptorRegistry<T>> {
        &self.registry
    }

    /// Invoke `operation` on `target`.
    ///
    /// The external signature of the wrapped operation is unchanged from
    /// its raw implementation: the data arguments plus an optional
    /// error-first trailing completion. An operation that was never
    /// registered is lazily registered against the target type's declared
    /// raw member, so a plain member behaves exactly as if called
    /// directly.
    pub fn invoke(
        &self,
        target: &Arc<T>,
        operation: &str,
        args: CallArgs,
        completion: Option<CompletionFn<T>>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let definition = self.registry.snapshot(operation)?;
        let invocation = Invocation::new(operation, Arc::clone(target), definition, args, completion);
        invocation.begin()?;

        match invocation.settled_value() {
            Some(value) => Ok(DispatchOutcome::Completed(value)),
            None => {
                tracing::debug!(operation, "invocation suspended");
                Ok(DispatchOutcome::Pending)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{PostInterceptor, PreInterceptor};
    use crate::operation::OperationFn;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Document {
        log: Mutex<Vec<String>>,
    }

    impl Document {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, entry: impl Into<String>) {
            self.log.lock().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl Interceptable for Document {
        fn raw_operation(name: &str) -> Option<OperationFn<Self>> {
            match name {
                "touch" => Some(Arc::new(|doc: &Document, _, _| {
                    doc.record("touch");
                    Some(json!("touched"))
                })),
                _ => None,
            }
        }
    }

    fn dispatcher() -> OperationDispatcher<Document> {
        OperationDispatcher::new(Arc::new(InterceptorRegistry::new()))
    }

    #[test]
    fn test_pass_through_without_interceptors() {
        let dispatcher = dispatcher();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(|doc: &Document, args, _| {
                doc.record(format!("save:{}", args.len()));
                Some(json!(7))
            }),
            None,
        );

        let doc = Document::new();
        let outcome = dispatcher
            .invoke(&doc, "save", vec![json!("a")], None)
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(Some(json!(7))));
        assert_eq!(doc.entries(), vec!["save:1"]);
    }

    #[test]
    fn test_lazy_registration_on_invoke() {
        let dispatcher = dispatcher();
        let doc = Document::new();

        let outcome = dispatcher.invoke(&doc, "touch", vec![], None).unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed(Some(json!("touched"))));
        assert!(dispatcher.registry().is_registered("touch"));
    }

    #[test]
    fn test_unknown_operation_fails() {
        let dispatcher = dispatcher();
        let doc = Document::new();

        let result = dispatcher.invoke(&doc, "missing", vec![], None);
        assert!(matches!(
            result,
            Err(DispatchError::Registry(RegistryError::NoImplementation(name))) if name == "missing"
        ));
    }

    #[test]
    fn test_pres_run_in_order_then_implementation_once() {
        let dispatcher = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let implementation_calls = calls.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(move |doc: &Document, _, _| {
                implementation_calls.fetch_add(1, Ordering::SeqCst);
                doc.record("impl");
                None
            }),
            None,
        );

        for index in 0..3 {
            dispatcher
                .registry()
                .add_pre(
                    "save",
                    PreInterceptor::sync(move |doc: &Document, next, _| {
                        doc.record(format!("pre{index}"));
                        let _ = next.proceed();
                    }),
                )
                .unwrap();
        }

        let doc = Document::new();
        dispatcher.invoke(&doc, "save", vec![], None).unwrap();

        assert_eq!(doc.entries(), vec!["pre0", "pre1", "pre2", "impl"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pre_error_short_circuits_everything() {
        let dispatcher = dispatcher();
        let later_stages = Arc::new(AtomicUsize::new(0));

        let implementation_counter = later_stages.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(move |_: &Document, _, _| {
                implementation_counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            None,
        );

        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::sync(|_, next, _| {
                    let _ = next.fail(anyhow::anyhow!("validation rejected"));
                }),
            )
            .unwrap();
        let skipped_pre = later_stages.clone();
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::sync(move |_, next, _| {
                    skipped_pre.fetch_add(1, Ordering::SeqCst);
                    let _ = next.proceed();
                }),
            )
            .unwrap();
        let skipped_post = later_stages.clone();
        dispatcher
            .registry()
            .add_post(
                "save",
                PostInterceptor::new(move |_, next, _| {
                    skipped_post.fetch_add(1, Ordering::SeqCst);
                    let _ = next.proceed();
                }),
            )
            .unwrap();

        let doc = Document::new();
        let result = dispatcher.invoke(&doc, "save", vec![], None);

        // no completion and no default handler: the error is raised back
        match result {
            Err(DispatchError::Aborted { operation, source }) => {
                assert_eq!(operation, "save");
                assert_eq!(source.to_string(), "validation rejected");
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert_eq!(later_stages.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_default_handler_receives_error() {
        let dispatcher = dispatcher();
        let handled = Arc::new(Mutex::new(Vec::new()));
        let handler_log = handled.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(|_: &Document, _, _| None),
            Some(Arc::new(move |_: &Document, error| {
                handler_log.lock().push(error.to_string());
            })),
        );
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::sync(|_, next, _| {
                    let _ = next.fail(anyhow::anyhow!("boom"));
                }),
            )
            .unwrap();

        let doc = Document::new();
        let outcome = dispatcher.invoke(&doc, "save", vec![], None).unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(None));
        assert_eq!(handled.lock().clone(), vec!["boom"]);
    }

    #[test]
    fn test_trailing_completion_outranks_default_handler() {
        let dispatcher = dispatcher();
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let handler_counter = handler_calls.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(|_: &Document, _, _| None),
            Some(Arc::new(move |_: &Document, _| {
                handler_counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::sync(|_, next, _| {
                    let _ = next.fail(anyhow::anyhow!("boom"));
                }),
            )
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let completion_log = received.clone();
        let doc = Document::new();
        dispatcher
            .invoke(
                &doc,
                "save",
                vec![],
                Some(Arc::new(move |_: &Document, result| {
                    completion_log
                        .lock()
                        .push(result.map_err(|e| e.to_string()));
                })),
            )
            .unwrap();

        assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
        assert_eq!(received.lock().clone(), vec![Err("boom".to_string())]);
    }

    #[test]
    fn test_argument_rewrite_reaches_all_downstream_stages() {
        let dispatcher = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let implementation_seen = seen.clone();
        dispatcher.registry().register_operation(
            "set",
            Arc::new(move |_: &Document, args, _| {
                implementation_seen.lock().push(("impl", args.clone()));
                None
            }),
            None,
        );
        dispatcher
            .registry()
            .add_pre(
                "set",
                PreInterceptor::sync(|_, next, _| {
                    let _ = next.proceed_with(vec![json!("foo"), json!("bar")]);
                }),
            )
            .unwrap();
        let downstream_pre_seen = seen.clone();
        dispatcher
            .registry()
            .add_pre(
                "set",
                PreInterceptor::sync(move |_, next, args| {
                    downstream_pre_seen.lock().push(("pre", args.clone()));
                    let _ = next.proceed();
                }),
            )
            .unwrap();
        let post_seen = seen.clone();
        dispatcher
            .registry()
            .add_post(
                "set",
                PostInterceptor::new(move |_, next, args| {
                    post_seen.lock().push(("post", args.clone()));
                    let _ = next.proceed();
                }),
            )
            .unwrap();

        let doc = Document::new();
        dispatcher
            .invoke(&doc, "set", vec![json!("path"), json!("val")], None)
            .unwrap();

        let rewritten = vec![json!("foo"), json!("bar")];
        assert_eq!(
            seen.lock().clone(),
            vec![
                ("pre", rewritten.clone()),
                ("impl", rewritten.clone()),
                ("post", rewritten),
            ]
        );
    }

    #[test]
    fn test_repeat_continuation_calls_have_single_effect() {
        let dispatcher = dispatcher();
        let implementation_calls = Arc::new(AtomicUsize::new(0));
        let counter = implementation_calls.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(move |_: &Document, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            None,
        );
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::sync(|_, next, _| {
                    let again = next.clone();
                    let _ = next.proceed();
                    let _ = again.proceed();
                    let _ = again.fail(anyhow::anyhow!("too late"));
                }),
            )
            .unwrap();

        let doc = Document::new();
        let outcome = dispatcher.invoke(&doc, "save", vec![], None).unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(None));
        assert_eq!(implementation_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_posts_run_after_implementation_without_completion() {
        let dispatcher = dispatcher();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(|doc: &Document, _, _| {
                doc.record("impl");
                None
            }),
            None,
        );
        for index in 0..2 {
            dispatcher
                .registry()
                .add_post(
                    "save",
                    PostInterceptor::new(move |doc: &Document, next, _| {
                        doc.record(format!("post{index}"));
                        let _ = next.proceed();
                    }),
                )
                .unwrap();
        }

        let doc = Document::new();
        let outcome = dispatcher.invoke(&doc, "save", vec![], None).unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(None));
        assert_eq!(doc.entries(), vec!["impl", "post0", "post1"]);
    }

    #[test]
    fn test_completion_receives_final_vector_after_posts() {
        let dispatcher = dispatcher();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(|_: &Document, _, chain: Option<_>| {
                if let Some(chain) = chain {
                    let _ = chain.proceed_with(vec![json!("saved")]);
                }
                None
            }),
            None,
        );
        dispatcher
            .registry()
            .add_post(
                "save",
                PostInterceptor::new(|_, next, _| {
                    let _ = next.proceed_with(vec![json!("audited")]);
                }),
            )
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let completion_log = received.clone();
        let doc = Document::new();
        let outcome = dispatcher
            .invoke(
                &doc,
                "save",
                vec![json!("draft")],
                Some(Arc::new(move |_: &Document, result| {
                    completion_log.lock().push(result.map_err(|e| e.to_string()));
                })),
            )
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(None));
        assert_eq!(received.lock().clone(), vec![Ok(vec![json!("audited")])]);
    }

    #[test]
    fn test_post_error_aborts_remaining_posts() {
        let dispatcher = dispatcher();
        let skipped = Arc::new(AtomicUsize::new(0));
        dispatcher.registry().register_operation(
            "save",
            Arc::new(|_: &Document, _, chain: Option<_>| {
                if let Some(chain) = chain {
                    let _ = chain.proceed();
                }
                None
            }),
            None,
        );
        dispatcher
            .registry()
            .add_post(
                "save",
                PostInterceptor::new(|_, next, _| {
                    let _ = next.fail(anyhow::anyhow!("post exploded"));
                }),
            )
            .unwrap();
        let skipped_counter = skipped.clone();
        dispatcher
            .registry()
            .add_post(
                "save",
                PostInterceptor::new(move |_, next, _| {
                    skipped_counter.fetch_add(1, Ordering::SeqCst);
                    let _ = next.proceed();
                }),
            )
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let completion_log = received.clone();
        let doc = Document::new();
        dispatcher
            .invoke(
                &doc,
                "save",
                vec![],
                Some(Arc::new(move |_: &Document, result| {
                    completion_log.lock().push(result.map_err(|e| e.to_string()));
                })),
            )
            .unwrap();

        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(
            received.lock().clone(),
            vec![Err("post exploded".to_string())]
        );
    }

    #[test]
    fn test_async_pre_holds_operation_until_completion() {
        let dispatcher = dispatcher();
        let implementation_calls = Arc::new(AtomicUsize::new(0));
        let counter = implementation_calls.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(move |_: &Document, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            None,
        );

        // serial cursor proceeds but the completion handle never fires
        let parked = Arc::new(Mutex::new(None));
        let slot = parked.clone();
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::asynchronous(move |_, next, done, _| {
                    *slot.lock() = Some(done);
                    let _ = next.proceed();
                }),
            )
            .unwrap();

        let doc = Document::new();
        let outcome = dispatcher.invoke(&doc, "save", vec![], None).unwrap();
        assert_eq!(outcome, DispatchOutcome::Pending);
        assert_eq!(implementation_calls.load(Ordering::SeqCst), 0);

        // releasing the barrier fires the operation on the caller's thread
        let done = parked.lock().take().unwrap();
        done.complete().unwrap();
        assert_eq!(implementation_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_async_completion_error_blocks_implementation() {
        let dispatcher = dispatcher();
        let handled = Arc::new(AtomicUsize::new(0));
        let implementation_calls = Arc::new(AtomicUsize::new(0));

        let counter = implementation_calls.clone();
        let handler_counter = handled.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(move |_: &Document, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Some(Arc::new(move |_: &Document, _| {
                handler_counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::asynchronous(|_, next, done, _| {
                    let _ = next.proceed();
                    let _ = done.fail(anyhow::anyhow!("background check failed"));
                }),
            )
            .unwrap();

        let doc = Document::new();
        let outcome = dispatcher.invoke(&doc, "save", vec![], None).unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(None));
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(implementation_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeat_async_completion_decrements_once() {
        let dispatcher = dispatcher();
        let implementation_calls = Arc::new(AtomicUsize::new(0));
        let counter = implementation_calls.clone();
        dispatcher.registry().register_operation(
            "save",
            Arc::new(move |_: &Document, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            None,
        );

        // first async pre signals twice; second never signals
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::asynchronous(|_, next, done, _| {
                    let again = done.clone();
                    let _ = done.complete();
                    let _ = again.complete();
                    let _ = next.proceed();
                }),
            )
            .unwrap();
        dispatcher
            .registry()
            .add_pre(
                "save",
                PreInterceptor::asynchronous(|_, next, _done, _| {
                    let _ = next.proceed();
                }),
            )
            .unwrap();

        let doc = Document::new();
        let outcome = dispatcher.invoke(&doc, "save", vec![], None).unwrap();

        assert_eq!(outcome, DispatchOutcome::Pending);
        assert_eq!(implementation_calls.load(Ordering::SeqCst), 0);
    }
}
