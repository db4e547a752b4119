/*
 * Copyright (C) 2024 The FCM Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Span identifiers for reconcile invocations. Spans are emitted through the
//! `tracing` crate and mirrored into a task-local [`TraceContext`] so the
//! structured logger can stamp `trace_id` / `span_id` on every line written
//! while a reconcile is running.

use rand::{rngs::OsRng, RngCore};
use std::cell::RefCell;
use std::fmt::Write;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    fn child_of(parent: Option<&TraceContext>) -> Self {
        let trace_id = parent
            .map(|ctx| ctx.trace_id.clone())
            .unwrap_or_else(|| Arc::from(random_hex(16)));
        Self {
            trace_id,
            span_id: Arc::from(random_hex(8)),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

thread_local! {
    // Reconcilers run on blocking threads where no task-local is available.
    static BLOCKING_TRACE: RefCell<Option<TraceContext>> = const { RefCell::new(None) };
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once; a subscriber installed elsewhere wins.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE
        .try_with(|ctx| ctx.clone())
        .ok()
        .or_else(|| BLOCKING_TRACE.with(|slot| slot.borrow().clone()))
}

/// Runs `fut` inside a new span whose identifiers are visible to the logger.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let context = TraceContext::child_of(current_context().as_ref());
    let name = span_name.into();
    let span = tracing::info_span!(
        "fcm",
        component = component,
        span = name.as_str(),
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}

/// Blocking counterpart of [`with_span`] for code running on a plain thread.
pub fn in_blocking_span<T>(
    component: &'static str,
    span_name: &str,
    parent: Option<TraceContext>,
    work: impl FnOnce() -> T,
) -> T {
    let context = TraceContext::child_of(parent.as_ref());
    let span = tracing::info_span!(
        "fcm",
        component = component,
        span = span_name,
        trace_id = context.trace_id(),
        span_id = context.span_id(),
    );
    let _guard = span.enter();
    let previous = BLOCKING_TRACE.with(|slot| slot.replace(Some(context)));
    let result = work();
    BLOCKING_TRACE.with(|slot| {
        *slot.borrow_mut() = previous;
    });
    result
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_spans_share_trace_id() {
        init();
        let (outer, inner) = with_span("test", "outer", async {
            let outer = current_context().expect("outer context");
            let inner = with_span("test", "inner", async {
                current_context().expect("inner context")
            })
            .await;
            (outer, inner)
        })
        .await;

        assert_eq!(outer.trace_id(), inner.trace_id());
        assert_ne!(outer.span_id(), inner.span_id());
        assert!(current_context().is_none());
    }

    #[test]
    fn blocking_span_inherits_parent_and_restores() {
        let parent = TraceContext::child_of(None);
        let seen = in_blocking_span("test", "blocking", Some(parent.clone()), || {
            current_context().expect("blocking context")
        });
        assert_eq!(seen.trace_id(), parent.trace_id());
        assert!(current_context().is_none());
    }
}
