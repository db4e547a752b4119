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

use crate::fcm::config::ControllerConfig;
use crate::fcm::controller::reconcile::ReconcileContext;
use crate::fcm::k8s::deployment::FirewallDeployment;
use crate::fcm::k8s::event::{EventRecorder, InMemoryEventRecorder};
use crate::fcm::k8s::firewall::Firewall;
use crate::fcm::k8s::set::FirewallSet;
use crate::fcm::k8s::{Resource, ResourceStore, Scheme};
use crate::fcm::util::clock::{Clock, SystemClock};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Shared state handed to every controller: store access, configuration,
/// time source, event sink, injected collaborators and the work queue.
pub struct ControllerRuntime {
    store: Arc<dyn ResourceStore>,
    scheme: Arc<Scheme>,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventRecorder>,
    dependencies: DependencyRegistry,
    work_queue: WorkQueue<ControllerWorkItem>,
}

impl ControllerRuntime {
    pub fn new(store: Arc<dyn ResourceStore>, scheme: Scheme, config: ControllerConfig) -> Self {
        Self {
            store,
            scheme: Arc::new(scheme),
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(InMemoryEventRecorder::new()),
            dependencies: DependencyRegistry::new(),
            work_queue: WorkQueue::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_recorder(mut self, events: Arc<dyn EventRecorder>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<dyn EventRecorder> {
        &self.events
    }

    pub fn register_dependency<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(dependency)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    /// Context without a deadline, for direct invocations.
    pub fn context(&self) -> ReconcileContext<'_> {
        ReconcileContext::new(self)
    }

    pub fn context_with_deadline(&self, deadline: Instant) -> ReconcileContext<'_> {
        ReconcileContext::with_deadline(self, deadline)
    }

    pub fn work_queue(&self) -> WorkQueue<ControllerWorkItem> {
        self.work_queue.clone()
    }
}

#[derive(Default)]
struct DependencyRegistry {
    values: StdRwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DependencyRegistry {
    fn new() -> Self {
        Self::default()
    }

    fn insert<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self.values.write().expect("dependency registry poisoned");
        let existing = guard.insert(TypeId::of::<T>(), dependency as Arc<dyn Any + Send + Sync>);
        existing.and_then(|arc| arc.downcast::<T>().ok())
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let guard = self.values.read().expect("dependency registry poisoned");
        guard
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }
}

/// Identity of a resource a controller converges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControllerTarget {
    Deployment { namespace: String, name: String },
    Set { namespace: String, name: String },
    Firewall { namespace: String, name: String },
}

impl ControllerTarget {
    /// Maps a stored kind onto a target; unknown kinds yield `None`.
    pub fn for_kind(kind: &str, namespace: &str, name: &str) -> Option<Self> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        if kind == FirewallDeployment::KIND {
            Some(ControllerTarget::Deployment { namespace, name })
        } else if kind == FirewallSet::KIND {
            Some(ControllerTarget::Set { namespace, name })
        } else if kind == Firewall::KIND {
            Some(ControllerTarget::Firewall { namespace, name })
        } else {
            None
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControllerTarget::Deployment { .. } => FirewallDeployment::KIND,
            ControllerTarget::Set { .. } => FirewallSet::KIND,
            ControllerTarget::Firewall { .. } => Firewall::KIND,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ControllerTarget::Deployment { namespace, .. }
            | ControllerTarget::Set { namespace, .. }
            | ControllerTarget::Firewall { namespace, .. } => namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ControllerTarget::Deployment { name, .. }
            | ControllerTarget::Set { name, .. }
            | ControllerTarget::Firewall { name, .. } => name,
        }
    }
}

impl fmt::Display for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind(), self.namespace(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerWorkItem {
    pub controller: &'static str,
    pub target: ControllerTarget,
}

impl ControllerWorkItem {
    pub fn new(controller: &'static str, target: ControllerTarget) -> Self {
        Self { controller, target }
    }
}

impl fmt::Display for ControllerWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller, self.target)
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    queued: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    failures: HashMap<T, u32>,
    shut_down: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            shut_down: false,
        }
    }
}

struct WorkQueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

/// Deduplicating work queue.
///
/// An item is queued at most once. An item handed out by [`WorkQueue::next`]
/// is not handed out again until [`WorkQueue::done`] was called for it;
/// enqueues in between mark it dirty and it is queued again on `done`.
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.inner.state.lock().expect("work queue lock poisoned")
    }

    pub fn enqueue(&self, item: T) {
        {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            if state.processing.contains(&item) {
                state.dirty.insert(item);
                return;
            }
            if !state.queued.insert(item.clone()) {
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// Enqueues `item` once `delay` elapsed. Must be called within a Tokio runtime.
    pub fn enqueue_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(item);
        });
    }

    /// Enqueues `item` after its per-item failure backoff and returns the delay.
    pub fn enqueue_rate_limited(&self, item: T) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = failure_backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.enqueue_after(item, delay);
        delay
    }

    /// Resets the failure backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn failures(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` after [`WorkQueue::shutdown`].
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.queued.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as processed, re-queueing it if it was enqueued meanwhile.
    pub fn done(&self, item: &T) {
        let requeue = {
            let mut state = self.lock();
            state.processing.remove(item);
            state.dirty.remove(item)
        };
        if requeue {
            self.enqueue(item.clone());
        }
    }

    pub fn shutdown(&self) {
        self.lock().shut_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn failure_backoff(failures: u32) -> Duration {
    let factor = 1u64.checked_shl(failures.min(16)).unwrap_or(u64::MAX);
    Duration::from_millis(BACKOFF_INITIAL_MS.saturating_mul(factor).min(BACKOFF_MAX_MS))
}
