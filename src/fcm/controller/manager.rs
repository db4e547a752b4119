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

//! Task layout of a running controller manager.
//!
//! Every registered controller gets one watch dispatcher per kind it cares
//! about and a resync ticker. All of them feed the runtime's work queue,
//! which a fixed pool of workers drains. Reconciles run on the blocking pool
//! with a deadline; a worker waits for its reconcile to return before it
//! picks the next item.

use crate::fcm::controller::reconcile::{Action, Controller, DynReconciler, GenericReconciler, ReconcileError};
use crate::fcm::controller::runtime::{
    failure_backoff, ControllerRuntime, ControllerTarget, ControllerWorkItem, WorkQueue,
};
use crate::fcm::k8s::meta::controller_of;
use crate::fcm::k8s::store::{object_meta, WatchEvent};
use crate::fcm::logger::{log_debug, log_error, log_info, log_warn};
use crate::fcm::observability::metrics::{record_controller_reconcile, ControllerReconcileResult};
use crate::fcm::observability;
use crate::fcm::observability::tracing::{current_context, in_blocking_span, with_span};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller-manager";

type ReconcilerMap = HashMap<&'static str, Arc<dyn DynReconciler>>;

pub struct ControllerManager {
    runtime: Arc<ControllerRuntime>,
    reconcilers: ReconcilerMap,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControllerManager {
    pub fn new(runtime: Arc<ControllerRuntime>) -> Self {
        Self {
            runtime,
            reconcilers: HashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a controller. A second controller with the same name
    /// replaces the first.
    pub fn register<C: Controller>(&mut self, controller: C) -> &mut Self {
        let reconciler: Arc<dyn DynReconciler> = Arc::new(GenericReconciler::new(controller));
        self.reconcilers.insert(reconciler.name(), reconciler);
        self
    }

    pub fn runtime(&self) -> &Arc<ControllerRuntime> {
        &self.runtime
    }

    /// Spawns dispatchers, resync tickers and workers. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        observability::init(self.runtime.config());
        let queue = self.runtime.work_queue();
        let reconcilers = Arc::new(self.reconcilers.clone());
        let mut tasks = self.tasks.lock().expect("manager task list poisoned");

        for reconciler in self.reconcilers.values() {
            let controller = reconciler.name();
            let primary = reconciler.kind();
            for kind in std::iter::once(primary).chain(reconciler.owned_kinds().iter().copied()) {
                let dispatcher = Dispatcher {
                    runtime: Arc::clone(&self.runtime),
                    queue: queue.clone(),
                    controller,
                    primary,
                    kind,
                };
                tasks.push(tokio::spawn(dispatcher.run(self.shutdown.clone())));
            }
            tasks.push(tokio::spawn(resync(
                Arc::clone(&self.runtime),
                queue.clone(),
                controller,
                primary,
                self.shutdown.clone(),
            )));
        }

        let workers = self.runtime.config().workers.max(1);
        for _ in 0..workers {
            tasks.push(tokio::spawn(run_worker(
                Arc::clone(&self.runtime),
                queue.clone(),
                Arc::clone(&reconcilers),
                self.shutdown.clone(),
            )));
        }

        let controllers = self.reconcilers.len().to_string();
        let workers = workers.to_string();
        log_info(
            COMPONENT,
            "Controller manager started",
            &[("controllers", controllers.as_str()), ("workers", workers.as_str())],
        );
    }

    /// Stops every task and waits for in-flight reconciles to return.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.runtime.work_queue().shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("manager task list poisoned"));
        for task in tasks {
            if let Err(err) = task.await {
                let error = err.to_string();
                log_warn(COMPONENT, "Manager task ended abnormally", &[("error", error.as_str())]);
            }
        }
        log_info(COMPONENT, "Controller manager stopped", &[]);
    }
}

/// Maps store notifications of one kind onto work items of one controller.
struct Dispatcher {
    runtime: Arc<ControllerRuntime>,
    queue: WorkQueue<ControllerWorkItem>,
    controller: &'static str,
    primary: &'static str,
    kind: &'static str,
}

impl Dispatcher {
    async fn run(self, shutdown: CancellationToken) {
        let namespace = self.runtime.config().namespace.clone();
        let mut attempt = 0u32;
        loop {
            let mut watch = self.runtime.store().watch(self.kind, namespace.as_deref());
            self.relist(namespace.as_deref());

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = watch.next() => match event {
                        Some(WatchEvent::Lagged(missed)) => {
                            let missed = missed.to_string();
                            log_warn(
                                COMPONENT,
                                "Watch fell behind, relisting",
                                &[("kind", self.kind), ("missed", missed.as_str())],
                            );
                            self.relist(namespace.as_deref());
                        }
                        Some(event) => {
                            attempt = 0;
                            if let Some(object) = event.object() {
                                self.route(object);
                            }
                        }
                        None => break,
                    }
                }
            }

            let delay = failure_backoff(attempt);
            attempt = attempt.saturating_add(1);
            log_warn(COMPONENT, "Watch closed, resubscribing", &[("kind", self.kind)]);
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    fn relist(&self, namespace: Option<&str>) {
        match self.runtime.store().list(self.kind, namespace, None) {
            Ok(objects) => objects.iter().for_each(|object| self.route(object)),
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to list objects",
                    &[("kind", self.kind), ("error", error.as_str())],
                );
            }
        }
    }

    fn route(&self, object: &Value) {
        let Ok(meta) = object_meta(object) else {
            return;
        };
        let target = if self.kind == self.primary {
            ControllerTarget::for_kind(self.primary, &meta.namespace, &meta.name)
        } else {
            controller_of(&meta)
                .filter(|owner| owner.kind == self.primary)
                .and_then(|owner| ControllerTarget::for_kind(self.primary, &meta.namespace, &owner.name))
        };
        if let Some(target) = target {
            self.queue.enqueue(ControllerWorkItem::new(self.controller, target));
        }
    }
}

/// Periodically queues every object of the primary kind so missed
/// notifications are eventually corrected.
async fn resync(
    runtime: Arc<ControllerRuntime>,
    queue: WorkQueue<ControllerWorkItem>,
    controller: &'static str,
    kind: &'static str,
    shutdown: CancellationToken,
) {
    let namespace = runtime.config().namespace.clone();
    let mut ticker = interval(runtime.config().resync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let objects = match runtime.store().list(kind, namespace.as_deref(), None) {
            Ok(objects) => objects,
            Err(err) => {
                let error = err.to_string();
                log_warn(COMPONENT, "Resync listing failed", &[("kind", kind), ("error", error.as_str())]);
                continue;
            }
        };
        for object in &objects {
            let Ok(meta) = object_meta(object) else {
                continue;
            };
            if let Some(target) = ControllerTarget::for_kind(kind, &meta.namespace, &meta.name) {
                queue.enqueue(ControllerWorkItem::new(controller, target));
            }
        }
        let count = objects.len().to_string();
        log_debug(COMPONENT, "Resync queued objects", &[("controller", controller), ("count", count.as_str())]);
    }
}

async fn run_worker(
    runtime: Arc<ControllerRuntime>,
    queue: WorkQueue<ControllerWorkItem>,
    reconcilers: Arc<ReconcilerMap>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => return,
            item = queue.next() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let Some(reconciler) = reconcilers.get(item.controller).cloned() else {
            queue.done(&item);
            continue;
        };
        let controller = item.controller;
        with_span(
            controller,
            "reconcile",
            process(Arc::clone(&runtime), &queue, reconciler, &item),
        )
        .await;
        queue.done(&item);
    }
}

/// Runs one reconcile on the blocking pool and schedules the follow-up.
async fn process(
    runtime: Arc<ControllerRuntime>,
    queue: &WorkQueue<ControllerWorkItem>,
    reconciler: Arc<dyn DynReconciler>,
    item: &ControllerWorkItem,
) {
    let controller = item.controller;
    let started = Instant::now();
    let deadline = started + runtime.config().reconcile_timeout;
    let parent = current_context();
    let target = item.target.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        in_blocking_span(controller, "invoke", parent, || {
            let ctx = runtime.context_with_deadline(deadline);
            reconciler.reconcile_target(&ctx, &target)
        })
    })
    .await;

    let target = item.target.to_string();
    let result = match outcome {
        Ok(Ok(Action::Done)) => {
            queue.forget(item);
            log_debug(controller, "Reconciled", &[("target", target.as_str())]);
            ControllerReconcileResult::Success
        }
        Ok(Ok(Action::RequeueAfter { after, reason })) => {
            queue.forget(item);
            queue.enqueue_after(item.clone(), after);
            let after = format!("{:?}", after);
            log_debug(
                controller,
                "Reconcile deferred",
                &[
                    ("target", target.as_str()),
                    ("after", after.as_str()),
                    ("reason", reason.as_str()),
                ],
            );
            ControllerReconcileResult::Requeue
        }
        Ok(Err(err)) => {
            let delay = format!("{:?}", queue.enqueue_rate_limited(item.clone()));
            let error = err.to_string();
            let fields = [
                ("target", target.as_str()),
                ("error", error.as_str()),
                ("retry_in", delay.as_str()),
            ];
            match err {
                ReconcileError::Validation(_) => {
                    log_error(controller, "Reconcile rejected object", &fields)
                }
                _ => log_warn(controller, "Reconcile failed", &fields),
            }
            ControllerReconcileResult::Error
        }
        Err(err) => {
            let delay = format!("{:?}", queue.enqueue_rate_limited(item.clone()));
            let error = err.to_string();
            log_error(
                controller,
                "Reconcile task aborted",
                &[
                    ("target", target.as_str()),
                    ("error", error.as_str()),
                    ("retry_in", delay.as_str()),
                ],
            );
            ControllerReconcileResult::Error
        }
    };
    record_controller_reconcile(controller, result, started.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcm::controller::set::SetController;
    use crate::fcm::k8s::firewall::Firewall;
    use crate::fcm::k8s::set::FirewallSet;
    use crate::fcm::k8s::Resource;
    use crate::fcm::test_support::{firewall_set, orphan_firewall, TestEnv};
    use crate::fcm::k8s::OwnerReference;
    use std::time::Duration;
    use tokio::time::timeout;

    fn set_item(name: &str) -> ControllerWorkItem {
        ControllerWorkItem::new(
            "firewall-set",
            ControllerTarget::Set {
                namespace: "shoot".to_string(),
                name: name.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn child_events_are_routed_to_their_controller() {
        let env = TestEnv::new();
        let set = env.create(&firewall_set("shoot", "fw-set", 1, "n1-medium"));
        let queue = WorkQueue::new();
        let dispatcher = Dispatcher {
            runtime: Arc::clone(&env.runtime),
            queue: queue.clone(),
            controller: "firewall-set",
            primary: FirewallSet::KIND,
            kind: Firewall::KIND,
        };

        let mut firewall = orphan_firewall(&set, "fw-set-abcde");
        dispatcher.route(&serde_json::to_value(&firewall).expect("encode"));
        assert!(queue.is_empty());

        firewall.metadata.owner_references.push(OwnerReference::controller(
            FirewallSet::API_VERSION,
            FirewallSet::KIND,
            &set.metadata,
        ));
        dispatcher.route(&serde_json::to_value(&firewall).expect("encode"));
        let item = timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("queued item")
            .expect("queue open");
        assert_eq!(item, set_item("fw-set"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_drive_sets_to_their_replica_count() {
        let env = TestEnv::new();
        let mut manager = ControllerManager::new(Arc::clone(&env.runtime));
        manager.register(SetController::new());
        manager.start();

        let set = env.create(&firewall_set("shoot", "fw-set", 2, "n1-medium"));
        let converged = timeout(Duration::from_secs(5), async {
            loop {
                if env.owned_firewalls(&set).len() == 2 {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        manager.shutdown().await;
        assert!(converged.is_ok(), "set did not converge");
    }
}
