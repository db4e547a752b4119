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

//! Generic convergence engine.
//!
//! [`GenericReconciler`] wraps a type-specific [`Controller`] and owns the
//! lifecycle around it: fetch the object, drive the two-phase delete when a
//! deletion timestamp is set, attach the deletion guard otherwise, call the
//! controller and finally persist the status it computed onto a freshly
//! fetched copy of the object.

use crate::fcm::config::ControllerConfig;
use crate::fcm::controller::runtime::{ControllerRuntime, ControllerTarget};
use crate::fcm::k8s::event::{EventRecorder, EventType, ObjectReference};
use crate::fcm::k8s::firewall::FINALIZER;
use crate::fcm::k8s::store::StoreError;
use crate::fcm::k8s::{retry_on_conflict, Api, Resource};
use crate::fcm::logger::{log_debug, log_info};
use crate::fcm::provider::ProviderError;
use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Execution context shared across reconciliation phases.
///
/// The context exposes the underlying `ControllerRuntime` so controllers can
/// reach the store, shared caches and dependency-injected helpers.
pub struct ReconcileContext<'a> {
    runtime: &'a ControllerRuntime,
    deadline: Option<Instant>,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(runtime: &'a ControllerRuntime) -> Self {
        Self {
            runtime,
            deadline: None,
        }
    }

    pub fn with_deadline(runtime: &'a ControllerRuntime, deadline: Instant) -> Self {
        Self {
            runtime,
            deadline: Some(deadline),
        }
    }

    pub fn runtime(&self) -> &'a ControllerRuntime {
        self.runtime
    }

    pub fn config(&self) -> &'a ControllerConfig {
        self.runtime.config()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.runtime.clock().now()
    }

    /// Looks up a dependency that was previously registered with the runtime.
    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.runtime.dependency::<T>()
    }

    pub fn api<R: Resource>(&self) -> Result<Api<R>, ReconcileError> {
        Ok(Api::new(
            Arc::clone(self.runtime.store()),
            self.runtime.scheme(),
        )?)
    }

    /// Fails once the invocation deadline passed. Controllers call this
    /// between external mutations.
    pub fn check_deadline(&self) -> Result<(), ReconcileError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ReconcileError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn record_event<R: Resource>(
        &self,
        object: &R,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let reference = ObjectReference::from_meta(R::KIND, object.metadata());
        self.runtime
            .events()
            .record(&reference, event_type, reason, message);
    }
}

/// Wrapper that stores an `Arc<T>` while remaining `Sized`, enabling trait-object dependencies.
pub struct DependencyHandle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> DependencyHandle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T: ?Sized> Clone for DependencyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Outcome of one reconcile invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter { after: Duration, reason: String },
}

#[derive(Debug)]
pub enum ReconcileError {
    Store(StoreError),
    Provider(ProviderError),
    /// The object is malformed; retrying only helps after a manual fix.
    Validation(String),
    Dependency(&'static str),
    DeadlineExceeded,
    /// Not a failure: run again after `after`.
    Requeue { after: Duration, reason: String },
}

impl ReconcileError {
    pub fn requeue(after: Duration, reason: impl Into<String>) -> Self {
        ReconcileError::Requeue {
            after,
            reason: reason.into(),
        }
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, ReconcileError::Requeue { .. })
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Store(err) => write!(f, "store error: {}", err),
            ReconcileError::Provider(err) => write!(f, "provider error: {}", err),
            ReconcileError::Validation(message) => write!(f, "validation failed: {}", message),
            ReconcileError::Dependency(name) => write!(f, "missing dependency: {}", name),
            ReconcileError::DeadlineExceeded => f.write_str("reconcile deadline exceeded"),
            ReconcileError::Requeue { after, reason } => {
                write!(f, "requeue after {:?}: {}", after, reason)
            }
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::Store(err) => Some(err),
            ReconcileError::Provider(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        ReconcileError::Store(err)
    }
}

impl From<ProviderError> for ReconcileError {
    fn from(err: ProviderError) -> Self {
        ReconcileError::Provider(err)
    }
}

/// Type-specific business logic plugged into [`GenericReconciler`].
pub trait Controller: Send + Sync + 'static {
    type Resource: Resource;

    /// Name used for work items, logs and metrics.
    fn name(&self) -> &'static str;

    /// Kinds whose changes are routed to the controlling owner.
    fn owned_kinds(&self) -> &'static [&'static str] {
        &[]
    }

    /// Deletion guard attached on first reconcile; `None` attaches nothing.
    fn finalizer(&self) -> Option<&'static str> {
        Some(FINALIZER)
    }

    /// Converges the object. Status changes are made on `object` and
    /// persisted by the engine.
    fn reconcile(
        &self,
        ctx: &ReconcileContext,
        object: &mut Self::Resource,
    ) -> Result<(), ReconcileError>;

    /// Drains children before the deletion guard is released.
    fn delete(
        &self,
        ctx: &ReconcileContext,
        object: &mut Self::Resource,
    ) -> Result<(), ReconcileError>;

    /// Copies the reconciled status onto the freshly fetched object.
    fn set_status(&self, reconciled: &Self::Resource, refetched: &mut Self::Resource) {
        *refetched.status_mut() = reconciled.status().clone();
    }

    fn skip_status_update(&self) -> bool {
        false
    }
}

pub struct GenericReconciler<C> {
    controller: C,
}

impl<C: Controller> GenericReconciler<C> {
    pub fn new(controller: C) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn reconcile(
        &self,
        ctx: &ReconcileContext,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ReconcileError> {
        let component = self.controller.name();
        let api = ctx.api::<C::Resource>()?;
        let key = format!("{}/{}", namespace, name);

        let Some(mut object) = api.get_opt(namespace, name)? else {
            log_debug(component, "Object is gone, nothing to reconcile", &[("object", key.as_str())]);
            return Ok(Action::Done);
        };

        if object.metadata().is_being_deleted() {
            return self.finish_deletion(ctx, &api, object, &key);
        }

        if let Some(finalizer) = self.controller.finalizer() {
            if !object.metadata().has_finalizer(finalizer) {
                object = retry_on_conflict(
                    ctx.config().conflict_retries,
                    ctx.config().status_retry_base,
                    || {
                        let mut current = api.get(namespace, name)?;
                        if current.metadata_mut().add_finalizer(finalizer) {
                            current = api.update(&current)?;
                        }
                        Ok(current)
                    },
                )?;
                log_debug(component, "Attached deletion guard", &[("object", key.as_str())]);
            }
        }

        ctx.check_deadline()?;
        let result = self.controller.reconcile(ctx, &mut object);

        if !self.controller.skip_status_update() {
            let persisted = self.persist_status(ctx, &api, &object);
            if let Err(err) = persisted {
                return match result {
                    Err(reconcile_err) if !reconcile_err.is_requeue() => Err(reconcile_err),
                    _ => Err(err),
                };
            }
        }

        into_action(result)
    }

    fn finish_deletion(
        &self,
        ctx: &ReconcileContext,
        api: &Api<C::Resource>,
        mut object: C::Resource,
        key: &str,
    ) -> Result<Action, ReconcileError> {
        let component = self.controller.name();
        let Some(finalizer) = self.controller.finalizer() else {
            return Ok(Action::Done);
        };
        if !object.metadata().has_finalizer(finalizer) {
            return Ok(Action::Done);
        }

        ctx.check_deadline()?;
        if let Err(err) = self.controller.delete(ctx, &mut object) {
            return into_action(Err(err));
        }

        let namespace = object.metadata().namespace.clone();
        let name = object.metadata().name.clone();
        let released = retry_on_conflict(
            ctx.config().conflict_retries,
            ctx.config().status_retry_base,
            || {
                let mut current = api.get(&namespace, &name)?;
                if current.metadata_mut().remove_finalizer(finalizer) {
                    api.update(&current)?;
                }
                Ok(())
            },
        );
        match released {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        log_info(component, "Released deletion guard", &[("object", key)]);
        Ok(Action::Done)
    }

    fn persist_status(
        &self,
        ctx: &ReconcileContext,
        api: &Api<C::Resource>,
        reconciled: &C::Resource,
    ) -> Result<(), ReconcileError> {
        let namespace = reconciled.metadata().namespace.as_str();
        let name = reconciled.metadata().name.as_str();
        let written = retry_on_conflict(
            ctx.config().conflict_retries,
            ctx.config().status_retry_base,
            || {
                let mut refetched = api.get(namespace, name)?;
                let before = refetched.status().clone();
                self.controller.set_status(reconciled, &mut refetched);
                if *refetched.status() != before {
                    api.update_status(&refetched)?;
                }
                Ok(())
            },
        );
        match written {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn into_action(result: Result<(), ReconcileError>) -> Result<Action, ReconcileError> {
    match result {
        Ok(()) => Ok(Action::Done),
        Err(ReconcileError::Requeue { after, reason }) => Ok(Action::RequeueAfter { after, reason }),
        Err(err) => Err(err),
    }
}

/// Object-safe view of a [`GenericReconciler`] used by the manager.
pub trait DynReconciler: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> &'static str;
    fn owned_kinds(&self) -> &'static [&'static str];
    fn reconcile_target(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Action, ReconcileError>;
}

impl<C: Controller> DynReconciler for GenericReconciler<C> {
    fn name(&self) -> &'static str {
        self.controller.name()
    }

    fn kind(&self) -> &'static str {
        <C::Resource as Resource>::KIND
    }

    fn owned_kinds(&self) -> &'static [&'static str] {
        self.controller.owned_kinds()
    }

    fn reconcile_target(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Action, ReconcileError> {
        if target.kind() != <C::Resource as Resource>::KIND {
            return Err(ReconcileError::Validation(format!(
                "{} cannot reconcile {}",
                self.controller.name(),
                target
            )));
        }
        self.reconcile(ctx, target.namespace(), target.name())
    }
}
