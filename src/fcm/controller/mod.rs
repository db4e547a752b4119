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

pub mod deployment;
pub mod manager;
pub mod reconcile;
pub mod revision;
pub mod runtime;
pub mod set;
pub mod status;
pub mod timeout;

pub use deployment::DeploymentController;
pub use manager::ControllerManager;
pub use reconcile::{Action, Controller, GenericReconciler, ReconcileContext, ReconcileError};
pub use runtime::{ControllerRuntime, ControllerTarget, WorkQueue};
pub use set::{DynInfrastructureClient, DynMachineProvider, SetController};
pub use status::{evaluate, Evaluation, FirewallHealth};
pub use timeout::TimeoutController;
