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

//! Observability primitives for the controller manager.
//!
//! Metrics follow the Prometheus conventions used across Kubernetes
//! controllers: snake_case names, counters ending in `_total`, durations in
//! `_seconds`. Nothing here serves HTTP; callers that expose an endpoint use
//! [`metrics::gather`].

use crate::fcm::config::ControllerConfig;
use crate::fcm::logger::set_log_format;

pub mod metrics;
pub mod tracing;

/// Applies the configured log format and installs the tracing subscriber.
/// Safe to call more than once.
pub fn init(config: &ControllerConfig) {
    set_log_format(config.log_format);
    tracing::init();
}
