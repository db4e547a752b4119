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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("fcm".to_string()), None)
            .expect("failed to initialise fcm metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register fcm metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Wall time spent in a single reconcile invocation",
        );
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
}

impl ControllerReconcileResult {
    pub fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
        }
    }
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    elapsed: Duration,
) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry().gather(), &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_outcomes_are_exported() {
        record_controller_reconcile(
            "metrics-test",
            ControllerReconcileResult::Requeue,
            Duration::from_millis(5),
        );
        let text = String::from_utf8(gather().expect("gather")).expect("utf8");
        assert!(text.contains("fcm_controller_reconciles_total"));
        assert!(text.contains("controller=\"metrics-test\""));
        assert!(text.contains("result=\"requeue\""));
        assert!(text.contains("fcm_controller_reconcile_duration_seconds"));
    }
}
