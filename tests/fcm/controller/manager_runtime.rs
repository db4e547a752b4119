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

use fcm::fcm::controller::{
    ControllerManager, DeploymentController, SetController, TimeoutController,
};
use fcm::fcm::k8s::deployment::FirewallDeployment;
use fcm::fcm::test_support::{deployment, TestEnv};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manager_rolls_out_a_new_deployment() {
    let env = TestEnv::new();
    let mut manager = ControllerManager::new(Arc::clone(&env.runtime));
    manager
        .register(DeploymentController::new())
        .register(SetController::new())
        .register(TimeoutController::new());
    manager.start();

    let created = env.create(&deployment("shoot", "fw", 1, "n1-medium"));

    wait_for("a firewall set", || env.owned_sets(&created).len() == 1).await;
    let set = env.owned_sets(&created).remove(0);
    wait_for("a firewall", || env.owned_firewalls(&set).len() == 1).await;
    wait_for("the deployment status", || {
        env.get::<FirewallDeployment>("shoot", "fw")
            .status
            .target_replicas
            == 1
    })
    .await;

    manager.shutdown().await;
    assert!(env.runtime.work_queue().next().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_deployment_cascades_through_the_manager() {
    let env = TestEnv::new();
    let mut manager = ControllerManager::new(Arc::clone(&env.runtime));
    manager
        .register(DeploymentController::new())
        .register(SetController::new());
    manager.start();

    let created = env.create(&deployment("shoot", "fw", 1, "n1-medium"));
    wait_for("a firewall set", || env.owned_sets(&created).len() == 1).await;
    let set = env.owned_sets(&created).remove(0);
    wait_for("a firewall", || env.owned_firewalls(&set).len() == 1).await;

    env.delete::<FirewallDeployment>("shoot", "fw");
    wait_for("the deployment to be gone", || {
        env.get_opt::<FirewallDeployment>("shoot", "fw").is_none()
    })
    .await;

    manager.shutdown().await;
}
