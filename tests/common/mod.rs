/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![allow(dead_code)]

use async_trait::async_trait;
use scalebench::{
    config::{ConcurrencyConfig, ResourceThresholds},
    executor::{ExecutorSettings, ScenarioExecutor},
    governor::{HostCounters, ResourceGovernor, ResourceProbe},
    platform::{ClusterHealth, LoadDriver, LoadReport, PlatformError, WorkloadDeployer, WorkloadInstance},
    slots::{SlotManager, SlotSettings},
};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

pub struct FixedProbe(pub f32);

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn read(&mut self) -> Option<HostCounters> {
        Some(HostCounters {
            cpu_percent: self.0,
            memory_percent: 30.0,
            load_average: Some(0.5),
            cores: 8,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadBehaviour {
    Succeed,
    Panic,
    Hang,
}

/// In-memory cluster. Workload addresses are the workload names so that the load stub can
/// tell which scenario it is serving.
pub struct StubPlatform {
    pub deployed: Mutex<Vec<String>>,
    pub torn_down: Mutex<Vec<String>>,
    pub live: Mutex<BTreeSet<String>>,
    pub load_runs: Mutex<Vec<Vec<String>>>,
    fail_deploy: Box<dyn Fn(&str) -> bool + Send + Sync>,
    fail_load: Box<dyn Fn(&str) -> bool + Send + Sync>,
    load: LoadBehaviour,
    panic_on_teardown: bool,
}
impl Default for StubPlatform {
    fn default() -> Self {
        Self {
            deployed: Mutex::new(vec![]),
            torn_down: Mutex::new(vec![]),
            live: Mutex::new(BTreeSet::new()),
            load_runs: Mutex::new(vec![]),
            fail_deploy: Box::new(|_| false),
            fail_load: Box::new(|_| false),
            load: LoadBehaviour::Succeed,
            panic_on_teardown: false,
        }
    }
}
impl StubPlatform {
    pub fn failing_deploy(pred: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            fail_deploy: Box::new(pred),
            ..Default::default()
        }
    }

    /// The load run fails when the first workload's name matches.
    pub fn failing_load(pred: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            fail_load: Box::new(pred),
            ..Default::default()
        }
    }

    pub fn with_load(load: LoadBehaviour) -> Self {
        Self {
            load,
            ..Default::default()
        }
    }

    pub fn panicking_teardown() -> Self {
        Self {
            panic_on_teardown: true,
            ..Default::default()
        }
    }

    pub fn deployed(&self) -> Vec<String> {
        self.deployed.lock().expect("lock").clone()
    }

    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().expect("lock").clone()
    }

    pub fn live(&self) -> Vec<String> {
        self.live.lock().expect("lock").iter().cloned().collect()
    }

    pub fn load_runs(&self) -> usize {
        self.load_runs.lock().expect("lock").len()
    }
}

#[async_trait]
impl WorkloadDeployer for StubPlatform {
    async fn deploy(
        &self,
        name: &str,
        variant: &str,
        port: u16,
    ) -> Result<WorkloadInstance, PlatformError> {
        if (self.fail_deploy)(name) {
            return Err(PlatformError::Command {
                command: format!("apply {}", name),
                status: "exit status: 1".to_string(),
                stderr: "quota exceeded".to_string(),
            });
        }
        self.deployed.lock().expect("lock").push(name.to_string());
        self.live.lock().expect("lock").insert(name.to_string());
        Ok(WorkloadInstance {
            name: name.to_string(),
            variant: variant.to_string(),
            port,
            address: name.to_string(),
        })
    }

    async fn await_ready(&self, _names: &[String], _timeout: Duration) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn teardown(&self, names: &[String]) {
        if self.panic_on_teardown {
            panic!("teardown exploded");
        }
        self.torn_down.lock().expect("lock").extend(names.iter().cloned());
        let mut live = self.live.lock().expect("lock");
        for name in names {
            live.remove(name);
        }
    }
}

#[async_trait]
impl LoadDriver for StubPlatform {
    async fn run_load(
        &self,
        addresses: &[String],
        client_count: u32,
        messages_per_client: u32,
        _timeout: Duration,
    ) -> Result<LoadReport, PlatformError> {
        self.load_runs.lock().expect("lock").push(addresses.to_vec());
        match self.load {
            LoadBehaviour::Panic => panic!("driver exploded"),
            LoadBehaviour::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
            LoadBehaviour::Succeed => {}
        }

        let total = u64::from(client_count) * u64::from(messages_per_client);
        if addresses.first().is_some_and(|a| (self.fail_load)(a)) {
            return Ok(LoadReport {
                success: false,
                total_requests: total,
                failed_requests: total,
                ..Default::default()
            });
        }

        Ok(LoadReport {
            success: true,
            total_requests: total,
            successful_requests: total,
            failed_requests: 0,
            avg_latency: 0.002,
            min_latency: 0.001,
            max_latency: 0.004,
            latencies: vec![0.001, 0.002, 0.003],
            throughput: 500.0,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ClusterHealth for StubPlatform {
    async fn live_workloads(&self) -> Option<usize> {
        None
    }

    async fn runtime_reachable(&self) -> bool {
        true
    }
}

pub fn slot_settings(workload_slots: usize) -> SlotSettings {
    SlotSettings::from(&ConcurrencyConfig {
        max_workload_slots: Some(workload_slots),
        min_workload_slots: Some(workload_slots),
        resource_check_interval_ms: 10,
        ..Default::default()
    })
}

pub fn executor_settings() -> ExecutorSettings {
    ExecutorSettings {
        workload_prefix: "server".to_string(),
        base_port: 8000,
        base_stabilization: Duration::ZERO,
        per_server_stabilization: Duration::from_millis(10),
        ready_timeout: Duration::from_secs(5),
        load_timeout: Duration::from_secs(30),
        load_grace: Duration::from_secs(5),
        parallel_deploy: false,
    }
}

pub fn executor(platform: Arc<StubPlatform>, settings: SlotSettings) -> Arc<ScenarioExecutor> {
    executor_with(platform, settings, executor_settings())
}

pub fn executor_with(
    platform: Arc<StubPlatform>,
    settings: SlotSettings,
    executor_settings: ExecutorSettings,
) -> Arc<ScenarioExecutor> {
    let governor = ResourceGovernor::new(Box::new(FixedProbe(10.0)), ResourceThresholds::default());
    let slots = Arc::new(SlotManager::new(Arc::new(governor), platform.clone(), settings));
    Arc::new(ScenarioExecutor::new(
        platform.clone(),
        platform,
        slots,
        executor_settings,
    ))
}
