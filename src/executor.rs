/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{secs, Config},
    outcome::{ScenarioError, ScenarioOutcome},
    platform::{LoadDriver, LoadReport, WorkloadDeployer, WorkloadInstance},
    scenario::ScenarioDescriptor,
    slots::SlotManager,
};
use chrono::Utc;
use futures_util::{future::join_all, FutureExt};
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub workload_prefix: String,
    pub base_port: u16,
    pub base_stabilization: Duration,
    pub per_server_stabilization: Duration,
    pub ready_timeout: Duration,
    pub load_timeout: Duration,
    /// Extra time the load driver gets beyond `load_timeout` to report and clean up after
    /// itself before the run is abandoned.
    pub load_grace: Duration,
    pub parallel_deploy: bool,
}
impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        let exec = &config.executor;
        ExecutorSettings {
            workload_prefix: config.cluster.workload_prefix.clone(),
            base_port: exec.base_port,
            base_stabilization: secs(exec.base_stabilization_secs),
            per_server_stabilization: secs(exec.per_server_stabilization_secs),
            ready_timeout: secs(exec.ready_timeout_secs),
            load_timeout: secs(exec.load_timeout_secs),
            load_grace: secs(config.cluster.command_timeout_secs),
            parallel_deploy: exec.parallel_deploy,
        }
    }

    pub fn stabilization_delay(&self, server_count: u32) -> Duration {
        self.base_stabilization
            .saturating_add(self.per_server_stabilization.saturating_mul(server_count))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScenarioState {
    #[default]
    Pending,
    SlotAcquired,
    Deploying,
    Stabilizing,
    Loading,
    Collecting,
    TornDown,
    Error,
}
impl ScenarioState {
    fn is_final(self) -> bool {
        matches!(self, ScenarioState::TornDown | ScenarioState::Error)
    }
}

/// Everything a scenario has acquired so far. It outlives the scenario future so that
/// cleanup still happens after an error or a panic.
#[derive(Debug, Default)]
struct Ledger {
    state: ScenarioState,
    scenario_slot: bool,
    workload_slots: usize,
    attempted: Vec<String>,
    ports: Vec<u16>,
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transition(ledger: &Mutex<Ledger>, to: ScenarioState) {
    let mut ledger = lock(ledger);
    if ledger.state.is_final() {
        return;
    }
    debug!(from = ?ledger.state, to = ?to, "scenario state");
    ledger.state = to;
}

/// Kubernetes object names are at most 63 lowercase alphanumerics or '-'.
pub fn instance_name(prefix: &str, descriptor: &ScenarioDescriptor, index: u32) -> String {
    let base = format!("{}-{}-{}", prefix, descriptor.variant, descriptor.scenario_id)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let suffix = format!("-{}", index);

    let mut base = base.trim_matches('-').to_string();
    base.truncate(63 - suffix.len());
    format!("{}{}", base.trim_end_matches('-'), suffix)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("panic: {}", msg)
}

/// Runs one scenario from slot acquisition to teardown.
pub struct ScenarioExecutor {
    deployer: Arc<dyn WorkloadDeployer>,
    driver: Arc<dyn LoadDriver>,
    slots: Arc<SlotManager>,
    settings: ExecutorSettings,
}
impl ScenarioExecutor {
    pub fn new(
        deployer: Arc<dyn WorkloadDeployer>,
        driver: Arc<dyn LoadDriver>,
        slots: Arc<SlotManager>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            deployer,
            driver,
            slots,
            settings,
        }
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    /// Never fails: every error, timeout or panic becomes a failure outcome. Whatever was
    /// acquired is torn down and released before this returns.
    pub async fn execute(&self, descriptor: ScenarioDescriptor) -> ScenarioOutcome {
        let span = info_span!("scenario", id = %descriptor.scenario_id);
        async move {
            let started_at = Utc::now();
            let started = Instant::now();
            let ledger = Mutex::new(Ledger::default());

            let result = AssertUnwindSafe(self.run(&descriptor, &ledger))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(ScenarioError::Unexpected(panic_message(payload))));

            if let Err(e) = &result {
                match e.reason() {
                    Some(reason) => warn!("Scenario failed: {} ({})", e, reason),
                    None => warn!("Scenario failed: {}", e),
                }
                transition(&ledger, ScenarioState::Error);
            }

            self.clean_up(&ledger).await;
            transition(&ledger, ScenarioState::TornDown);

            let ports = std::mem::take(&mut lock(&ledger).ports);
            match result {
                Ok(report) => {
                    info!("Scenario succeeded in {:.2?}", started.elapsed());
                    ScenarioOutcome::success(descriptor, ports, started_at, started.elapsed(), &report)
                }
                Err(e) => ScenarioOutcome::failure(descriptor, ports, started_at, started.elapsed(), &e),
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        descriptor: &ScenarioDescriptor,
        ledger: &Mutex<Ledger>,
    ) -> Result<LoadReport, ScenarioError> {
        let slot_timeout = self.slots.settings().scenario_slot_timeout;
        if !self.slots.acquire_scenario_slot(slot_timeout).await {
            return Err(ScenarioError::SlotTimeout);
        }
        lock(ledger).scenario_slot = true;
        transition(ledger, ScenarioState::SlotAcquired);

        let server_count = descriptor.server_count as usize;
        if server_count > self.slots.settings().workload_ceiling {
            return Err(ScenarioError::deploy(format!(
                "{} servers exceed the {} workload slots",
                server_count,
                self.slots.settings().workload_ceiling
            )));
        }
        let slot_timeout = self.slots.settings().workload_slot_timeout;
        if !self.slots.acquire_workload_slots(server_count, slot_timeout).await {
            return Err(ScenarioError::deploy(format!(
                "no {} workload slots after {:?}",
                server_count, slot_timeout
            )));
        }
        lock(ledger).workload_slots = server_count;

        transition(ledger, ScenarioState::Deploying);
        let instances = if self.settings.parallel_deploy {
            join_all((0..descriptor.server_count).map(|i| self.deploy_one(descriptor, i, ledger)))
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut instances = Vec::with_capacity(descriptor.server_count as usize);
            for i in 0..descriptor.server_count {
                if i > 0 {
                    tokio::time::sleep(self.slots.get_recommended_delays().pod_creation).await;
                }
                instances.push(self.deploy_one(descriptor, i, ledger).await?);
            }
            instances
        };

        let names = instances.iter().map(|w| w.name.clone()).collect::<Vec<_>>();
        let ready_timeout = self.settings.ready_timeout;
        match timeout(ready_timeout, self.deployer.await_ready(&names, ready_timeout)).await {
            Ok(Ok(())) => debug!("{} workloads ready", names.len()),
            Ok(Err(e)) => return Err(ScenarioError::deploy(e)),
            Err(_) => {
                return Err(ScenarioError::deploy(format!(
                    "workloads not ready after {:?}",
                    ready_timeout
                )))
            }
        }

        transition(ledger, ScenarioState::Stabilizing);
        tokio::time::sleep(self.settings.stabilization_delay(descriptor.server_count)).await;

        transition(ledger, ScenarioState::Loading);
        let addresses = instances.iter().map(|w| w.address.clone()).collect::<Vec<_>>();
        let load_timeout = self.settings.load_timeout;
        let report = match timeout(
            load_timeout.saturating_add(self.settings.load_grace),
            self.driver.run_load(
                &addresses,
                descriptor.client_count,
                descriptor.messages_per_client,
                load_timeout,
            ),
        )
        .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => return Err(ScenarioError::client(e)),
            Err(_) => {
                return Err(ScenarioError::client(format!(
                    "load run timed out after {:?}",
                    load_timeout
                )))
            }
        };

        transition(ledger, ScenarioState::Collecting);
        if !report.success {
            return Err(ScenarioError::client("load driver reported failure"));
        }
        Ok(report)
    }

    async fn deploy_one(
        &self,
        descriptor: &ScenarioDescriptor,
        index: u32,
        ledger: &Mutex<Ledger>,
    ) -> Result<WorkloadInstance, ScenarioError> {
        let name = instance_name(&self.settings.workload_prefix, descriptor, index);
        let port = u16::try_from(u32::from(self.settings.base_port) + index)
            .map_err(|_| ScenarioError::deploy(format!("no port left for instance {}", index)))?;
        lock(ledger).attempted.push(name.clone());

        let deploy_timeout = self.settings.ready_timeout;
        match timeout(deploy_timeout, self.deployer.deploy(&name, &descriptor.variant, port)).await {
            Ok(Ok(instance)) => {
                debug!(name = %instance.name, port, "deployed workload");
                lock(ledger).ports.push(port);
                Ok(instance)
            }
            Ok(Err(e)) => Err(ScenarioError::deploy(format!("{}: {}", name, e))),
            Err(_) => Err(ScenarioError::deploy(format!(
                "{}: deploy timed out after {:?}",
                name, deploy_timeout
            ))),
        }
    }

    /// Teardown first, then workload slots, then the scenario slot.
    async fn clean_up(&self, ledger: &Mutex<Ledger>) {
        let (attempted, workload_slots, scenario_slot) = {
            let mut ledger = lock(ledger);
            let attempted = std::mem::take(&mut ledger.attempted);
            let workload_slots = std::mem::take(&mut ledger.workload_slots);
            let scenario_slot = std::mem::take(&mut ledger.scenario_slot);
            (attempted, workload_slots, scenario_slot)
        };

        if !attempted.is_empty() {
            debug!("Tearing down {} workloads", attempted.len());
            let teardown = AssertUnwindSafe(self.deployer.teardown(&attempted)).catch_unwind();
            if let Err(payload) = teardown.await {
                error!("Teardown failed: {}", panic_message(payload));
            }
        }

        if workload_slots > 0 {
            self.slots.release_workload_slots(workload_slots);
        }
        if scenario_slot {
            self.slots.release_scenario_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Configuration;

    fn descriptor(variant: &str, run: u32) -> ScenarioDescriptor {
        let conf = Configuration {
            server_count: 2,
            client_count: 10,
            messages_per_client: 5,
        };
        ScenarioDescriptor::new(variant, conf, run)
    }

    #[test]
    fn stabilization_grows_with_server_count() {
        let settings = ExecutorSettings::from_config(&Config::default());
        assert_eq!(settings.stabilization_delay(0), Duration::from_secs(2));
        assert_eq!(settings.stabilization_delay(4), Duration::from_secs(4));
    }

    #[test]
    fn load_runs_get_the_kubectl_timeout_as_grace() {
        let mut config = Config::default();
        config.cluster.command_timeout_secs = 45.0;
        let settings = ExecutorSettings::from_config(&config);
        assert_eq!(settings.load_grace, Duration::from_secs(45));
    }

    #[test]
    fn instance_names_are_valid_object_names() {
        let name = instance_name("server", &descriptor("c", 3), 1);
        assert_eq!(name, "server-c-c-2s-10c-5m-r3-1");

        let long_variant = "Very_Long.Variant".repeat(8);
        let name = instance_name("server", &descriptor(&long_variant, 1), 12);
        assert!(name.len() <= 63);
        assert!(name.ends_with("-12"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!name.starts_with('-'));
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "panic: boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "panic: bang");
        assert_eq!(panic_message(Box::new(7)), "panic: unknown panic");
    }

    #[test]
    fn final_states_are_absorbing() {
        let ledger = Mutex::new(Ledger::default());
        transition(&ledger, ScenarioState::Deploying);
        transition(&ledger, ScenarioState::Error);
        transition(&ledger, ScenarioState::TornDown);
        assert_eq!(lock(&ledger).state, ScenarioState::Error);
    }
}
