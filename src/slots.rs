/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{secs, ConcurrencyConfig},
    governor::{Health, ResourceGovernor},
    platform::ClusterHealth,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// A bounded counter. `max` is the effective ceiling and `target` the ceiling the pool is
/// converging to. Lowering the target below the active count leaves `max` at the active
/// count until enough slots are released, so `active <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotPool {
    active: usize,
    max: usize,
    target: usize,
}
impl SlotPool {
    fn new(max: usize) -> Self {
        Self {
            active: 0,
            max,
            target: max,
        }
    }

    fn try_acquire(&mut self) -> bool {
        self.try_acquire_many(1)
    }

    /// All or nothing.
    fn try_acquire_many(&mut self, count: usize) -> bool {
        match self.active.checked_add(count) {
            Some(active) if active <= self.max => {
                self.active = active;
                true
            }
            _ => false,
        }
    }

    /// Returns false if there was nothing to release.
    fn release(&mut self) -> bool {
        self.release_many(1) == 1
    }

    /// Releases up to `count` slots and returns how many were actually held.
    fn release_many(&mut self, count: usize) -> usize {
        let released = count.min(self.active);
        self.active -= released;
        self.max = self.target.max(self.active);
        released
    }

    fn set_target(&mut self, target: usize) {
        self.target = target;
        self.max = target.max(self.active);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecommendedDelays {
    pub pod_creation: Duration,
    pub test_execution: Duration,
    pub resource_check: Duration,
}

/// Point-in-time copy of the slot manager's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyState {
    pub active_workload_slots: usize,
    pub active_scenario_slots: usize,
    pub max_workload_slots: usize,
    pub max_scenario_slots: usize,
    pub success_streak: u32,
    pub failure_streak: u32,
    pub delays: RecommendedDelays,
}

/// What `scalebench status` prints.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub load_average: Option<f64>,
    pub active_workload: usize,
    pub active_scenario: usize,
    pub max_workload: usize,
    pub max_scenario: usize,
    pub health: Health,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotSettings {
    pub workload_ceiling: usize,
    pub workload_floor: usize,
    pub initial_scenario_slots: usize,
    pub scenario_slot_ceiling: usize,
    pub adaptive: bool,
    pub success_streak_threshold: u32,
    pub failure_streak_threshold: u32,
    pub workload_shrink_step: usize,
    pub workload_health_factor: f64,
    pub pod_creation_delay: Duration,
    pub test_execution_delay: Duration,
    pub min_test_execution_delay: Duration,
    pub max_delay: Duration,
    pub resource_check_interval: Duration,
    pub workload_slot_timeout: Duration,
    pub scenario_slot_timeout: Duration,
}
impl From<&ConcurrencyConfig> for SlotSettings {
    fn from(conf: &ConcurrencyConfig) -> Self {
        let scenario_slot_ceiling = conf.scenario_slot_ceiling.max(1);
        SlotSettings {
            workload_ceiling: conf.workload_ceiling(),
            workload_floor: conf.workload_floor().min(conf.workload_ceiling()),
            initial_scenario_slots: conf.max_scenario_slots.clamp(1, scenario_slot_ceiling),
            scenario_slot_ceiling,
            adaptive: conf.adaptive,
            success_streak_threshold: conf.success_streak_threshold.max(1),
            failure_streak_threshold: conf.failure_streak_threshold.max(1),
            workload_shrink_step: conf.workload_shrink_step,
            workload_health_factor: conf.workload_health_factor,
            pod_creation_delay: secs(conf.pod_creation_delay_secs),
            test_execution_delay: secs(conf.test_execution_delay_secs),
            min_test_execution_delay: secs(conf.min_test_execution_delay_secs),
            max_delay: secs(conf.max_delay_secs),
            resource_check_interval: Duration::from_millis(conf.resource_check_interval_ms.max(1)),
            workload_slot_timeout: secs(conf.workload_slot_timeout_secs),
            scenario_slot_timeout: secs(conf.scenario_slot_timeout_secs),
        }
    }
}

#[derive(Debug)]
struct SlotState {
    workload: SlotPool,
    scenario: SlotPool,
    success_streak: u32,
    failure_streak: u32,
    pod_creation_delay: Duration,
    test_execution_delay: Duration,
}

/// `None` when the timeout is too large to be represented, which means no deadline at all.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// How long to sleep before the next attempt, or `None` once the deadline has passed.
fn remaining_wait(deadline: Option<Instant>, interval: Duration) -> Option<Duration> {
    match deadline {
        None => Some(interval),
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| interval.min(deadline - now))
        }
    }
}

/// Gates workload deployments and scenario executions behind two bounded slot pools, and
/// resizes the pools from the streak of scenario outcomes.
pub struct SlotManager {
    governor: Arc<ResourceGovernor>,
    health: Arc<dyn ClusterHealth>,
    settings: SlotSettings,
    state: Mutex<SlotState>,
}
impl SlotManager {
    pub fn new(
        governor: Arc<ResourceGovernor>,
        health: Arc<dyn ClusterHealth>,
        settings: SlotSettings,
    ) -> Self {
        let state = SlotState {
            workload: SlotPool::new(settings.workload_ceiling),
            scenario: SlotPool::new(settings.initial_scenario_slots),
            success_streak: 0,
            failure_streak: 0,
            pod_creation_delay: settings.pod_creation_delay,
            test_execution_delay: settings.test_execution_delay,
        };

        info!(
            max_workload_slots = settings.workload_ceiling,
            max_scenario_slots = settings.initial_scenario_slots,
            "Initialised slot manager"
        );
        Self {
            governor,
            health,
            settings,
            state: Mutex::new(state),
        }
    }

    pub fn settings(&self) -> &SlotSettings {
        &self.settings
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    // never held across an await
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a free workload slot on a host with spare resources. Always makes at least
    /// one attempt, even with a zero timeout.
    pub async fn acquire_workload_slot(&self, timeout: Duration) -> bool {
        self.acquire_workload_slots(1, timeout).await
    }

    /// Waits until `count` workload slots can be taken together. Slots are never held while
    /// waiting, so scenarios competing for the pool can't starve each other. The workload pool
    /// only ever shrinks, so a request larger than its target can never be met and fails
    /// without waiting.
    pub async fn acquire_workload_slots(&self, count: usize, timeout: Duration) -> bool {
        let target = self.lock().workload.target;
        if count > target {
            warn!(
                "Requested {} workload slots, more than the pool's {}",
                count, target
            );
            return false;
        }

        let deadline = deadline_after(timeout);
        loop {
            if self.governor.is_admissible().await {
                let mut state = self.lock();
                if state.workload.try_acquire_many(count) {
                    trace!(
                        count,
                        active = state.workload.active,
                        max = state.workload.max,
                        "acquired workload slots"
                    );
                    return true;
                }
            }

            let Some(wait) = remaining_wait(deadline, self.settings.resource_check_interval) else {
                warn!("Timed out after {:?} waiting for {} workload slots", timeout, count);
                return false;
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub fn release_workload_slot(&self) {
        self.release_workload_slots(1);
    }

    pub fn release_workload_slots(&self, count: usize) {
        let mut state = self.lock();
        let released = state.workload.release_many(count);
        if released < count {
            warn!(
                "Released {} workload slots but only {} were held",
                count, released
            );
        }
        trace!(
            count,
            active = state.workload.active,
            max = state.workload.max,
            "released workload slots"
        );
    }

    /// Waits for a free scenario slot while the system as a whole is healthy.
    pub async fn acquire_scenario_slot(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            if self.system_healthy().await {
                let mut state = self.lock();
                if state.scenario.try_acquire() {
                    trace!(
                        active = state.scenario.active,
                        max = state.scenario.max,
                        "acquired scenario slot"
                    );
                    return true;
                }
            }

            let interval = self
                .settings
                .resource_check_interval
                .max(self.lock().test_execution_delay);
            let Some(wait) = remaining_wait(deadline, interval) else {
                warn!("Timed out after {:?} waiting for a scenario slot", timeout);
                return false;
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub fn release_scenario_slot(&self) {
        let mut state = self.lock();
        if !state.scenario.release() {
            warn!("Released a scenario slot that was never acquired");
        }
        trace!(
            active = state.scenario.active,
            max = state.scenario.max,
            "released scenario slot"
        );
    }

    /// Host resources are admissible, the cluster isn't overloaded with workloads and the
    /// container runtime answers.
    async fn system_healthy(&self) -> bool {
        if !self.governor.is_admissible().await {
            return false;
        }

        if let Some(live) = self.health.live_workloads().await {
            let max_workload = self.lock().workload.max;
            let allowed = max_workload as f64 * self.settings.workload_health_factor;
            if live as f64 > allowed {
                debug!("Too many live workloads: {} (allowed {:.0})", live, allowed);
                return false;
            }
        }

        if !self.health.runtime_reachable().await {
            debug!("Container runtime unreachable");
            return false;
        }

        true
    }

    pub fn report_success(&self) {
        let mut state = self.lock();
        state.success_streak += 1;
        state.failure_streak = 0;

        if !self.settings.adaptive || state.success_streak < self.settings.success_streak_threshold
        {
            return;
        }

        if state.scenario.target < self.settings.scenario_slot_ceiling {
            let target = state.scenario.target + 1;
            state.scenario.set_target(target);
            info!("Increased max scenario slots to {}", target);
        }

        let min_delay = self.settings.min_test_execution_delay;
        if state.test_execution_delay > min_delay {
            state.test_execution_delay = state.test_execution_delay.mul_f64(0.9).max(min_delay);
            debug!("Reduced test execution delay to {:?}", state.test_execution_delay);
        }

        state.success_streak = 0;
    }

    pub fn report_failure(&self) {
        let mut state = self.lock();
        state.failure_streak += 1;
        state.success_streak = 0;

        if !self.settings.adaptive || state.failure_streak < self.settings.failure_streak_threshold
        {
            return;
        }

        if state.scenario.target > 1 {
            let target = state.scenario.target - 1;
            state.scenario.set_target(target);
            warn!("Reduced max scenario slots to {}", target);
        }

        let floor = self.settings.workload_floor;
        if state.workload.target > floor {
            let target = state
                .workload
                .target
                .saturating_sub(self.settings.workload_shrink_step)
                .max(floor);
            state.workload.set_target(target);
            warn!("Reduced max workload slots to {}", target);
        }

        let max_delay = self.settings.max_delay;
        state.test_execution_delay = state.test_execution_delay.mul_f64(1.5).min(max_delay);
        state.pod_creation_delay = state.pod_creation_delay.mul_f64(1.2).min(max_delay);
        debug!(
            test_execution_delay = ?state.test_execution_delay,
            pod_creation_delay = ?state.pod_creation_delay,
            "Increased delays"
        );

        state.failure_streak = 0;
    }

    pub fn get_recommended_delays(&self) -> RecommendedDelays {
        let state = self.lock();
        RecommendedDelays {
            pod_creation: state.pod_creation_delay,
            test_execution: state.test_execution_delay,
            resource_check: self.settings.resource_check_interval,
        }
    }

    pub fn max_scenario_slots(&self) -> usize {
        self.lock().scenario.max
    }

    pub fn state(&self) -> ConcurrencyState {
        let state = self.lock();
        ConcurrencyState {
            active_workload_slots: state.workload.active,
            active_scenario_slots: state.scenario.active,
            max_workload_slots: state.workload.max,
            max_scenario_slots: state.scenario.max,
            success_streak: state.success_streak,
            failure_streak: state.failure_streak,
            delays: RecommendedDelays {
                pod_creation: state.pod_creation_delay,
                test_execution: state.test_execution_delay,
                resource_check: self.settings.resource_check_interval,
            },
        }
    }

    pub async fn resource_status(&self) -> ResourceStatus {
        let snapshot = self.governor.sample().await;
        let state = self.state();
        ResourceStatus {
            timestamp: snapshot.timestamp,
            cpu_percent: snapshot.cpu_percent,
            memory_percent: snapshot.memory_percent,
            load_average: snapshot.load_average,
            active_workload: state.active_workload_slots,
            active_scenario: state.active_scenario_slots,
            max_workload: state.max_workload_slots,
            max_scenario: state.max_scenario_slots,
            health: snapshot.health,
            degraded: snapshot.degraded,
        }
    }

    /// Zeroes the active counters.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.workload.active > 0 || state.scenario.active > 0 {
            warn!(
                "Resetting slot manager with {} workload and {} scenario slots still held",
                state.workload.active, state.scenario.active
            );
        }
        state.workload.active = 0;
        state.workload.max = state.workload.target;
        state.scenario.active = 0;
        state.scenario.max = state.scenario.target;
    }
}
