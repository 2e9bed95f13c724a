/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{secs, Config},
    executor::ScenarioExecutor,
    outcome::{ScenarioError, ScenarioOutcome},
    results::{ConfigurationSummary, OutcomeSink},
    scenario::{configurations, scenarios_for, Configuration, ScenarioDescriptor},
    slots::SlotManager,
};
use chrono::{DateTime, Utc};
use colored::*;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    task::{Id, JoinError, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Failure outcome for a scenario whose task died before it could report.
fn lost_outcome(
    descriptor: ScenarioDescriptor,
    started_at: DateTime<Utc>,
    duration: Duration,
    error: &JoinError,
) -> ScenarioOutcome {
    let reason = if error.is_panic() {
        format!("scenario task panicked: {}", error)
    } else {
        format!("scenario task ended early: {}", error)
    };
    ScenarioOutcome::failure(
        descriptor,
        vec![],
        started_at,
        duration,
        &ScenarioError::Unexpected(reason),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationPolicy {
    pub runs_per_config: u32,
    pub min_success_ratio: f64,
    pub abort_variant_on_failure: bool,
    pub configuration_pause: Duration,
    pub stress_backoff: Duration,
}
impl OrchestrationPolicy {
    pub fn from_config(config: &Config) -> Self {
        let orch = &config.orchestration;
        OrchestrationPolicy {
            runs_per_config: config.matrix.runs_per_config,
            min_success_ratio: orch.min_success_ratio,
            abort_variant_on_failure: orch.abort_variant_on_failure,
            configuration_pause: secs(orch.configuration_pause_secs),
            stress_backoff: secs(orch.stress_backoff_secs),
        }
    }
}

/// Summarizes the outcomes of one configuration. The ratio is taken over the planned number
/// of runs, so runs that never happened count as failures.
pub fn summarize(
    variant: &str,
    configuration: Configuration,
    outcomes: &[ScenarioOutcome],
    policy: &OrchestrationPolicy,
) -> ConfigurationSummary {
    let successful = outcomes.iter().filter(|o| o.success).collect::<Vec<_>>();
    let successes = successful.len() as u32;
    let success_ratio = successes as f64 / policy.runs_per_config.max(1) as f64;

    let mean = |value: &dyn Fn(&ScenarioOutcome) -> f64| {
        if successful.is_empty() {
            0.0
        } else {
            successful.iter().map(|o| value(*o)).sum::<f64>() / successful.len() as f64
        }
    };

    ConfigurationSummary {
        variant: variant.to_string(),
        configuration,
        runs: policy.runs_per_config,
        successes,
        success_ratio,
        passed: success_ratio >= policy.min_success_ratio,
        mean_latency: mean(&|o| o.latency.mean),
        mean_throughput: mean(&|o| o.throughput),
    }
}

/// Runs every configuration of every variant, one configuration at a time, with the runs of a
/// configuration executing concurrently up to the scenario slot ceiling.
pub struct Orchestrator {
    executor: Arc<ScenarioExecutor>,
    slots: Arc<SlotManager>,
    sink: Box<dyn OutcomeSink>,
    configurations: Vec<Configuration>,
    policy: OrchestrationPolicy,
    cancel: CancellationToken,
    summaries: Vec<ConfigurationSummary>,
}
impl Orchestrator {
    pub fn new(
        executor: Arc<ScenarioExecutor>,
        sink: Box<dyn OutcomeSink>,
        configurations: Vec<Configuration>,
        policy: OrchestrationPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let slots = executor.slots().clone();
        Self {
            executor,
            slots,
            sink,
            configurations,
            policy,
            cancel,
            summaries: vec![],
        }
    }

    pub fn from_config(
        executor: Arc<ScenarioExecutor>,
        sink: Box<dyn OutcomeSink>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            executor,
            sink,
            configurations(&config.matrix),
            OrchestrationPolicy::from_config(config),
            cancel,
        )
    }

    pub fn summaries(&self) -> &[ConfigurationSummary] {
        &self.summaries
    }

    /// True if every configuration that ran met the success ratio and the run wasn't
    /// interrupted.
    pub async fn run_all(&mut self, variants: &[String]) -> bool {
        let mut all_passed = true;
        let mut first = true;

        'variants: for variant in variants {
            println!("\n{}", format!(" Variant {} ", variant).reversed().green());
            info!(variant = %variant, configurations = self.configurations.len(), "Starting variant");

            for configuration in self.configurations.clone() {
                if self.cancel.is_cancelled() {
                    break 'variants;
                }
                if !first && !self.pause(self.policy.configuration_pause).await {
                    break 'variants;
                }
                first = false;

                let summary = self.run_configuration(variant, configuration).await;
                let passed = summary.passed;
                self.summaries.push(summary);
                if self.cancel.is_cancelled() {
                    break 'variants;
                }

                if !passed {
                    all_passed = false;
                    if self.policy.abort_variant_on_failure {
                        warn!(
                            "Configuration ({}) of {} fell below the success ratio, skipping the rest of the variant",
                            configuration, variant
                        );
                        continue 'variants;
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            warn!("Run interrupted");
            return false;
        }
        all_passed
    }

    async fn run_configuration(
        &mut self,
        variant: &str,
        configuration: Configuration,
    ) -> ConfigurationSummary {
        let runs = self.policy.runs_per_config;
        println!("> configuration {} ({})", configuration.to_string().green(), variant);

        let mut pending = scenarios_for(variant, configuration, runs).collect::<VecDeque<_>>();
        let mut in_flight = JoinSet::new();
        let mut spawned = HashMap::<Id, (ScenarioDescriptor, DateTime<Utc>, Instant)>::new();
        let mut outcomes = Vec::with_capacity(runs as usize);

        loop {
            if self.cancel.is_cancelled() && !pending.is_empty() {
                info!("Skipping {} queued runs", pending.len());
                pending.clear();
            }

            // the ceiling may change as outcomes come in, read it once per round
            let ceiling = self.slots.max_scenario_slots();
            while in_flight.len() < ceiling && !pending.is_empty() {
                if !self.slots.governor().sample().await.is_healthy() {
                    warn!(
                        "Host is stressed, waiting {:?} before the next scenario",
                        self.policy.stress_backoff
                    );
                    if !self.pause(self.policy.stress_backoff).await {
                        break;
                    }
                }

                let Some(descriptor) = pending.pop_front() else {
                    break;
                };
                println!(
                    "> running scenario {} - iteration {}/{}",
                    descriptor.scenario_id.green(),
                    descriptor.run_index,
                    runs
                );
                let executor = self.executor.clone();
                let task = descriptor.clone();
                let id = in_flight.spawn(async move { executor.execute(task).await }).id();
                spawned.insert(id, (descriptor, Utc::now(), Instant::now()));
            }

            let outcome = match in_flight.join_next_with_id().await {
                None if pending.is_empty() || self.cancel.is_cancelled() => break,
                None => continue,
                Some(Ok((id, outcome))) => {
                    spawned.remove(&id);
                    outcome
                }
                Some(Err(e)) => {
                    error!("Scenario task failed: {}", e);
                    match spawned.remove(&e.id()) {
                        Some((descriptor, started_at, started)) => {
                            lost_outcome(descriptor, started_at, started.elapsed(), &e)
                        }
                        None => {
                            self.slots.report_failure();
                            continue;
                        }
                    }
                }
            };
            self.handle_outcome(&outcome, runs).await;
            outcomes.push(outcome);
        }

        let summary = summarize(variant, configuration, &outcomes, &self.policy);
        let verdict = format!(
            "{}/{} runs succeeded ({:.0}%)",
            summary.successes,
            summary.runs,
            summary.success_ratio * 100.0
        );
        if summary.passed {
            println!("  {}", verdict.green());
        } else {
            println!("  {}", verdict.red());
        }
        info!(
            variant = %variant,
            configuration = %configuration,
            successes = summary.successes,
            ratio = summary.success_ratio,
            "Configuration finished"
        );
        summary
    }

    /// Record, then adapt, then wait the recommended delay.
    async fn handle_outcome(&mut self, outcome: &ScenarioOutcome, runs: u32) {
        if let Err(e) = self.sink.record(outcome) {
            error!("Unable to record outcome of {}: {:#}", outcome.descriptor.scenario_id, e);
        }

        let run = outcome.descriptor.run_index;
        if outcome.success {
            self.slots.report_success();
            println!(
                "  {} run {}/{}: {:.2}ms avg latency, {:.1} req/s",
                "✓".green(),
                run,
                runs,
                outcome.latency.mean * 1000.0,
                outcome.throughput
            );
        } else {
            self.slots.report_failure();
            println!(
                "  {} run {}/{}: {}",
                "✗".red(),
                run,
                runs,
                outcome.error_message.red()
            );
        }

        let delay = self.slots.get_recommended_delays().test_execution;
        self.pause(delay).await;
    }

    /// Sleeps unless cancelled first. Returns false if cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
