/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod common;

use common::{executor, slot_settings, StubPlatform};
use scalebench::{
    orchestrator::{OrchestrationPolicy, Orchestrator},
    outcome::ScenarioOutcome,
    results::OutcomeSink,
    scenario::Configuration,
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<ScenarioOutcome>>>);
impl SharedSink {
    fn outcomes(&self) -> Vec<ScenarioOutcome> {
        self.0.lock().expect("lock").clone()
    }
}
impl OutcomeSink for SharedSink {
    fn record(&mut self, outcome: &ScenarioOutcome) -> anyhow::Result<()> {
        self.0.lock().expect("lock").push(outcome.clone());
        Ok(())
    }
}

fn policy(runs_per_config: u32) -> OrchestrationPolicy {
    OrchestrationPolicy {
        runs_per_config,
        min_success_ratio: 0.7,
        abort_variant_on_failure: true,
        configuration_pause: Duration::from_secs(1),
        stress_backoff: Duration::from_secs(1),
    }
}

fn configurations() -> Vec<Configuration> {
    [2, 4]
        .into_iter()
        .map(|server_count| Configuration {
            server_count,
            client_count: 10,
            messages_per_client: 5,
        })
        .collect()
}

fn variants(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn low_success_ratio_stops_the_variant() -> anyhow::Result<()> {
    // runs 1 to 4 of variant a with 2 servers fail: 6/10 is below 0.7
    let platform = Arc::new(StubPlatform::failing_load(|name| {
        name.starts_with("server-a-a-2s-")
            && ["-r1-0", "-r2-0", "-r3-0", "-r4-0"]
                .iter()
                .any(|s| name.ends_with(s))
    }));
    let sink = SharedSink::default();
    let mut orchestrator = Orchestrator::new(
        executor(platform.clone(), slot_settings(16)),
        Box::new(sink.clone()),
        configurations(),
        policy(10),
        CancellationToken::new(),
    );

    let passed = orchestrator.run_all(&variants(&["a", "b"])).await;
    assert!(!passed);

    let summaries = orchestrator.summaries();
    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[0].variant, "a");
    assert_eq!(summaries[0].successes, 6);
    assert!(!summaries[0].passed);
    assert!(summaries[1..].iter().all(|s| s.variant == "b" && s.passed));

    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), 30);
    assert_eq!(outcomes.iter().filter(|o| !o.success).count(), 4);
    assert!(!outcomes
        .iter()
        .any(|o| o.descriptor.variant == "a" && o.descriptor.server_count == 4));
    assert!(!platform.deployed().iter().any(|n| n.starts_with("server-a-a-4s-")));

    let deployed = platform.deployed().into_iter().collect::<HashSet<_>>();
    let torn_down = platform.torn_down().into_iter().collect::<HashSet<_>>();
    assert!(deployed.is_subset(&torn_down));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn passing_run_records_every_scenario() -> anyhow::Result<()> {
    let platform = Arc::new(StubPlatform::default());
    let executor = executor(platform.clone(), slot_settings(16));
    let slots = executor.slots().clone();
    let sink = SharedSink::default();
    let mut orchestrator = Orchestrator::new(
        executor,
        Box::new(sink.clone()),
        configurations(),
        policy(3),
        CancellationToken::new(),
    );

    assert!(orchestrator.run_all(&variants(&["a"])).await);

    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o.success));
    let ids = outcomes
        .iter()
        .map(|o| o.descriptor.scenario_id.clone())
        .collect::<HashSet<_>>();
    assert_eq!(ids.len(), 6);
    assert!(ids.contains("a_4s_10c_5m_r3"));

    assert!(orchestrator.summaries().iter().all(|s| s.passed));
    let state = slots.state();
    assert_eq!(state.active_scenario_slots, 0);
    assert_eq!(state.active_workload_slots, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_submits_nothing() -> anyhow::Result<()> {
    let platform = Arc::new(StubPlatform::default());
    let sink = SharedSink::default();
    let cancel = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(
        executor(platform.clone(), slot_settings(16)),
        Box::new(sink.clone()),
        configurations(),
        policy(3),
        cancel.clone(),
    );

    cancel.cancel();
    assert!(!orchestrator.run_all(&variants(&["a"])).await);
    assert!(sink.outcomes().is_empty());
    assert!(platform.deployed().is_empty());
    Ok(())
}
