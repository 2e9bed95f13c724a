/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

static EXAMPLE_CONFIG: &str = include_str!("templates/scalebench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub matrix: Matrix,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub resources: ResourceThresholds,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    /// Applies `SCALEBENCH_*` overrides from the process environment (a `.env` file should have
    /// been loaded with dotenvy before calling this).
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| dotenvy::var(key).ok())
    }

    /// Applies overrides using the given lookup function.
    ///
    /// # Arguments
    /// * lookup - returns the value for an override key, if it is set
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup("SCALEBENCH_REGISTRY_USER") {
            self.images.registry_user = user;
        }
        if let Some(slots) = lookup("SCALEBENCH_MAX_WORKLOAD_SLOTS") {
            let slots = parse_override::<usize>("SCALEBENCH_MAX_WORKLOAD_SLOTS", &slots)?;
            self.concurrency.max_workload_slots = Some(slots);
        }
        if let Some(cpu) = lookup("SCALEBENCH_CPU_THRESHOLD") {
            self.resources.cpu_percent = parse_override("SCALEBENCH_CPU_THRESHOLD", &cpu)?;
        }
        if let Some(mem) = lookup("SCALEBENCH_MEMORY_THRESHOLD") {
            self.resources.memory_percent = parse_override("SCALEBENCH_MEMORY_THRESHOLD", &mem)?;
        }
        if let Some(delay) = lookup("SCALEBENCH_POD_CREATION_DELAY") {
            self.concurrency.pod_creation_delay_secs =
                parse_override("SCALEBENCH_POD_CREATION_DELAY", &delay)?;
        }
        if let Some(delay) = lookup("SCALEBENCH_TEST_EXECUTION_DELAY") {
            self.concurrency.test_execution_delay_secs =
                parse_override("SCALEBENCH_TEST_EXECUTION_DELAY", &delay)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let matrix = &self.matrix;
        if matrix.variants.is_empty() {
            bail!("matrix.variants must not be empty");
        }
        for (axis, values) in [
            ("servers", &matrix.servers),
            ("clients", &matrix.clients),
            ("messages", &matrix.messages),
        ] {
            if values.is_empty() {
                bail!("matrix.{} must not be empty", axis);
            }
            if values.contains(&0) {
                bail!("matrix.{} must only contain values >= 1", axis);
            }
        }
        if matrix.runs_per_config == 0 {
            bail!("matrix.runs_per_config must be >= 1");
        }
        for variant in matrix.variants.iter() {
            if !self.images.servers.contains_key(variant) {
                bail!("no server image context configured for variant {}", variant);
            }
        }

        let ratio = self.orchestration.min_success_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            bail!("orchestration.min_success_ratio must be within [0, 1], got {}", ratio);
        }

        let conc = &self.concurrency;
        let exec = &self.executor;
        let orch = &self.orchestration;
        for (key, value) in [
            ("cluster.command_timeout_secs", self.cluster.command_timeout_secs),
            ("concurrency.pod_creation_delay_secs", conc.pod_creation_delay_secs),
            ("concurrency.test_execution_delay_secs", conc.test_execution_delay_secs),
            ("concurrency.min_test_execution_delay_secs", conc.min_test_execution_delay_secs),
            ("concurrency.max_delay_secs", conc.max_delay_secs),
            ("concurrency.workload_slot_timeout_secs", conc.workload_slot_timeout_secs),
            ("concurrency.scenario_slot_timeout_secs", conc.scenario_slot_timeout_secs),
            ("executor.base_stabilization_secs", exec.base_stabilization_secs),
            ("executor.per_server_stabilization_secs", exec.per_server_stabilization_secs),
            ("executor.ready_timeout_secs", exec.ready_timeout_secs),
            ("executor.load_timeout_secs", exec.load_timeout_secs),
            ("orchestration.configuration_pause_secs", orch.configuration_pause_secs),
            ("orchestration.stress_backoff_secs", orch.stress_backoff_secs),
        ] {
            if !(0.0..=MAX_DURATION_SECS).contains(&value) {
                bail!(
                    "{} must be within [0, {}] seconds, got {}",
                    key,
                    MAX_DURATION_SECS,
                    value
                );
            }
        }
        if !(conc.workload_health_factor.is_finite() && conc.workload_health_factor > 0.0) {
            bail!(
                "concurrency.workload_health_factor must be a positive number, got {}",
                conc.workload_health_factor
            );
        }

        if conc.workload_floor() > conc.workload_ceiling() {
            bail!(
                "concurrency.min_workload_slots ({}) exceeds max_workload_slots ({})",
                conc.workload_floor(),
                conc.workload_ceiling()
            );
        }
        if conc.max_scenario_slots == 0 || conc.max_scenario_slots > conc.scenario_slot_ceiling {
            bail!(
                "concurrency.max_scenario_slots must be within [1, {}]",
                conc.scenario_slot_ceiling
            );
        }
        if conc.success_streak_threshold == 0 || conc.failure_streak_threshold == 0 {
            bail!("concurrency streak thresholds must be >= 1");
        }

        let largest_port = u32::from(self.executor.base_port)
            + matrix.servers.iter().copied().max().unwrap_or(1)
            - 1;
        if largest_port > u32::from(u16::MAX) {
            bail!("executor.base_port leaves no room for {} servers", largest_port);
        }

        debug!("Configuration validated");
        Ok(())
    }
}

fn parse_override<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, value, e))
}

/// Longest delay or timeout a configuration may ask for: one week.
pub const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Negative and NaN values are zero, values too large for a `Duration` saturate.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// The scale parameters every variant is benchmarked across.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Matrix {
    pub variants: Vec<String>,
    pub servers: Vec<u32>,
    pub clients: Vec<u32>,
    pub messages: Vec<u32>,
    pub runs_per_config: u32,
}
impl Default for Matrix {
    fn default() -> Self {
        Matrix {
            variants: vec!["c".to_string(), "cpp".to_string()],
            servers: vec![2, 4, 6, 8, 10],
            clients: (10..=100).step_by(10).collect(),
            messages: vec![1, 10, 100, 500, 1000, 10000],
            runs_per_config: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ImagesConfig {
    pub registry_user: String,
    pub client_context: PathBuf,
    pub dockerfile: String,
    pub push: bool,
    /// variant -> build context of that variant's server image
    pub servers: BTreeMap<String, PathBuf>,
}
impl Default for ImagesConfig {
    fn default() -> Self {
        ImagesConfig {
            registry_user: "scalebench".to_string(),
            client_context: PathBuf::from("applications/client"),
            dockerfile: "Dockerfile".to_string(),
            push: true,
            servers: BTreeMap::from([
                ("c".to_string(), PathBuf::from("applications/server-c")),
                ("cpp".to_string(), PathBuf::from("applications/server-cpp")),
            ]),
        }
    }
}
impl ImagesConfig {
    pub fn client_image(&self) -> String {
        format!("{}/client:latest", self.registry_user)
    }

    pub fn server_image(&self, variant: &str) -> String {
        format!("{}/server-{}:latest", self.registry_user, variant)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    /// The kubectl invocation, split into POSIX words (e.g. "kubectl --context kind-bench").
    pub kubectl: String,
    pub workload_prefix: String,
    pub client_job_prefix: String,
    pub command_timeout_secs: f64,
    pub max_connections: u32,
    pub thread_pool_size: u32,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}
impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            namespace: "scalability-test".to_string(),
            kubectl: "kubectl".to_string(),
            workload_prefix: "server".to_string(),
            client_job_prefix: "client-test".to_string(),
            command_timeout_secs: 60.0,
            max_connections: 1000,
            thread_pool_size: 50,
            cpu_request: None,
            memory_request: None,
            cpu_limit: None,
            memory_limit: None,
        }
    }
}
impl ClusterConfig {
    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub check_load_average: bool,
    /// The host is stressed when the 1-minute load average exceeds cores * load_factor.
    pub load_factor: f64,
}
impl Default for ResourceThresholds {
    fn default() -> Self {
        ResourceThresholds {
            cpu_percent: 95.0,
            memory_percent: 95.0,
            check_load_average: true,
            load_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Defaults to the number of logical cores.
    pub max_workload_slots: Option<usize>,
    /// Defaults to max(4, cores / 4).
    pub min_workload_slots: Option<usize>,
    pub max_scenario_slots: usize,
    pub scenario_slot_ceiling: usize,
    pub adaptive: bool,
    pub success_streak_threshold: u32,
    pub failure_streak_threshold: u32,
    pub workload_shrink_step: usize,
    /// Live workloads may exceed the workload ceiling by this factor before scenarios stall.
    pub workload_health_factor: f64,
    pub pod_creation_delay_secs: f64,
    pub test_execution_delay_secs: f64,
    pub min_test_execution_delay_secs: f64,
    pub max_delay_secs: f64,
    pub resource_check_interval_ms: u64,
    pub workload_slot_timeout_secs: f64,
    pub scenario_slot_timeout_secs: f64,
}
impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            max_workload_slots: None,
            min_workload_slots: None,
            max_scenario_slots: 2,
            scenario_slot_ceiling: 4,
            adaptive: true,
            success_streak_threshold: 5,
            failure_streak_threshold: 2,
            workload_shrink_step: 2,
            workload_health_factor: 1.5,
            pod_creation_delay_secs: 0.1,
            test_execution_delay_secs: 0.2,
            min_test_execution_delay_secs: 0.1,
            max_delay_secs: 30.0,
            resource_check_interval_ms: 100,
            workload_slot_timeout_secs: 300.0,
            scenario_slot_timeout_secs: 600.0,
        }
    }
}
impl ConcurrencyConfig {
    pub fn workload_ceiling(&self) -> usize {
        self.max_workload_slots.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn workload_floor(&self) -> usize {
        self.min_workload_slots
            .unwrap_or_else(|| (num_cpus::get() / 4).max(4).min(self.workload_ceiling()))
            .max(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub base_port: u16,
    pub base_stabilization_secs: f64,
    pub per_server_stabilization_secs: f64,
    pub ready_timeout_secs: f64,
    pub load_timeout_secs: f64,
    pub parallel_deploy: bool,
}
impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            base_port: 8000,
            base_stabilization_secs: 2.0,
            per_server_stabilization_secs: 0.5,
            ready_timeout_secs: 120.0,
            load_timeout_secs: 600.0,
            parallel_deploy: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub min_success_ratio: f64,
    pub abort_variant_on_failure: bool,
    pub configuration_pause_secs: f64,
    pub stress_backoff_secs: f64,
}
impl Default for OrchestrationConfig {
    fn default() -> Self {
        OrchestrationConfig {
            min_success_ratio: 0.7,
            abort_variant_on_failure: true,
            configuration_pause_secs: 3.0,
            stress_backoff_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
    pub clear_previous: bool,
}
impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            results_dir: PathBuf::from("results"),
            clear_previous: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn example_config_parses_and_validates() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
        cfg.validate()?;

        assert_eq!(cfg.matrix.variants, vec!["c", "cpp"]);
        assert_eq!(cfg.matrix.runs_per_config, 10);
        assert_eq!(cfg.cluster.namespace, "scalability-test");
        Ok(())
    }

    #[test]
    fn empty_config_uses_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_str("")?;

        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.matrix.clients.len(), 10);
        assert_eq!(cfg.executor.base_port, 8000);
        assert_eq!(cfg.orchestration.min_success_ratio, 0.7);
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(
            r#"
            [matrix]
            servers = [1, 2]
            runs_per_config = 3

            [concurrency]
            max_workload_slots = 12
            "#,
        )?;

        assert_eq!(cfg.matrix.servers, vec![1, 2]);
        assert_eq!(cfg.matrix.runs_per_config, 3);
        assert_eq!(cfg.matrix.variants, vec!["c", "cpp"]);
        assert_eq!(cfg.concurrency.workload_ceiling(), 12);
        assert_eq!(cfg.concurrency.failure_streak_threshold, 2);
        Ok(())
    }

    #[test]
    fn unbounded_durations_are_rejected() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(
            r#"
            [executor]
            load_timeout_secs = inf
            "#,
        )?;
        assert!(cfg.executor.load_timeout_secs.is_infinite());
        assert!(cfg.validate().is_err());

        for value in [f64::NAN, -1.0, MAX_DURATION_SECS * 2.0] {
            let mut cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
            cfg.concurrency.scenario_slot_timeout_secs = value;
            assert!(cfg.validate().is_err(), "accepted {}", value);
        }

        let mut cfg = Config::try_from_str(EXAMPLE_CONFIG)?;
        cfg.cluster.command_timeout_secs = MAX_DURATION_SECS;
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn durations_never_panic() {
        assert_eq!(secs(1.5), Duration::from_millis(1500));
        assert_eq!(secs(-3.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
        assert_eq!(secs(1e300), Duration::MAX);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::try_from_str("[matrix\nservers = ").is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.matrix.runs_per_config = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.matrix.servers = vec![2, 0];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.orchestration.min_success_ratio = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.matrix.variants.push("rust".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.concurrency.max_workload_slots = Some(2);
        cfg.concurrency.min_workload_slots = Some(6);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.executor.base_port = u16::MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_values() -> anyhow::Result<()> {
        let env = HashMap::from([
            ("SCALEBENCH_REGISTRY_USER", "someone"),
            ("SCALEBENCH_MAX_WORKLOAD_SLOTS", "7"),
            ("SCALEBENCH_TEST_EXECUTION_DELAY", "1.5"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()))?;

        assert_eq!(cfg.images.registry_user, "someone");
        assert_eq!(cfg.images.server_image("c"), "someone/server-c:latest");
        assert_eq!(cfg.concurrency.workload_ceiling(), 7);
        assert_eq!(cfg.concurrency.test_execution_delay_secs, 1.5);
        Ok(())
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut cfg = Config::default();
        let res = cfg.apply_overrides(|key| match key {
            "SCALEBENCH_CPU_THRESHOLD" => Some("lots".to_string()),
            _ => None,
        });
        assert!(res.is_err());
    }

    #[test]
    fn workload_floor_never_exceeds_default_ceiling() {
        let conc = ConcurrencyConfig {
            max_workload_slots: Some(2),
            ..Default::default()
        };
        assert!(conc.workload_floor() <= conc.workload_ceiling());
    }
}
