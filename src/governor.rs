/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::ResourceThresholds;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt,
    time::{Duration, Instant},
};
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Raw host utilization counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCounters {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// 1-minute load average, None where the platform doesn't provide one
    pub load_average: Option<f64>,
    pub cores: usize,
}

/// Source of host counters. Returns None when the counters can't be read.
#[async_trait]
pub trait ResourceProbe: Send {
    async fn read(&mut self) -> Option<HostCounters>;
}

/// Reads host counters with sysinfo.
pub struct SysinfoProbe {
    system: System,
    last_refresh: Option<Instant>,
}
impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            last_refresh: None,
        }
    }
}
impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// cpu usage is the delta between two refreshes, which need to be at least
/// MINIMUM_CPU_UPDATE_INTERVAL apart.
fn refresh_wait(since_last: Option<Duration>) -> Duration {
    match since_last {
        Some(elapsed) => sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(elapsed),
        None => sysinfo::MINIMUM_CPU_UPDATE_INTERVAL,
    }
}

#[async_trait]
impl ResourceProbe for SysinfoProbe {
    async fn read(&mut self) -> Option<HostCounters> {
        let since_last = self.last_refresh.map(|last| last.elapsed());
        if since_last.is_none() {
            self.system.refresh_cpu_usage();
        }
        let wait = refresh_wait(since_last);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.last_refresh = Some(Instant::now());

        let total_memory = self.system.total_memory();
        if total_memory == 0 || self.system.cpus().is_empty() {
            return None;
        }

        let cpu_percent = self.system.global_cpu_usage();
        if !cpu_percent.is_finite() {
            return None;
        }
        let memory_percent = (self.system.used_memory() as f64 / total_memory as f64 * 100.0) as f32;

        let load_average = if cfg!(target_family = "unix") {
            Some(System::load_average().one)
        } else {
            None
        };

        trace!(cpu_percent, memory_percent, ?load_average, "read host counters");
        Some(HostCounters {
            cpu_percent,
            memory_percent,
            load_average,
            cores: num_cpus::get(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Stressed,
}
impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "healthy"),
            Health::Stressed => write!(f, "stressed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub load_average: Option<f64>,
    pub health: Health,
    /// true when the host counters were unavailable and the verdict is a fail-open default
    pub degraded: bool,
}
impl ResourceSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

/// Classifies host counters against the thresholds.
pub fn classify(counters: &HostCounters, thresholds: &ResourceThresholds) -> Health {
    if counters.cpu_percent > thresholds.cpu_percent {
        debug!("CPU high: {:.1}%", counters.cpu_percent);
        return Health::Stressed;
    }

    if counters.memory_percent > thresholds.memory_percent {
        debug!("Memory high: {:.1}%", counters.memory_percent);
        return Health::Stressed;
    }

    if thresholds.check_load_average {
        if let Some(load) = counters.load_average {
            if load > counters.cores as f64 * thresholds.load_factor {
                debug!("Load average high: {:.2} ({} cores)", load, counters.cores);
                return Health::Stressed;
            }
        }
    }

    Health::Healthy
}

/// Decides whether the host has room for more work.
pub struct ResourceGovernor {
    probe: Mutex<Box<dyn ResourceProbe>>,
    thresholds: ResourceThresholds,
}
impl ResourceGovernor {
    pub fn new(probe: Box<dyn ResourceProbe>, thresholds: ResourceThresholds) -> Self {
        Self {
            probe: Mutex::new(probe),
            thresholds,
        }
    }

    pub fn with_sysinfo(thresholds: ResourceThresholds) -> Self {
        Self::new(Box::new(SysinfoProbe::new()), thresholds)
    }

    pub async fn sample(&self) -> ResourceSnapshot {
        let counters = self.probe.lock().await.read().await;
        let timestamp = Utc::now();

        match counters {
            Some(counters) => ResourceSnapshot {
                timestamp,
                cpu_percent: counters.cpu_percent,
                memory_percent: counters.memory_percent,
                load_average: counters.load_average,
                health: classify(&counters, &self.thresholds),
                degraded: false,
            },

            None => {
                warn!("Host resource counters unavailable, admitting work anyway");
                ResourceSnapshot {
                    timestamp,
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    load_average: None,
                    health: Health::Healthy,
                    degraded: true,
                }
            }
        }
    }

    pub async fn is_admissible(&self) -> bool {
        self.sample().await.is_healthy()
    }
}
