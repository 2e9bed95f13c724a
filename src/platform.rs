/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The collaborators the orchestration engine drives: something that can deploy and tear down
//! workload instances, something that can run load against them, and something that can
//! report on the health of the cluster and the container runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Every way a collaborator call can fail.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("client job {0} failed")]
    JobFailed(String),

    #[error("load driver returned no report")]
    NoReport,

    #[error("invalid load report: {0}")]
    InvalidReport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
}

/// One deployed server unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub name: String,
    pub variant: String,
    pub port: u16,
    /// host:port the load driver should connect to
    pub address: String,
}

/// The statistics a load run reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub success: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// seconds
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub median_latency: Option<f64>,
    pub stddev_latency: Option<f64>,
    /// raw per-request latencies, when the driver provides them
    #[serde(default)]
    pub latencies: Vec<f64>,
    /// requests per second
    pub throughput: f64,
}

#[async_trait]
pub trait WorkloadDeployer: Send + Sync {
    /// Materializes one workload instance. Calling it again with the same name must be safe.
    async fn deploy(
        &self,
        name: &str,
        variant: &str,
        port: u16,
    ) -> Result<WorkloadInstance, PlatformError>;

    /// Blocks until every named instance is reachable or the timeout elapses.
    async fn await_ready(&self, names: &[String], timeout: Duration) -> Result<(), PlatformError>;

    /// Best-effort cleanup. Must not fail and must tolerate names that no longer exist.
    async fn teardown(&self, names: &[String]);
}

#[async_trait]
pub trait LoadDriver: Send + Sync {
    async fn run_load(
        &self,
        addresses: &[String],
        client_count: u32,
        messages_per_client: u32,
        timeout: Duration,
    ) -> Result<LoadReport, PlatformError>;
}

#[async_trait]
pub trait ClusterHealth: Send + Sync {
    /// Number of workload instances currently live in the cluster, None if it can't be counted.
    async fn live_workloads(&self) -> Option<usize>;

    async fn runtime_reachable(&self) -> bool;
}
