/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Kubernetes implementation of the engine's collaborators. Everything goes through the
//! kubectl binary: manifests are built as JSON and piped to `kubectl apply -f -`.

use crate::{
    config::{ClusterConfig, Config, ImagesConfig},
    platform::{ClusterHealth, LoadDriver, LoadReport, PlatformError, WorkloadDeployer, WorkloadInstance},
    runtime::DockerRuntime,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{process::Stdio, time::Duration};
use sysinfo::System;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, trace, warn};

pub const MANAGED_BY: &str = "scalebench";

const JOB_NAME_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Requests and limits applied to every pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodResources {
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}
impl PodResources {
    /// Splits 70% of the host between `pods` pods, never less than 100m / 256Mi per pod.
    /// Limits are twice the request, capped at 1200m / 2048Mi.
    pub fn for_host(total_memory_bytes: u64, pods: usize) -> Self {
        let pods = pods.max(1) as u64;
        let total_mib = total_memory_bytes / (1024 * 1024);

        let memory = (total_mib * 7 / 10 / pods).max(256);
        let cpu = (700 / pods).max(100);
        let memory_limit = (memory * 2).min(2048);
        let cpu_limit = (cpu * 2).min(1200);

        PodResources {
            cpu_request: format!("{}m", cpu.min(cpu_limit)),
            memory_request: format!("{}Mi", memory.min(memory_limit)),
            cpu_limit: format!("{}m", cpu_limit),
            memory_limit: format!("{}Mi", memory_limit),
        }
    }

    /// Host-derived values, with any explicitly configured value taking precedence.
    pub fn from_config(cluster: &ClusterConfig, total_memory_bytes: u64, pods: usize) -> Self {
        let derived = PodResources::for_host(total_memory_bytes, pods);
        PodResources {
            cpu_request: cluster.cpu_request.clone().unwrap_or(derived.cpu_request),
            memory_request: cluster.memory_request.clone().unwrap_or(derived.memory_request),
            cpu_limit: cluster.cpu_limit.clone().unwrap_or(derived.cpu_limit),
            memory_limit: cluster.memory_limit.clone().unwrap_or(derived.memory_limit),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "requests": { "cpu": self.cpu_request, "memory": self.memory_request },
            "limits": { "cpu": self.cpu_limit, "memory": self.memory_limit },
        })
    }
}

pub fn namespace_manifest(namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": namespace, "labels": { "app.kubernetes.io/managed-by": MANAGED_BY } },
    })
}

fn labels(name: &str, role: &str) -> Value {
    json!({ "app": name, "role": role, "managed-by": MANAGED_BY })
}

/// A Deployment running one server replica plus a ClusterIP Service of the same name.
pub fn workload_manifest(
    name: &str,
    variant: &str,
    port: u16,
    image: &str,
    cluster: &ClusterConfig,
    resources: &PodResources,
) -> Value {
    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": cluster.namespace,
            "labels": labels(name, "server"),
            "annotations": { "scalebench/variant": variant },
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": labels(name, "server") },
                "spec": {
                    "containers": [{
                        "name": "server",
                        "image": image,
                        "imagePullPolicy": "Always",
                        "args": [port.to_string()],
                        "ports": [{ "containerPort": port }],
                        "env": [
                            { "name": "PORT", "value": port.to_string() },
                            { "name": "MAX_CONNECTIONS", "value": cluster.max_connections.to_string() },
                            { "name": "THREAD_POOL_SIZE", "value": cluster.thread_pool_size.to_string() },
                        ],
                        "readinessProbe": {
                            "tcpSocket": { "port": port },
                            "periodSeconds": 2,
                        },
                        "resources": resources.to_json(),
                    }],
                },
            },
        },
    });

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": cluster.namespace,
            "labels": labels(name, "server"),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": name },
            "ports": [{ "protocol": "TCP", "port": port, "targetPort": port }],
        },
    });

    json!({ "apiVersion": "v1", "kind": "List", "items": [deployment, service] })
}

#[allow(clippy::too_many_arguments)]
pub fn client_job_manifest(
    name: &str,
    image: &str,
    addresses: &[String],
    clients: u32,
    messages: u32,
    parallelism: usize,
    deadline: Duration,
    cluster: &ClusterConfig,
    resources: &PodResources,
) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "namespace": cluster.namespace,
            "labels": labels(name, "client"),
        },
        "spec": {
            "parallelism": parallelism,
            "completions": 1,
            "backoffLimit": 1,
            "activeDeadlineSeconds": deadline.as_secs().max(1),
            "template": {
                "metadata": { "labels": labels(name, "client") },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "client",
                        "image": image,
                        "imagePullPolicy": "Always",
                        "env": [
                            { "name": "SERVERS", "value": addresses.join(",") },
                            { "name": "CLIENTS", "value": clients.to_string() },
                            { "name": "MESSAGES", "value": messages.to_string() },
                            { "name": "PARALLEL_WORKERS", "value": clients.min(10).to_string() },
                        ],
                        "resources": resources.to_json(),
                    }],
                },
            },
        },
    })
}

pub fn client_job_name(prefix: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().timestamp_millis(),
        nanoid::nanoid!(6, &JOB_NAME_ALPHABET)
    )
}

/// What the client container prints as its last output.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClientReport {
    success: bool,
    latency_avg: f64,
    latency_min: f64,
    latency_max: f64,
    latency_median: Option<f64>,
    latency_stddev: Option<f64>,
    throughput: f64,
    messages_sent: u64,
    messages_received: u64,
    latencies: Vec<f64>,
    error_message: Option<String>,
}

/// Extracts the last JSON report from the client's log output. Messages that were expected
/// but never sent count as failed requests.
pub fn parse_client_report(logs: &str, expected_total: u64) -> Result<LoadReport, PlatformError> {
    let mut offset = 0;
    let mut report = None;
    for line in logs.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            let mut values = serde_json::Deserializer::from_str(&logs[offset..]).into_iter::<Value>();
            if let Some(Ok(value)) = values.next() {
                if value.get("success").is_some() {
                    report = Some(value);
                }
            }
        }
        offset += line.len();
    }

    let report = report.ok_or(PlatformError::NoReport)?;
    let client: ClientReport =
        serde_json::from_value(report).map_err(|e| PlatformError::InvalidReport(e.to_string()))?;

    if let Some(msg) = client.error_message.as_deref().filter(|m| !m.is_empty()) {
        debug!("Client reported: {}", msg);
    }

    let total = client.messages_sent.max(expected_total);
    let received = client.messages_received.min(total);
    Ok(LoadReport {
        success: client.success,
        total_requests: total,
        successful_requests: received,
        failed_requests: total - received,
        avg_latency: client.latency_avg,
        min_latency: client.latency_min,
        max_latency: client.latency_max,
        median_latency: client.latency_median,
        stddev_latency: client.latency_stddev,
        latencies: client.latencies,
        throughput: client.throughput,
    })
}

fn total_host_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

/// Deploys workloads and runs load jobs through kubectl.
pub struct KubernetesPlatform {
    kubectl: Vec<String>,
    cluster: ClusterConfig,
    images: ImagesConfig,
    resources: PodResources,
    max_parallelism: usize,
    runtime: Option<DockerRuntime>,
}
impl KubernetesPlatform {
    pub fn new(config: &Config, runtime: Option<DockerRuntime>) -> anyhow::Result<Self> {
        let kubectl = shlex::split(&config.cluster.kubectl)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| anyhow!("Invalid kubectl command: {}", config.cluster.kubectl))?;
        let max_parallelism = config.concurrency.workload_ceiling();
        let resources =
            PodResources::from_config(&config.cluster, total_host_memory(), max_parallelism);
        debug!(?resources, "Pod resources");

        Ok(Self {
            kubectl,
            cluster: config.cluster.clone(),
            images: config.images.clone(),
            resources,
            max_parallelism,
            runtime,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.cluster.namespace
    }

    fn address(&self, name: &str, port: u16) -> String {
        format!("{}.{}.svc.cluster.local:{}", name, self.cluster.namespace, port)
    }

    async fn run_kubectl(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, PlatformError> {
        let (program, base_args) = self
            .kubectl
            .split_first()
            .ok_or_else(|| {
                PlatformError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty kubectl command",
                ))
            })?;
        let command_line = format!("{} {}", self.kubectl.join(" "), args.join(" "));
        trace!("{}", command_line);

        let mut child = Command::new(program)
            .args(base_args)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| PlatformError::Timeout(timeout))??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(PlatformError::Command {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn apply(&self, manifest: &Value) -> Result<(), PlatformError> {
        let body = serde_json::to_vec(manifest)
            .map_err(|e| PlatformError::InvalidReport(e.to_string()))?;
        let timeout = self.cluster.command_timeout();
        self.run_kubectl(&args(["apply", "-f", "-"]), Some(body.as_slice()), timeout)
            .await
            .map(|_| ())
    }

    fn ns_arg(&self) -> String {
        format!("--namespace={}", self.cluster.namespace)
    }

    /// Creates the namespace and removes client jobs left over from an earlier run.
    pub async fn setup(&self) -> anyhow::Result<()> {
        self.apply(&namespace_manifest(&self.cluster.namespace))
            .await
            .context("Unable to create the namespace, is the cluster reachable?")?;

        let orphans = self
            .run_kubectl(
                &[
                    "delete".to_string(),
                    "jobs".to_string(),
                    self.ns_arg(),
                    format!("--selector=managed-by={},role=client", MANAGED_BY),
                    "--ignore-not-found".to_string(),
                ],
                None,
                self.cluster.command_timeout(),
            )
            .await
            .context("Unable to remove orphaned client jobs")?;
        if !orphans.trim().is_empty() {
            info!("Removed orphaned client jobs:\n{}", orphans.trim());
        }

        info!("Namespace {} ready", self.cluster.namespace);
        Ok(())
    }

    /// Deletes everything this tool created in the namespace.
    pub async fn cleanup_all(&self) -> anyhow::Result<()> {
        self.run_kubectl(
            &[
                "delete".to_string(),
                "deployments,services,jobs".to_string(),
                self.ns_arg(),
                format!("--selector=managed-by={}", MANAGED_BY),
                "--ignore-not-found".to_string(),
            ],
            None,
            self.cluster.command_timeout(),
        )
        .await
        .context("Unable to clean up the namespace")?;
        Ok(())
    }

    async fn run_job(
        &self,
        job_name: &str,
        addresses: &[String],
        client_count: u32,
        messages_per_client: u32,
        timeout: Duration,
    ) -> Result<LoadReport, PlatformError> {
        let parallelism = (client_count as usize).min(self.max_parallelism).max(1);
        let manifest = client_job_manifest(
            job_name,
            &self.images.client_image(),
            addresses,
            client_count,
            messages_per_client,
            parallelism,
            timeout,
            &self.cluster,
            &self.resources,
        );
        self.apply(&manifest).await?;

        tokio::select! {
            res = self.wait_for_job(job_name, "complete", timeout) => {
                res?;
            }
            res = self.wait_for_job(job_name, "failed", timeout) => {
                res?;
                return Err(PlatformError::JobFailed(job_name.to_string()));
            }
        }

        let logs = self
            .run_kubectl(
                &["logs".to_string(), format!("job/{}", job_name), self.ns_arg()],
                None,
                self.cluster.command_timeout(),
            )
            .await?;

        let expected = u64::from(client_count) * u64::from(messages_per_client);
        parse_client_report(&logs, expected)
    }

    async fn wait_for_job(
        &self,
        job_name: &str,
        condition: &str,
        timeout: Duration,
    ) -> Result<String, PlatformError> {
        let cmd = [
            "wait".to_string(),
            format!("--for=condition={}", condition),
            format!("job/{}", job_name),
            self.ns_arg(),
            format!("--timeout={}s", timeout.as_secs().max(1)),
        ];
        self.run_kubectl(&cmd, None, timeout.saturating_add(self.cluster.command_timeout()))
            .await
    }

    fn delete_job_args(&self, job_name: &str) -> Vec<String> {
        vec![
            "delete".to_string(),
            "job".to_string(),
            job_name.to_string(),
            self.ns_arg(),
            "--ignore-not-found".to_string(),
            "--wait=false".to_string(),
        ]
    }

    async fn delete_job(&self, job_name: &str) {
        let res = self
            .run_kubectl(&self.delete_job_args(job_name), None, self.cluster.command_timeout())
            .await;
        if let Err(e) = res {
            warn!("Unable to delete job {}: {}", job_name, e);
        }
    }
}

/// Deletes a client job in the background if it is dropped while still armed, which happens
/// when the load run is cancelled before it could clean up.
struct JobGuard {
    job_name: String,
    command: Vec<String>,
    armed: bool,
}
impl JobGuard {
    fn new(platform: &KubernetesPlatform, job_name: &str) -> Self {
        let mut command = platform.kubectl.clone();
        command.extend(platform.delete_job_args(job_name));
        Self {
            job_name: job_name.to_string(),
            command,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}
impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some((program, args)) = self.command.split_first() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime left to delete job {}", self.job_name);
            return;
        };

        debug!(job = %self.job_name, "Deleting abandoned client job");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let job_name = std::mem::take(&mut self.job_name);
        handle.spawn(async move {
            match cmd.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("Deleting job {} exited with {}", job_name, status),
                Err(e) => warn!("Unable to delete job {}: {}", job_name, e),
            }
        });
    }
}

fn args<const N: usize>(words: [&str; N]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

#[async_trait]
impl WorkloadDeployer for KubernetesPlatform {
    async fn deploy(
        &self,
        name: &str,
        variant: &str,
        port: u16,
    ) -> Result<WorkloadInstance, PlatformError> {
        let image = self.images.server_image(variant);
        let manifest =
            workload_manifest(name, variant, port, &image, &self.cluster, &self.resources);
        self.apply(&manifest).await?;

        Ok(WorkloadInstance {
            name: name.to_string(),
            variant: variant.to_string(),
            port,
            address: self.address(name, port),
        })
    }

    async fn await_ready(&self, names: &[String], timeout: Duration) -> Result<(), PlatformError> {
        if names.is_empty() {
            return Ok(());
        }
        let mut cmd = vec![
            "wait".to_string(),
            "--for=condition=available".to_string(),
            self.ns_arg(),
            format!("--timeout={}s", timeout.as_secs().max(1)),
        ];
        cmd.extend(names.iter().map(|n| format!("deployment/{}", n)));

        self.run_kubectl(&cmd, None, timeout.saturating_add(self.cluster.command_timeout()))
            .await
            .map(|_| ())
    }

    async fn teardown(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut cmd = vec![
            "delete".to_string(),
            "deployment,service".to_string(),
            self.ns_arg(),
            "--ignore-not-found".to_string(),
            "--wait=false".to_string(),
        ];
        cmd.extend(names.iter().cloned());

        if let Err(e) = self.run_kubectl(&cmd, None, self.cluster.command_timeout()).await {
            warn!("Teardown of {} failed: {}", names.join(", "), e);
        }
    }
}

#[async_trait]
impl LoadDriver for KubernetesPlatform {
    async fn run_load(
        &self,
        addresses: &[String],
        client_count: u32,
        messages_per_client: u32,
        timeout: Duration,
    ) -> Result<LoadReport, PlatformError> {
        let job_name = client_job_name(&self.cluster.client_job_prefix);
        debug!(job = %job_name, clients = client_count, messages = messages_per_client, "Starting client job");

        let guard = JobGuard::new(self, &job_name);
        let res = self
            .run_job(&job_name, addresses, client_count, messages_per_client, timeout)
            .await;
        self.delete_job(&job_name).await;
        guard.disarm();
        res
    }
}

#[async_trait]
impl ClusterHealth for KubernetesPlatform {
    async fn live_workloads(&self) -> Option<usize> {
        let res = self
            .run_kubectl(
                &[
                    "get".to_string(),
                    "deployments".to_string(),
                    self.ns_arg(),
                    format!("--selector=managed-by={},role=server", MANAGED_BY),
                    "--output=name".to_string(),
                ],
                None,
                self.cluster.command_timeout(),
            )
            .await;

        match res {
            Ok(out) => Some(out.lines().filter(|l| !l.trim().is_empty()).count()),
            Err(e) => {
                debug!("Unable to count live workloads: {}", e);
                None
            }
        }
    }

    async fn runtime_reachable(&self) -> bool {
        match &self.runtime {
            Some(runtime) => runtime.is_reachable().await,
            None => true,
        }
    }
}
