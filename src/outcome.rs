/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{platform::LoadReport, scenario::ScenarioDescriptor};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Why a scenario failed. The display strings are what ends up in the result log.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScenarioError {
    #[error("slot acquisition timeout")]
    SlotTimeout,

    #[error("deploy failure")]
    DeployFailure { reason: String },

    #[error("client execution failure")]
    ClientFailure { reason: String },

    #[error("{0}")]
    Unexpected(String),
}
impl ScenarioError {
    pub fn deploy(reason: impl ToString) -> Self {
        ScenarioError::DeployFailure {
            reason: reason.to_string(),
        }
    }

    pub fn client(reason: impl ToString) -> Self {
        ScenarioError::ClientFailure {
            reason: reason.to_string(),
        }
    }

    /// The underlying cause, for logging.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ScenarioError::DeployFailure { reason } | ScenarioError::ClientFailure { reason } => {
                Some(reason)
            }
            _ => None,
        }
    }
}

/// Latency distribution of one load run, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub stddev: f64,
}
impl LatencySummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let sorted = samples
            .iter()
            .copied()
            .filter(|s| s.is_finite())
            .sorted_by(|a, b| a.total_cmp(b))
            .collect_vec();
        let (first, last) = (*sorted.first()?, *sorted.last()?);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        Some(LatencySummary {
            mean,
            min: first,
            max: last,
            median,
            stddev: variance.sqrt(),
        })
    }

    /// Prefers raw samples. Falls back to the aggregates the driver reported, with the median
    /// defaulting to the mean and the deviation to zero.
    pub fn from_report(report: &LoadReport) -> Self {
        LatencySummary::from_samples(&report.latencies).unwrap_or(LatencySummary {
            mean: report.avg_latency,
            min: report.min_latency,
            max: report.max_latency,
            median: report.median_latency.unwrap_or(report.avg_latency),
            stddev: report.stddev_latency.unwrap_or(0.0),
        })
    }
}

/// The record of one scenario execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    #[serde(flatten)]
    pub descriptor: ScenarioDescriptor,
    pub success: bool,
    /// seconds
    pub duration: f64,
    pub latency: LatencySummary,
    pub throughput: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_rate: f64,
    pub workload_ports: Vec<u16>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_message: String,
}

pub const CSV_HEADER: [&str; 21] = [
    "scenario_id",
    "variant",
    "server_count",
    "client_count",
    "messages_per_client",
    "run_index",
    "success",
    "duration",
    "latency_avg",
    "latency_min",
    "latency_max",
    "latency_median",
    "latency_stddev",
    "throughput",
    "messages_sent",
    "messages_received",
    "error_rate",
    "workload_ports",
    "started_at",
    "finished_at",
    "error_message",
];

impl ScenarioOutcome {
    pub fn success(
        descriptor: ScenarioDescriptor,
        workload_ports: Vec<u16>,
        started_at: DateTime<Utc>,
        duration: Duration,
        report: &LoadReport,
    ) -> Self {
        ScenarioOutcome {
            descriptor,
            success: true,
            duration: duration.as_secs_f64(),
            latency: LatencySummary::from_report(report),
            throughput: report.throughput,
            messages_sent: report.total_requests,
            messages_received: report.successful_requests,
            error_rate: report.failed_requests as f64 / report.total_requests.max(1) as f64,
            workload_ports,
            started_at,
            finished_at: Utc::now(),
            error_message: String::new(),
        }
    }

    pub fn failure(
        descriptor: ScenarioDescriptor,
        workload_ports: Vec<u16>,
        started_at: DateTime<Utc>,
        duration: Duration,
        error: &ScenarioError,
    ) -> Self {
        ScenarioOutcome {
            descriptor,
            success: false,
            duration: duration.as_secs_f64(),
            latency: LatencySummary::default(),
            throughput: 0.0,
            messages_sent: 0,
            messages_received: 0,
            error_rate: 1.0,
            workload_ports,
            started_at,
            finished_at: Utc::now(),
            error_message: error.to_string(),
        }
    }

    pub fn to_csv_record(&self) -> Vec<String> {
        let d = &self.descriptor;
        vec![
            d.scenario_id.clone(),
            d.variant.clone(),
            d.server_count.to_string(),
            d.client_count.to_string(),
            d.messages_per_client.to_string(),
            d.run_index.to_string(),
            self.success.to_string(),
            format!("{:.6}", self.duration),
            format!("{:.6}", self.latency.mean),
            format!("{:.6}", self.latency.min),
            format!("{:.6}", self.latency.max),
            format!("{:.6}", self.latency.median),
            format!("{:.6}", self.latency.stddev),
            format!("{:.3}", self.throughput),
            self.messages_sent.to_string(),
            self.messages_received.to_string(),
            format!("{:.4}", self.error_rate),
            self.workload_ports.iter().join(";"),
            self.started_at.to_rfc3339(),
            self.finished_at.to_rfc3339(),
            self.error_message.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Configuration;

    fn descriptor() -> ScenarioDescriptor {
        let conf = Configuration {
            server_count: 2,
            client_count: 10,
            messages_per_client: 5,
        };
        ScenarioDescriptor::new("A", conf, 1)
    }

    #[test]
    fn summary_from_samples() {
        let summary = LatencySummary::from_samples(&[0.4, 0.1, 0.3, 0.2]).expect("non-empty");
        assert!((summary.mean - 0.25).abs() < 1e-12);
        assert_eq!(summary.min, 0.1);
        assert_eq!(summary.max, 0.4);
        assert!((summary.median - 0.25).abs() < 1e-12);
        assert!((summary.stddev - 0.0125f64.sqrt()).abs() < 1e-12);

        let odd = LatencySummary::from_samples(&[3.0, 1.0, 2.0]).expect("non-empty");
        assert_eq!(odd.median, 2.0);

        assert!(LatencySummary::from_samples(&[]).is_none());
    }

    #[test]
    fn summary_falls_back_to_reported_aggregates() {
        let report = LoadReport {
            avg_latency: 0.02,
            min_latency: 0.01,
            max_latency: 0.05,
            ..Default::default()
        };
        let summary = LatencySummary::from_report(&report);
        assert_eq!(summary.median, 0.02);
        assert_eq!(summary.stddev, 0.0);
        assert_eq!(summary.max, 0.05);
    }

    #[test]
    fn success_outcome_computes_error_rate() {
        let report = LoadReport {
            success: true,
            total_requests: 50,
            successful_requests: 45,
            failed_requests: 5,
            throughput: 500.0,
            ..Default::default()
        };
        let outcome = ScenarioOutcome::success(
            descriptor(),
            vec![8000, 8001],
            Utc::now(),
            Duration::from_millis(1500),
            &report,
        );

        assert!(outcome.success);
        assert_eq!(outcome.messages_sent, 50);
        assert_eq!(outcome.messages_received, 45);
        assert!((outcome.error_rate - 0.1).abs() < 1e-12);
        assert_eq!(outcome.duration, 1.5);
        assert!(outcome.error_message.is_empty());
    }

    #[test]
    fn failure_outcome_has_zeroed_metrics() {
        let outcome = ScenarioOutcome::failure(
            descriptor(),
            vec![],
            Utc::now(),
            Duration::from_secs(3),
            &ScenarioError::deploy("image pull backoff"),
        );

        assert!(!outcome.success);
        assert_eq!(outcome.error_message, "deploy failure");
        assert_eq!(outcome.error_rate, 1.0);
        assert_eq!(outcome.latency, LatencySummary::default());
        assert_eq!(outcome.messages_sent, 0);
        assert_eq!(outcome.duration, 3.0);
    }

    #[test]
    fn csv_record_matches_header() {
        let outcome = ScenarioOutcome::failure(
            descriptor(),
            vec![8000, 8001],
            Utc::now(),
            Duration::ZERO,
            &ScenarioError::SlotTimeout,
        );
        let record = outcome.to_csv_record();

        assert_eq!(record.len(), CSV_HEADER.len());
        assert_eq!(record[0], "A_2s_10c_5m_r1");
        assert_eq!(record[17], "8000;8001");
        assert_eq!(record[20], "slot acquisition timeout");
    }

    #[test]
    fn error_messages() {
        assert_eq!(ScenarioError::client("exit 1").to_string(), "client execution failure");
        assert_eq!(ScenarioError::client("exit 1").reason(), Some("exit 1"));
        assert_eq!(ScenarioError::Unexpected("boom".into()).to_string(), "boom");
    }
}
