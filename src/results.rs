/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    outcome::{ScenarioOutcome, CSV_HEADER},
    scenario::Configuration,
};
use anyhow::Context;
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const CSV_FILE: &str = "all_results.csv";
pub const JSONL_FILE: &str = "all_results.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

/// Where outcomes go as soon as they are produced.
pub trait OutcomeSink: Send {
    fn record(&mut self, outcome: &ScenarioOutcome) -> anyhow::Result<()>;
}

/// Append-only result log: one CSV row and one JSON line per outcome, flushed after every
/// record so an interrupted run leaves readable files behind.
pub struct ResultLog {
    dir: PathBuf,
    csv: csv::Writer<File>,
    jsonl: BufWriter<File>,
}
impl ResultLog {
    /// Opens the log in `dir`. Existing results are deleted when `clear_previous` is set,
    /// otherwise new records are appended to them.
    pub fn create(dir: &Path, clear_previous: bool) -> anyhow::Result<Self> {
        if clear_previous && dir.exists() {
            info!("Clearing previous results in {}", dir.display());
            for file in [CSV_FILE, JSONL_FILE, SUMMARY_FILE] {
                let path = dir.join(file);
                if path.exists() {
                    fs::remove_file(&path)
                        .context(format!("Unable to remove {}", path.display()))?;
                }
            }
        }
        fs::create_dir_all(dir).context(format!("Unable to create {}", dir.display()))?;

        let csv_path = dir.join(CSV_FILE);
        let write_header = fs::metadata(&csv_path).map(|m| m.len() == 0).unwrap_or(true);
        let csv_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)
            .context(format!("Unable to open {}", csv_path.display()))?;
        let mut csv = csv::Writer::from_writer(csv_file);
        if write_header {
            csv.write_record(CSV_HEADER)?;
            csv.flush()?;
        }

        let jsonl_path = dir.join(JSONL_FILE);
        let jsonl = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&jsonl_path)
            .context(format!("Unable to open {}", jsonl_path.display()))?;

        debug!("Writing results to {}", dir.display());
        Ok(ResultLog {
            dir: dir.to_path_buf(),
            csv,
            jsonl: BufWriter::new(jsonl),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join(CSV_FILE)
    }
}
impl OutcomeSink for ResultLog {
    fn record(&mut self, outcome: &ScenarioOutcome) -> anyhow::Result<()> {
        self.csv.write_record(outcome.to_csv_record())?;
        self.csv.flush()?;

        serde_json::to_writer(&mut self.jsonl, outcome)?;
        self.jsonl.write_all(b"\n")?;
        self.jsonl.flush()?;
        Ok(())
    }
}

/// Per-configuration verdict of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationSummary {
    pub variant: String,
    #[serde(flatten)]
    pub configuration: Configuration,
    pub runs: u32,
    pub successes: u32,
    pub success_ratio: f64,
    pub passed: bool,
    /// mean over successful runs, seconds
    pub mean_latency: f64,
    pub mean_throughput: f64,
}

pub fn write_summary(dir: &Path, summaries: &[ConfigurationSummary]) -> anyhow::Result<PathBuf> {
    let path = dir.join(SUMMARY_FILE);
    let file = File::create(&path).context(format!("Unable to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summaries)?;
    Ok(path)
}

/// Reads back the JSON-lines log, skipping a truncated last line.
pub fn read_outcomes(dir: &Path) -> anyhow::Result<Vec<ScenarioOutcome>> {
    let path = dir.join(JSONL_FILE);
    let content =
        fs::read_to_string(&path).context(format!("Unable to read {}", path.display()))?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
