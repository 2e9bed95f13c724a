/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! End of run summary printed to the terminal.

use crate::results::ConfigurationSummary;
use colored::*;
use itertools::Itertools;
use std::collections::BTreeMap;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use textplots::{Chart, Plot, Shape};

/// Mean latency (ms) of passing configurations per server count, for each variant. Server
/// counts with several passing configurations are averaged.
pub fn latency_by_servers(summaries: &[ConfigurationSummary]) -> BTreeMap<String, Vec<(f32, f32)>> {
    summaries
        .iter()
        .filter(|s| s.passed)
        .into_group_map_by(|s| s.variant.clone())
        .into_iter()
        .map(|(variant, summaries)| {
            let points = summaries
                .into_iter()
                .into_group_map_by(|s| s.configuration.server_count)
                .into_iter()
                .sorted_by_key(|(servers, _)| *servers)
                .map(|(servers, group)| {
                    let mean = group.iter().map(|s| s.mean_latency).sum::<f64>() / group.len() as f64;
                    (servers as f32, (mean * 1000.0) as f32)
                })
                .collect::<Vec<_>>();
            (variant, points)
        })
        .collect()
}

fn summary_table(summaries: &[&ConfigurationSummary]) -> String {
    let mut rows = rows![row![
        TableCell::builder("Configuration".bold()).build(),
        TableCell::builder("Runs".bold()).build(),
        TableCell::builder("Successes".bold()).build(),
        TableCell::builder("Ratio".bold()).build(),
        TableCell::builder("Mean latency (ms)".bold()).build(),
        TableCell::builder("Throughput (req/s)".bold()).build()
    ]];

    for summary in summaries {
        let ratio = format!("{:.0}%", summary.success_ratio * 100.0);
        rows.push(row![
            TableCell::new(summary.configuration.to_string()),
            TableCell::new(summary.runs),
            TableCell::new(summary.successes),
            TableCell::new(if summary.passed { ratio.green() } else { ratio.red() }),
            TableCell::new(format!("{:.3}", summary.mean_latency * 1000.0)),
            TableCell::new(format!("{:.1}", summary.mean_throughput))
        ]);
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

pub fn print_summary(summaries: &[ConfigurationSummary]) {
    println!("\n{}", " Summary ".reversed().green());
    if summaries.is_empty() {
        println!("No configurations were run.");
        return;
    }

    let by_variant = summaries.iter().into_group_map_by(|s| s.variant.clone());
    for (variant, group) in by_variant.iter().sorted_by_key(|(v, _)| v.as_str()) {
        println!("{}:", variant.green());
        println!("{}", summary_table(group));
    }

    for (variant, points) in latency_by_servers(summaries) {
        if points.len() < 2 {
            continue;
        }
        let xmin = points.first().map(|p| p.0).unwrap_or(0.0);
        let xmax = points.last().map(|p| p.0).unwrap_or(1.0);
        println!("\n{} mean latency (ms) by server count:", variant.green());
        Chart::new(120, 40, xmin, xmax)
            .lineplot(&Shape::Lines(&points))
            .display();
    }
}
