/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::Matrix;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One experiment: a variant deployed at a given scale, for one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    pub scenario_id: String,
    pub variant: String,
    pub server_count: u32,
    pub client_count: u32,
    pub messages_per_client: u32,
    pub run_index: u32,
}
impl ScenarioDescriptor {
    pub fn new(variant: &str, configuration: Configuration, run_index: u32) -> Self {
        let Configuration {
            server_count,
            client_count,
            messages_per_client,
        } = configuration;

        Self {
            scenario_id: format!(
                "{}_{}s_{}c_{}m_r{}",
                variant, server_count, client_count, messages_per_client, run_index
            ),
            variant: variant.to_string(),
            server_count,
            client_count,
            messages_per_client,
            run_index,
        }
    }

    pub fn configuration(&self) -> Configuration {
        Configuration {
            server_count: self.server_count,
            client_count: self.client_count,
            messages_per_client: self.messages_per_client,
        }
    }

    /// Total messages the load run sends.
    pub fn total_messages(&self) -> u64 {
        u64::from(self.client_count) * u64::from(self.messages_per_client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Configuration {
    pub server_count: u32,
    pub client_count: u32,
    pub messages_per_client: u32,
}
impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} servers, {} clients, {} messages",
            self.server_count, self.client_count, self.messages_per_client
        )
    }
}

/// Server/client/message triples in generation order.
pub fn configurations(matrix: &Matrix) -> Vec<Configuration> {
    iproduct!(
        matrix.servers.iter().copied(),
        matrix.clients.iter().copied(),
        matrix.messages.iter().copied()
    )
    .map(|(server_count, client_count, messages_per_client)| Configuration {
        server_count,
        client_count,
        messages_per_client,
    })
    .collect()
}

/// The runs of one configuration, run_index starting at 1.
pub fn scenarios_for(
    variant: &str,
    configuration: Configuration,
    runs: u32,
) -> impl Iterator<Item = ScenarioDescriptor> + '_ {
    (1..=runs).map(move |run| ScenarioDescriptor::new(variant, configuration, run))
}

/// Every scenario of the matrix, nested variant, servers, clients, messages, run.
pub fn generate_scenarios(matrix: &Matrix) -> Vec<ScenarioDescriptor> {
    let configurations = configurations(matrix);
    matrix
        .variants
        .iter()
        .flat_map(|variant| {
            configurations
                .iter()
                .flat_map(move |conf| scenarios_for(variant, *conf, matrix.runs_per_config))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use std::collections::HashSet;

    fn small_matrix() -> Matrix {
        Matrix {
            variants: vec!["c".to_string(), "cpp".to_string()],
            servers: vec![2, 4],
            clients: vec![10, 20, 30],
            messages: vec![1, 100],
            runs_per_config: 3,
        }
    }

    #[test]
    fn generates_the_full_cross_product() {
        let matrix = small_matrix();
        let scenarios = generate_scenarios(&matrix);
        assert_eq!(scenarios.len(), 2 * 2 * 3 * 2 * 3);

        let ids: HashSet<_> = scenarios.iter().map(|s| s.scenario_id.clone()).collect();
        assert_eq!(ids.len(), scenarios.len());

        let fields: HashSet<_> = scenarios
            .iter()
            .map(|s| {
                (
                    s.variant.clone(),
                    s.server_count,
                    s.client_count,
                    s.messages_per_client,
                    s.run_index,
                )
            })
            .collect();
        assert_eq!(fields.len(), scenarios.len());
    }

    #[test]
    fn nesting_order_is_variant_servers_clients_messages_run() {
        let scenarios = generate_scenarios(&small_matrix());

        let first = &scenarios[0];
        assert_eq!(first.scenario_id, "c_2s_10c_1m_r1");
        assert_eq!(scenarios[1].scenario_id, "c_2s_10c_1m_r2");
        assert_eq!(scenarios[3].scenario_id, "c_2s_10c_100m_r1");
        assert_eq!(scenarios[6].scenario_id, "c_2s_20c_1m_r1");
        assert_eq!(scenarios[18].scenario_id, "c_4s_10c_1m_r1");
        assert_eq!(scenarios[36].scenario_id, "cpp_2s_10c_1m_r1");
        assert_eq!(scenarios.last().map(|s| s.scenario_id.as_str()), Some("cpp_4s_30c_100m_r3"));

        let variants = scenarios.iter().map(|s| s.variant.as_str()).dedup().collect_vec();
        assert_eq!(variants, vec!["c", "cpp"]);
    }

    #[test]
    fn generation_is_deterministic() {
        let matrix = small_matrix();
        assert_eq!(generate_scenarios(&matrix), generate_scenarios(&matrix));
    }

    #[test]
    fn configurations_follow_the_same_order() {
        let matrix = small_matrix();
        let confs = configurations(&matrix);
        assert_eq!(confs.len(), 12);
        assert!(confs.windows(2).all(|w| w[0] < w[1]));

        let from_scenarios = generate_scenarios(&matrix)
            .iter()
            .filter(|s| s.variant == "c")
            .map(|s| s.configuration())
            .dedup()
            .collect_vec();
        assert_eq!(from_scenarios, confs);
    }

    #[test]
    fn runs_are_one_based() {
        let conf = Configuration {
            server_count: 2,
            client_count: 10,
            messages_per_client: 5,
        };
        let runs = scenarios_for("c", conf, 2).map(|s| s.run_index).collect_vec();
        assert_eq!(runs, vec![1, 2]);
        assert_eq!(ScenarioDescriptor::new("c", conf, 1).total_messages(), 50);
    }
}
