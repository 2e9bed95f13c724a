/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use bollard::Docker;
use std::time::Duration;
use tracing::{debug, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle on the local container runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}
impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_defaults().context("Unable to connect to Docker")?;
        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(PING_TIMEOUT, self.docker.ping()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Docker ping failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Docker ping timed out after {:?}", PING_TIMEOUT);
                false
            }
        }
    }

    /// Pre-flight check, an unreachable runtime is fatal.
    pub async fn ensure_reachable(&self) -> anyhow::Result<()> {
        let version = tokio::time::timeout(PING_TIMEOUT, self.docker.version())
            .await
            .context("Docker did not answer in time")?
            .context("Docker is not reachable, is the daemon running?")?;
        debug!(
            "Connected to Docker {}",
            version.version.unwrap_or_else(|| "(unknown version)".to_string())
        );
        Ok(())
    }
}
