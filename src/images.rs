/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Builds the client and server images from their build contexts and pushes them to the
//! registry the cluster pulls from.

use crate::config::ImagesConfig;
use anyhow::{anyhow, bail, Context};
use bollard::{
    auth::DockerCredentials,
    image::{BuildImageOptions, PushImageOptions},
    Docker,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// repository:tag
    pub name: String,
    pub context: PathBuf,
    pub dockerfile: String,
}
impl ImageSpec {
    pub fn repository_and_tag(&self) -> (&str, &str) {
        match self.name.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (&self.name, "latest"),
        }
    }
}

/// The client image followed by one server image per variant.
pub fn planned_images(images: &ImagesConfig, variants: &[String]) -> anyhow::Result<Vec<ImageSpec>> {
    let mut specs = vec![ImageSpec {
        name: images.client_image(),
        context: images.client_context.clone(),
        dockerfile: images.dockerfile.clone(),
    }];

    for variant in variants {
        let context = images
            .servers
            .get(variant)
            .ok_or_else(|| anyhow!("No build context configured for variant {}", variant))?;
        specs.push(ImageSpec {
            name: images.server_image(variant),
            context: context.clone(),
            dockerfile: images.dockerfile.clone(),
        });
    }

    Ok(specs)
}

/// Packs a build context directory into an in-memory tar archive.
pub fn tar_context(dir: &Path) -> anyhow::Result<Bytes> {
    if !dir.is_dir() {
        bail!("Build context {} is not a directory", dir.display());
    }
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(true);
    archive
        .append_dir_all(".", dir)
        .context(format!("Unable to archive {}", dir.display()))?;
    Ok(Bytes::from(archive.into_inner()?))
}

/// Registry credentials from `DOCKER_USERNAME` / `DOCKER_PASSWORD`, if set.
pub fn credentials_from_env() -> Option<DockerCredentials> {
    let username = dotenvy::var("DOCKER_USERNAME").ok()?;
    let password = dotenvy::var("DOCKER_PASSWORD").ok()?;
    Some(DockerCredentials {
        username: Some(username),
        password: Some(password),
        serveraddress: dotenvy::var("DOCKER_REGISTRY").ok(),
        ..Default::default()
    })
}

#[derive(Clone)]
pub struct ImageBuilder {
    docker: Docker,
    push: bool,
    credentials: Option<DockerCredentials>,
}
impl ImageBuilder {
    pub fn new(docker: Docker, push: bool, credentials: Option<DockerCredentials>) -> Self {
        Self {
            docker,
            push,
            credentials,
        }
    }

    pub async fn image_exists(&self, name: &str) -> bool {
        self.docker.inspect_image(name).await.is_ok()
    }

    pub async fn build(&self, spec: &ImageSpec) -> anyhow::Result<()> {
        info!("Building image {} from {}", spec.name, spec.context.display());
        let context = tar_context(&spec.context)?;

        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.as_str(),
            t: spec.name.as_str(),
            rm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, Some(context));
        while let Some(info) = stream.next().await {
            let info = info.context(format!("Build of {} failed", spec.name))?;
            if let Some(err) = info.error {
                bail!("Build of {} failed: {}", spec.name, err);
            }
            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(image = %spec.name, "{}", line);
                }
            }
        }

        Ok(())
    }

    pub async fn push(&self, spec: &ImageSpec) -> anyhow::Result<()> {
        let (repository, tag) = spec.repository_and_tag();
        info!("Pushing image {}", spec.name);

        let mut stream = self.docker.push_image(
            repository,
            Some(PushImageOptions { tag }),
            self.credentials.clone(),
        );
        while let Some(info) = stream.next().await {
            let info = info.context(format!("Push of {} failed", spec.name))?;
            if let Some(err) = info.error {
                bail!("Push of {} failed: {}", spec.name, err);
            }
            if let Some(status) = info.status {
                debug!(image = %spec.name, "{}", status);
            }
        }

        Ok(())
    }

    /// Builds (unless the image already exists and `force` isn't set) and pushes one image.
    pub async fn ensure(&self, spec: &ImageSpec, force: bool) -> anyhow::Result<()> {
        if !force && self.image_exists(&spec.name).await {
            info!("Image {} already present, skipping build", spec.name);
        } else {
            self.build(spec).await?;
        }

        if self.push {
            self.push(spec).await?;
        }
        Ok(())
    }

    /// Runs every image through `ensure` concurrently. Fails if any image failed.
    pub async fn build_and_push_all(&self, specs: Vec<ImageSpec>, force: bool) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for spec in specs {
            let builder = self.clone();
            tasks.spawn(async move {
                let res = builder.ensure(&spec, force).await;
                (spec.name, res)
            });
        }

        let mut failed = vec![];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    error!("{:#}", e);
                    failed.push(name);
                }
                Err(e) => {
                    error!("Image task failed: {}", e);
                    failed.push("<unknown>".to_string());
                }
            }
        }

        if !failed.is_empty() {
            bail!("Failed to prepare images: {}", failed.join(", "));
        }
        Ok(())
    }
}
