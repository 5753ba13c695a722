/// Image preloading into kind nodes
use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::info;

use crate::config::ImagesSpec;
use crate::utils::command::{check_tool_installed, CommandBuilder, CommandRunner};

/// Pulls images with docker and loads them into a kind cluster
pub struct ImagePreloader<'a> {
    runner: &'a dyn CommandRunner,
    cluster_name: &'a str,
}

impl<'a> ImagePreloader<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cluster_name: &'a str) -> Self {
        Self {
            runner,
            cluster_name,
        }
    }

    /// Check if docker is installed
    pub async fn check_docker_installed(runner: &dyn CommandRunner) -> Result<()> {
        check_tool_installed(
            runner,
            "docker",
            &["version"],
            "https://docs.docker.com/get-docker/",
        )
        .await
    }

    /// Preload every image
    ///
    /// With a concurrency of 1 each image is pulled and loaded before the
    /// next one starts. Pull always precedes load for the same image. The
    /// first failure stops the run.
    pub async fn preload(&self, images: &ImagesSpec) -> Result<usize> {
        if images.references.is_empty() {
            info!("No images to preload");
            return Ok(0);
        }

        info!(
            "Preloading {} images into kind cluster {} (concurrency {})",
            images.references.len(),
            self.cluster_name,
            images.concurrency
        );

        let loaded: Vec<()> = stream::iter(images.references.iter())
            .map(|image| self.preload_one(image))
            .buffered(images.concurrency.max(1))
            .try_collect()
            .await?;

        info!("✓ Preloaded {} images", loaded.len());
        Ok(loaded.len())
    }

    /// Pull one image, then load it into every node of the cluster
    pub async fn preload_one(&self, image: &str) -> Result<()> {
        info!("Pulling {}...", image);
        CommandBuilder::new("docker")
            .args(["pull", image])
            .context(format!("Failed to pull {}", image))
            .run_silent(self.runner)
            .await?;

        info!("Loading {} into {}...", image, self.cluster_name);
        CommandBuilder::new("kind")
            .args(["load", "docker-image", image, "--name", self.cluster_name])
            .context(format!("Failed to load {} into kind", image))
            .run_silent(self.runner)
            .await
    }
}
