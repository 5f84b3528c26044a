//! Container daemon client.
//!
//! Thin wrapper over `bollard` exposing the handful of operations kiln needs:
//! pull (with a single retry), image inspect, container create/run/remove,
//! and image tarball export/load for the local image variant. The run
//! supervisor sees this client only through the [`ContainerRuntime`] trait.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ImportImageOptions};
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use kiln_core::error::{KilnError, Result};

use crate::run::PortBinding;

/// Inspect results reduced to the fields kiln reads.
#[derive(Debug, Clone, Default)]
pub struct ImageDetails {
    pub id: String,
    pub repo_digests: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Exposed container ports as bare numbers (the protocol suffix is
    /// stripped so they normalize like user-supplied port specs).
    pub exposed_ports: Vec<String>,
    /// Rootfs diff-ids, bottom to top.
    pub diff_ids: Vec<String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub binds: Option<Vec<String>>,
    pub bindings: Vec<PortBinding>,
    pub auto_remove: bool,
}

/// Client for the local container daemon.
#[derive(Clone)]
pub struct DockerClient {
    docker: bollard::Docker,
}

impl DockerClient {
    /// Connect using the environment's daemon defaults.
    pub fn connect() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| KilnError::Docker(format!("connecting to docker: {e}")))?;
        Ok(Self { docker })
    }

    /// Pull an image, retrying once on failure.
    pub async fn pull(&self, reference: &str) -> Result<()> {
        if let Err(first) = self.try_pull(reference).await {
            tracing::debug!(reference, error = %first, "pull failed, retrying once");
            return self.try_pull(reference).await;
        }
        Ok(())
    }

    async fn try_pull(&self, reference: &str) -> Result<()> {
        let options = CreateImageOptions::<String> {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(KilnError::docker)?;
        }
        Ok(())
    }

    /// Inspect an image. A daemon 404 maps to [`KilnError::ImageNotFound`],
    /// which callers rely on to distinguish a missing image from a missing
    /// label.
    pub async fn inspect(&self, name: &str) -> Result<ImageDetails> {
        let inspect = self.docker.inspect_image(name).await.map_err(|e| match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => KilnError::ImageNotFound(name.to_string()),
            other => KilnError::docker(other),
        })?;

        let config = inspect.config.unwrap_or_default();
        Ok(ImageDetails {
            id: inspect.id.unwrap_or_default(),
            repo_digests: inspect.repo_digests.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            exposed_ports: config
                .exposed_ports
                .map(|ports| {
                    ports
                        .keys()
                        .map(|key| key.split('/').next().unwrap_or(key).to_string())
                        .collect()
                })
                .unwrap_or_default(),
            diff_ids: inspect
                .root_fs
                .and_then(|fs| fs.layers)
                .unwrap_or_default(),
        })
    }

    /// Create a container from a spec; returns the container id.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            HashMap::new();
        for binding in &spec.bindings {
            let key = format!("{}/{}", binding.container_port, binding.proto);
            exposed.insert(key.clone(), HashMap::new());
            if let Some(host_port) = &binding.host_port {
                port_bindings
                    .entry(key)
                    .or_insert_with(|| Some(Vec::new()))
                    .get_or_insert_with(Vec::new)
                    .push(bollard::models::PortBinding {
                        host_ip: binding.host_ip.clone(),
                        host_port: Some(host_port.clone()),
                    });
            }
        }

        let config = Config::<String> {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: spec.env.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            exposed_ports: (!exposed.is_empty()).then_some(exposed),
            host_config: Some(HostConfig {
                auto_remove: Some(spec.auto_remove),
                binds: spec.binds.clone(),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(KilnError::docker)?;
        Ok(created.id)
    }

    /// Start a container and stream its combined output until it exits or
    /// its streams close.
    pub async fn run(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(KilnError::docker)?;

        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = logs.next().await {
            match chunk.map_err(KilnError::docker)? {
                bollard::container::LogOutput::StdErr { message } => {
                    stderr.write_all(&message).await?;
                    stderr.flush().await?;
                }
                bollard::container::LogOutput::StdIn { .. } => {}
                bollard::container::LogOutput::StdOut { message }
                | bollard::container::LogOutput::Console { message } => {
                    stdout.write_all(&message).await?;
                    stdout.flush().await?;
                }
            }
        }
        Ok(())
    }

    /// Wait for a container to exit; returns its status code.
    pub async fn wait(&self, id: &str) -> Result<i64> {
        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(KilnError::docker(e)),
            None => Ok(0),
        }
    }

    /// Force-remove a container.
    pub async fn remove_force(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(KilnError::docker)
    }

    /// Export an image as a tarball to `dest`.
    pub async fn export_image(&self, name: &str, dest: &Path) -> Result<()> {
        let mut stream = self.docker.export_image(name);
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(KilnError::docker)?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Load an image tarball into the daemon.
    pub async fn load_image(&self, tar_path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(tar_path).await?;
        let mut progress =
            self.docker
                .import_image(ImportImageOptions::default(), bytes.into(), None);
        while let Some(step) = progress.next().await {
            step.map_err(KilnError::docker)?;
        }
        Ok(())
    }
}

/// The narrow interface the run supervisor needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Ports the image declares as exposed, as bare numbers.
    async fn exposed_ports(&self, image: &str) -> Result<Vec<String>>;

    /// Create a container for `image` with the given port bindings.
    async fn create_container(&self, image: &str, bindings: &[PortBinding]) -> Result<String>;

    /// Start the container and block streaming its output until it exits.
    async fn run_container(&self, id: &str) -> Result<()>;

    /// Force-remove the container.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn exposed_ports(&self, image: &str) -> Result<Vec<String>> {
        Ok(self.inspect(image).await?.exposed_ports)
    }

    async fn create_container(&self, image: &str, bindings: &[PortBinding]) -> Result<String> {
        self.create(&ContainerSpec {
            image: image.to_string(),
            bindings: bindings.to_vec(),
            auto_remove: true,
            ..Default::default()
        })
        .await
    }

    async fn run_container(&self, id: &str) -> Result<()> {
        self.run(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.remove_force(id).await
    }
}
