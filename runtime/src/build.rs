//! Build delegation.
//!
//! The lifecycle phases that actually populate an app image's layers are an
//! external pipeline; kiln resolves which builder and run image to use, then
//! runs each phase in a container created from the builder image and streams
//! its output. The run supervisor depends only on the [`Task`] trait.

use std::path::PathBuf;

use async_trait::async_trait;

use kiln_core::config::{run_image_by_registry, Config};
use kiln_core::error::{KilnError, Result};
use kiln_core::reference::ImageReference;
use kiln_core::Reporter;

use crate::docker::{ContainerSpec, DockerClient};

/// Workspace path the app directory is mounted at inside phase containers.
const APP_MOUNT: &str = "/workspace";

/// Something the supervisor can run to completion before starting containers.
#[async_trait]
pub trait Task: Send {
    async fn run(&mut self) -> Result<()>;
}

/// Flags shared by `build` and `run`.
#[derive(Debug, Clone, Default)]
pub struct BuildFlags {
    pub repo_name: String,
    /// App directory; defaults to the current working directory.
    pub app_dir: Option<PathBuf>,
    /// Builder image; defaults to the configured default builder.
    pub builder: String,
    /// Run image; defaults to the default stack's run image for the target
    /// registry.
    pub run_image: String,
    pub env_file: Option<PathBuf>,
    pub buildpacks: Vec<String>,
    pub publish: bool,
    pub no_pull: bool,
}

/// Resolves build flags against the configuration store.
pub struct BuildFactory<'a> {
    pub config: &'a Config,
    pub docker: &'a DockerClient,
    pub reporter: &'a Reporter,
}

impl BuildFactory<'_> {
    pub fn build_config(&self, flags: BuildFlags) -> Result<BuildConfig> {
        let app_dir = match flags.app_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        // `run` has no image argument; derive a stable local name from the
        // app directory
        let repo_name = if flags.repo_name.is_empty() {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(app_dir.display().to_string().as_bytes());
            format!("kiln.local/run/{}", &hex::encode(digest)[..12])
        } else {
            flags.repo_name
        };

        let builder_image = if flags.builder.is_empty() {
            self.config.default_builder.clone()
        } else {
            flags.builder
        };

        let run_image = if flags.run_image.is_empty() {
            let stack = self.config.get("")?;
            if stack.run_images.is_empty() {
                return Err(KilnError::InvalidStack(stack.id.clone()));
            }
            let registry = ImageReference::registry_of(&repo_name)?;
            run_image_by_registry(&registry, &stack.run_images)?
        } else {
            flags.run_image
        };

        let env = match &flags.env_file {
            Some(path) => parse_env_file(&std::fs::read_to_string(path)?),
            None => Vec::new(),
        };

        Ok(BuildConfig {
            repo_name,
            app_dir,
            builder_image,
            run_image,
            env,
            buildpacks: flags.buildpacks,
            publish: flags.publish,
            no_pull: flags.no_pull,
            docker: DockerClient::clone(self.docker),
            reporter: Reporter::clone(self.reporter),
        })
    }
}

/// One resolved build, ready to run.
pub struct BuildConfig {
    pub repo_name: String,
    pub app_dir: PathBuf,
    pub builder_image: String,
    pub run_image: String,
    pub env: Vec<String>,
    pub buildpacks: Vec<String>,
    pub publish: bool,
    pub no_pull: bool,
    docker: DockerClient,
    reporter: Reporter,
}

#[async_trait]
impl Task for BuildConfig {
    async fn run(&mut self) -> Result<()> {
        if !self.no_pull {
            self.docker.pull(&self.builder_image).await?;
            self.docker.pull(&self.run_image).await?;
        }

        self.reporter.info("*** DETECTING:");
        self.run_phase("detect", vec!["/lifecycle/detector".to_string()])
            .await?;

        self.reporter.info("*** ANALYZING:");
        let mut analyze = vec!["/lifecycle/analyzer".to_string()];
        if !self.publish {
            analyze.push("-daemon".to_string());
        }
        analyze.push(self.repo_name.clone());
        self.run_phase("analyze", analyze).await?;

        self.reporter.info("*** BUILDING:");
        self.run_phase("build", vec!["/lifecycle/builder".to_string()])
            .await?;

        self.reporter.info("*** EXPORTING:");
        let mut export = vec!["/lifecycle/exporter".to_string()];
        if !self.publish {
            export.push("-daemon".to_string());
        }
        export.push("-image".to_string());
        export.push(self.run_image.clone());
        export.push(self.repo_name.clone());
        self.run_phase("export", export).await?;

        Ok(())
    }
}

impl BuildConfig {
    /// Run one lifecycle phase in a container from the builder image,
    /// streaming its output; a nonzero exit fails the build.
    async fn run_phase(&self, phase: &str, cmd: Vec<String>) -> Result<()> {
        let mut env = self.env.clone();
        if !self.buildpacks.is_empty() {
            // selected buildpacks travel to the pipeline through its environment
            env.push(format!("KILN_BUILDPACKS={}", self.buildpacks.join(",")));
        }
        let spec = ContainerSpec {
            image: self.builder_image.clone(),
            cmd: Some(cmd),
            env: (!env.is_empty()).then_some(env),
            binds: Some(vec![format!("{}:{APP_MOUNT}", self.app_dir.display())]),
            ..Default::default()
        };
        let id = self.docker.create(&spec).await?;
        let result = self.docker.run(&id).await;
        let status = self.docker.wait(&id).await;
        if let Err(e) = self.docker.remove_force(&id).await {
            tracing::debug!(container = %id, error = %e, "failed to remove phase container");
        }
        result?;
        match status? {
            0 => Ok(()),
            code => Err(KilnError::Build(format!(
                "{phase} phase failed with status {code}"
            ))),
        }
    }
}

/// Parse `KEY=VALUE` lines; blank lines and `#` comments are skipped.
pub fn parse_env_file(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Stack;
    use tempfile::TempDir;

    #[test]
    fn test_parse_env_file() {
        let env = parse_env_file("FOO=bar\n\n# comment\n  BAZ=qux  \n");
        assert_eq!(env, vec!["FOO=bar".to_string(), "BAZ=qux".to_string()]);
    }

    #[test]
    fn test_build_config_resolves_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path()).unwrap();
        let docker = DockerClient::connect().unwrap();
        let reporter = Reporter::new(false, true);
        let factory = BuildFactory {
            config: &config,
            docker: &docker,
            reporter: &reporter,
        };

        let built = factory
            .build_config(BuildFlags {
                repo_name: "myorg/app".to_string(),
                app_dir: Some(tmp.path().to_path_buf()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(built.builder_image, "packs/samples");
        assert_eq!(built.run_image, "packs/run");
    }

    #[test]
    fn test_build_config_picks_run_image_by_registry() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::new(tmp.path()).unwrap();
        config
            .add(Stack {
                id: "org.example.multi".to_string(),
                build_image: "org.example/build".to_string(),
                build_images: None,
                run_images: vec!["quay.io/r/run".to_string(), "docker.io/r/run".to_string()],
            })
            .unwrap();
        config.set_default_stack("org.example.multi").unwrap();
        let docker = DockerClient::connect().unwrap();
        let reporter = Reporter::new(false, true);
        let factory = BuildFactory {
            config: &config,
            docker: &docker,
            reporter: &reporter,
        };

        let built = factory
            .build_config(BuildFlags {
                repo_name: "quay.io/myorg/app".to_string(),
                app_dir: Some(tmp.path().to_path_buf()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(built.run_image, "quay.io/r/run");
    }

    #[test]
    fn test_build_config_derives_repo_name_when_absent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path()).unwrap();
        let docker = DockerClient::connect().unwrap();
        let reporter = Reporter::new(false, true);
        let factory = BuildFactory {
            config: &config,
            docker: &docker,
            reporter: &reporter,
        };

        let built = factory
            .build_config(BuildFlags {
                app_dir: Some(tmp.path().to_path_buf()),
                ..Default::default()
            })
            .unwrap();
        assert!(built.repo_name.starts_with("kiln.local/run/"));

        // stable for the same app directory
        let again = factory
            .build_config(BuildFlags {
                app_dir: Some(tmp.path().to_path_buf()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(built.repo_name, again.repo_name);
    }

    #[test]
    fn test_build_config_keeps_explicit_images() {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path()).unwrap();
        let docker = DockerClient::connect().unwrap();
        let reporter = Reporter::new(false, true);
        let factory = BuildFactory {
            config: &config,
            docker: &docker,
            reporter: &reporter,
        };

        let built = factory
            .build_config(BuildFlags {
                repo_name: "myorg/app".to_string(),
                app_dir: Some(tmp.path().to_path_buf()),
                builder: "custom/builder".to_string(),
                run_image: "custom/run".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(built.builder_image, "custom/builder");
        assert_eq!(built.run_image, "custom/run");
    }
}
