//! `kiln build` command.

use std::path::PathBuf;

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{Config, Reporter};
use kiln_runtime::build::{BuildFactory, BuildFlags, Task};
use kiln_runtime::docker::DockerClient;

#[derive(Args)]
pub struct BuildArgs {
    /// App image name
    pub image: String,

    /// Path to app dir (defaults to current working directory)
    #[arg(short = 'p', long = "path")]
    pub path: Option<PathBuf>,

    /// Builder (defaults to the configured default builder)
    #[arg(long)]
    pub builder: Option<String>,

    /// Run image (defaults to default stack's run image)
    #[arg(long)]
    pub run_image: Option<String>,

    /// Environment variables file
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Buildpack ID, path to directory, or path/URL to .tgz file,
    /// repeat for each buildpack in order, or supply once by comma-separated list
    #[arg(long = "buildpack", value_delimiter = ',')]
    pub buildpacks: Vec<String>,

    /// Publish to registry
    #[arg(long)]
    pub publish: bool,

    /// Skip pulling images before use
    #[arg(long)]
    pub no_pull: bool,
}

impl BuildArgs {
    pub(crate) fn into_flags(self) -> BuildFlags {
        BuildFlags {
            repo_name: self.image,
            app_dir: self.path,
            builder: self.builder.unwrap_or_default(),
            run_image: self.run_image.unwrap_or_default(),
            env_file: self.env_file,
            buildpacks: self.buildpacks,
            publish: self.publish,
            no_pull: self.no_pull,
        }
    }
}

pub async fn execute(args: BuildArgs, reporter: &Reporter) -> Result<()> {
    let config = Config::new_default()?;
    let docker = DockerClient::connect()?;
    let factory = BuildFactory {
        config: &config,
        docker: &docker,
        reporter,
    };

    let mut task = factory.build_config(args.into_flags())?;
    task.run().await
}
