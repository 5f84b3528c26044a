//! `kiln run` command - build, then run the result in a container until it
//! exits or the process is signalled.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{Config, Reporter};
use kiln_runtime::build::BuildFactory;
use kiln_runtime::docker::DockerClient;
use kiln_runtime::run::RunSupervisor;

use super::build::BuildArgs;
use super::cancel_on_signals;

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub build: BuildArgsWithoutImage,

    /// Port to publish (defaults to port(s) exposed by container),
    /// repeat for each port, or supply once by comma-separated list
    #[arg(long = "port", value_delimiter = ',')]
    pub ports: Vec<String>,
}

/// Build flags reused by `run`, which takes no image argument.
#[derive(Args)]
pub struct BuildArgsWithoutImage {
    /// Path to app dir (defaults to current working directory)
    #[arg(short = 'p', long = "path")]
    pub path: Option<std::path::PathBuf>,

    /// Builder (defaults to the configured default builder)
    #[arg(long)]
    pub builder: Option<String>,

    /// Run image (defaults to default stack's run image)
    #[arg(long)]
    pub run_image: Option<String>,

    /// Environment variables file
    #[arg(long)]
    pub env_file: Option<std::path::PathBuf>,

    /// Buildpack ID, path to directory, or path/URL to .tgz file,
    /// repeat for each buildpack in order, or supply once by comma-separated list
    #[arg(long = "buildpack", value_delimiter = ',')]
    pub buildpacks: Vec<String>,

    /// Skip pulling images before use
    #[arg(long)]
    pub no_pull: bool,
}

pub async fn execute(args: RunArgs, reporter: &Reporter) -> Result<()> {
    let config = Config::new_default()?;
    let docker = DockerClient::connect()?;
    let factory = BuildFactory {
        config: &config,
        docker: &docker,
        reporter,
    };

    let build_args = BuildArgs {
        image: String::new(),
        path: args.build.path,
        builder: args.build.builder,
        run_image: args.build.run_image,
        env_file: args.build.env_file,
        buildpacks: args.build.buildpacks,
        publish: false,
        no_pull: args.build.no_pull,
    };
    let task = factory.build_config(build_args.into_flags())?;
    let image = task.repo_name.clone();

    let supervisor = RunSupervisor::new(docker.clone(), Reporter::clone(reporter));
    supervisor
        .run(Box::new(task), &image, args.ports, cancel_on_signals())
        .await
}
