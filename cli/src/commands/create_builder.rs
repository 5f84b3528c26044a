//! `kiln create-builder` command.

use std::path::PathBuf;

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{Config, Reporter};
use kiln_runtime::builder::{BuilderFactory, CreateBuilderFlags};
use kiln_runtime::docker::DockerClient;
use kiln_runtime::image::ImageFactory;

#[derive(Args)]
pub struct CreateBuilderArgs {
    /// Builder image name
    pub image: String,

    /// Path to builder TOML file (required)
    #[arg(short = 'b', long = "builder-config", required = true)]
    pub builder_config: PathBuf,

    /// Stack ID (defaults to stack configured by `set-default-stack`)
    #[arg(short = 's', long)]
    pub stack: Option<String>,

    /// Publish to registry
    #[arg(long)]
    pub publish: bool,

    /// Skip pulling stack image before use
    #[arg(long)]
    pub no_pull: bool,
}

pub async fn execute(args: CreateBuilderArgs, reporter: &Reporter) -> Result<()> {
    let config = Config::new_default()?;
    let image_factory = ImageFactory::new(DockerClient::connect()?);
    let builder_factory = BuilderFactory {
        config: &config,
        factory: &image_factory,
        reporter,
    };

    builder_factory
        .create(&CreateBuilderFlags {
            repo_name: args.image,
            builder_config_path: args.builder_config,
            stack: args.stack.unwrap_or_default(),
            publish: args.publish,
            no_pull: args.no_pull,
        })
        .await
}
