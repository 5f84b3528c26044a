//! `kiln rebase` command.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{Config, Reporter};
use kiln_runtime::docker::DockerClient;
use kiln_runtime::image::ImageFactory;
use kiln_runtime::rebase::{RebaseFlags, Rebaser};

#[derive(Args)]
pub struct RebaseArgs {
    /// App image name
    pub image: String,

    /// Publish to registry
    #[arg(long)]
    pub publish: bool,

    /// Skip pulling images before use
    #[arg(long)]
    pub no_pull: bool,
}

pub async fn execute(args: RebaseArgs, reporter: &Reporter) -> Result<()> {
    let config = Config::new_default()?;
    let factory = ImageFactory::new(DockerClient::connect()?);
    let rebaser = Rebaser {
        config: &config,
        factory: &factory,
        reporter,
    };

    let flags = RebaseFlags {
        repo_name: args.image,
        publish: args.publish,
        no_pull: args.no_pull,
    };
    let operation = rebaser.prepare(&flags).await?;
    rebaser.rebase(operation).await
}
