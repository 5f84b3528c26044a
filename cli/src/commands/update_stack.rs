//! `kiln update-stack` command.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{style, Config, Reporter, Stack};

#[derive(Args)]
pub struct UpdateStackArgs {
    /// Stack ID
    pub stack_id: String,

    /// Build image to associate with stack (required)
    #[arg(short = 'b', long = "build-image", required = true)]
    pub build_image: String,

    /// Run image to associate with stack (required),
    /// repeat for each run image, or supply once by comma-separated list
    #[arg(short = 'r', long = "run-image", required = true, value_delimiter = ',')]
    pub run_images: Vec<String>,
}

pub async fn execute(args: UpdateStackArgs, reporter: &Reporter) -> Result<()> {
    let mut config = Config::new_default()?;
    config.update(
        &args.stack_id,
        Stack {
            id: args.stack_id.clone(),
            build_image: args.build_image,
            build_images: None,
            run_images: args.run_images,
        },
    )?;
    reporter.info(format!("Stack {} updated", style::identifier(&args.stack_id)));
    Ok(())
}
