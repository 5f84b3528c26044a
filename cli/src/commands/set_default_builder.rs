//! `kiln set-default-builder` command.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{style, Config, Reporter};

#[derive(Args)]
pub struct SetDefaultBuilderArgs {
    /// Builder image name
    pub builder: String,
}

pub async fn execute(args: SetDefaultBuilderArgs, reporter: &Reporter) -> Result<()> {
    let mut config = Config::new_default()?;
    config.set_default_builder(&args.builder)?;
    reporter.info(format!(
        "Builder {} is now the default builder",
        style::identifier(&args.builder)
    ));
    Ok(())
}
