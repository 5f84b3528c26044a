//! `kiln set-default-stack` command.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{style, Config, Reporter};

#[derive(Args)]
pub struct SetDefaultStackArgs {
    /// Stack ID
    pub stack_id: String,
}

pub async fn execute(args: SetDefaultStackArgs, reporter: &Reporter) -> Result<()> {
    let mut config = Config::new_default()?;
    config.set_default_stack(&args.stack_id)?;
    reporter.info(format!(
        "Stack {} is now the default stack",
        style::identifier(&args.stack_id)
    ));
    Ok(())
}
