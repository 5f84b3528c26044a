//! `kiln delete-stack` command.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::{style, Config, Reporter};

#[derive(Args)]
pub struct DeleteStackArgs {
    /// Stack ID
    pub stack_id: String,
}

pub async fn execute(args: DeleteStackArgs, reporter: &Reporter) -> Result<()> {
    let mut config = Config::new_default()?;
    config.delete(&args.stack_id)?;
    reporter.info(format!("Stack {} deleted", style::identifier(&args.stack_id)));
    Ok(())
}
