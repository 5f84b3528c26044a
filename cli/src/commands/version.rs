//! `kiln version` command.

use clap::Args;

use kiln_core::error::Result;
use kiln_core::Reporter;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs, reporter: &Reporter) -> Result<()> {
    reporter.info(format!("kiln version {}", kiln_core::VERSION));
    Ok(())
}
