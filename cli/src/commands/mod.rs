//! CLI command definitions and dispatch.

mod add_stack;
mod build;
mod create_builder;
mod delete_stack;
mod rebase;
mod run;
mod set_default_builder;
mod set_default_stack;
mod update_stack;
mod version;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kiln_core::error::Result;
use kiln_core::Reporter;

/// Kiln - build, run, and rebase app images from source.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Disable color output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Disable timestamps in output
    #[arg(long, global = true)]
    pub no_timestamps: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Generate app image from source code
    Build(build::BuildArgs),
    /// Build and run app image (recommended for development only)
    Run(run::RunArgs),
    /// Rebase app image with latest run image
    Rebase(rebase::RebaseArgs),
    /// Create builder image
    CreateBuilder(create_builder::CreateBuilderArgs),
    /// Add stack to list of available stacks
    AddStack(add_stack::AddStackArgs),
    /// Update stack build and run images
    UpdateStack(update_stack::UpdateStackArgs),
    /// Delete stack from list of available stacks
    DeleteStack(delete_stack::DeleteStackArgs),
    /// Set default stack used by other commands
    SetDefaultStack(set_default_stack::SetDefaultStackArgs),
    /// Set default builder used by other commands
    SetDefaultBuilder(set_default_builder::SetDefaultBuilderArgs),
    /// Show current kiln version
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, reporter: &Reporter) -> Result<()> {
    match cli.command {
        Command::Build(args) => build::execute(args, reporter).await,
        Command::Run(args) => run::execute(args, reporter).await,
        Command::Rebase(args) => rebase::execute(args, reporter).await,
        Command::CreateBuilder(args) => create_builder::execute(args, reporter).await,
        Command::AddStack(args) => add_stack::execute(args, reporter).await,
        Command::UpdateStack(args) => update_stack::execute(args, reporter).await,
        Command::DeleteStack(args) => delete_stack::execute(args, reporter).await,
        Command::SetDefaultStack(args) => set_default_stack::execute(args, reporter).await,
        Command::SetDefaultBuilder(args) => set_default_builder::execute(args, reporter).await,
        Command::Version(args) => version::execute(args, reporter).await,
    }
}

/// A token that fires when the process receives a termination signal.
/// Repeated signals coalesce; the token only ever cancels once.
pub(crate) fn cancel_on_signals() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        cancel.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
