//! Loam CLI - edit the local item store and sync it with a remote target

mod cli;
mod commands;
mod config_profiles;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::add::{run_add, run_attach, run_mkdir};
use crate::commands::common::{resolve_db_path, Context};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::delete::run_delete;
use crate::commands::edit::{run_edit, run_move};
use crate::commands::list::run_list;
use crate::commands::sync::{run_conflicts, run_status, run_sync};
use crate::commands::target::run_target;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(error.exit_code());
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loam=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context {
        db_path: resolve_db_path(cli.db_path),
        profile: cli.profile,
        target: cli.target,
    };
    let db_path = ctx.db_path.as_path();

    match cli.command {
        Commands::Add {
            title,
            body,
            parent,
        } => run_add(&title, &body, parent.as_deref(), db_path)?,
        Commands::Mkdir { title, parent } => run_mkdir(&title, parent.as_deref(), db_path)?,
        Commands::Attach {
            path,
            title,
            parent,
        } => run_attach(&path, title.as_deref(), parent.as_deref(), db_path)?,
        Commands::List { limit, json } => run_list(limit, json, db_path)?,
        Commands::Edit { id, title, body } => {
            run_edit(&id, title.as_deref(), body.as_deref(), db_path)?;
        }
        Commands::Move { id, to } => run_move(&id, to.as_deref(), db_path)?,
        Commands::Delete { id } => run_delete(&id, db_path)?,
        Commands::Sync => {
            run_sync(&ctx.resolve_target()?, db_path).await?;
        }
        Commands::Status { remote, json } => {
            run_status(&ctx.resolve_target()?, remote, json, db_path).await?;
        }
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, db_path)?,
        Commands::Target { command } => {
            run_target(command, &ctx.resolve_target()?, db_path).await?;
        }
        Commands::Config { command } => run_config(command, ctx.profile.as_deref())?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}
