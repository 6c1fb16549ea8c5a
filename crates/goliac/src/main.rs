#![warn(clippy::all, clippy::dbg_macro)]

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use crate::{
    github::{GithubClient, GithubHost},
    orchestrator::Orchestrator,
};

mod config;
mod engine;
mod entity;
mod errors;
mod github;
mod gitrepo;
mod orchestrator;
mod remote;
mod status;
mod sync;
mod usersync;
mod worktree;

/// Continuously reconciles a GitHub organization against its teams
/// repository.
#[derive(Parser)]
#[command(about, version)]
struct App {
    /// The GitHub organization to reconcile.
    #[arg(long, env = "GOLIAC_ORGANIZATION")]
    organization: String,

    /// The token used for API calls and git pushes.
    ///
    /// App-JWT minting and installation-token exchange happen outside
    /// this process; hand it a token that is already valid.
    #[arg(long, env = "GOLIAC_GITHUB_TOKEN", hide_env_values = true)]
    github_token: String,

    /// Slug of the GitHub App the token belongs to.
    #[arg(long, env = "GOLIAC_GITHUB_APP_SLUG", default_value = "goliac")]
    github_app_slug: String,

    /// The GitHub server hostname. Defaults to github.com.
    #[arg(long, env = "GH_HOST", default_value_t)]
    gh_hostname: GithubHost,

    /// HTTPS URL of the teams repository.
    #[arg(long, env = "GOLIAC_SERVER_GIT_REPOSITORY")]
    teams_repository: String,

    /// Branch of the teams repository holding the desired state.
    #[arg(long, env = "GOLIAC_SERVER_GIT_BRANCH", default_value = "main")]
    branch: String,

    /// Seconds between reconciliation cycles.
    #[arg(long, env = "GOLIAC_SERVER_APPLY_INTERVAL", default_value_t = 600)]
    apply_interval: u64,

    /// Seconds before remote snapshot caches expire.
    #[arg(long, env = "GOLIAC_CACHE_TTL", default_value_t = 86400)]
    cache_ttl: u64,

    /// Plan and log mutations without dispatching any of them.
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit instead of looping.
    #[arg(long)]
    once: bool,

    /// Ignore the per-cycle changeset ceiling for this run.
    #[arg(long)]
    force: bool,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<InfoLevel>,
}

async fn run(app: App) -> anyhow::Result<()> {
    let transport = GithubClient::new(
        &app.gh_hostname,
        &app.github_token,
        &app.github_app_slug,
    )?;

    let mut orchestrator = Orchestrator::new(
        Arc::new(transport),
        app.organization,
        app.teams_repository,
        app.branch,
        Duration::from_secs(app.apply_interval),
        Duration::from_secs(app.cache_ttl),
        app.dry_run,
        app.force,
    );

    if app.once {
        orchestrator.run_once().await;
        if let Some(error) = &orchestrator.status().last_sync_error {
            anyhow::bail!("{error}");
        }
        return Ok(());
    }

    orchestrator.serve().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let app = App::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(app.verbose.tracing_level_filter().into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time())
        .with(filter)
        .init();

    match run(app).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
