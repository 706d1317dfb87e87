use std::process::ExitCode;

use bankmerge::{api, settings::Settings, startup};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge every entity on a fixed interval until interrupted
    Run,
    /// Merge once and exit, non-zero if any entity failed
    Once {
        /// only merge this entity
        #[arg(short, long)]
        entity: Option<String>,
    },
    /// Serve the CRUD API
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = match Settings::new(&args.config) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot load config {}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };
    let result = match args.command {
        Command::Run => run(settings).await,
        Command::Once { entity } => once(settings, entity).await,
        Command::Serve => serve(settings).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let interval = settings.interval();
    let mut runners = JoinSet::new();
    for (name, cfg) in &settings.entities {
        let mut runner = startup::runner(name, cfg, &settings).await?;
        runners.spawn(async move { runner.start(interval).await });
    }
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping runners"),
        _ = async { while runners.join_next().await.is_some() {} } => {}
    }
    runners.shutdown().await;
    Ok(())
}

async fn once(settings: Settings, only: Option<String>) -> anyhow::Result<()> {
    if let Some(name) = &only {
        if !settings.entities.contains_key(name) {
            anyhow::bail!("unknown entity {name}");
        }
    }
    let mut failed = Vec::new();
    for (name, cfg) in &settings.entities {
        if only.as_ref().is_some_and(|o| o != name) {
            continue;
        }
        let outcome = match startup::runner(name, cfg, &settings).await {
            Ok(mut runner) => runner.run_once().await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            error!(entity = %name, "merge failed: {e:#}");
            failed.push(name.clone());
        }
    }
    if !failed.is_empty() {
        failed.sort();
        anyhow::bail!("merge failed for {}", failed.join(", "));
    }
    Ok(())
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let state = startup::api_state(&settings).await?;
    api::serve(&settings.listen_addr(), state).await
}
