use kiln_buildkit::{ArchiveContextFetcher, BuildRequest, DockerAuthProvider, RemoteClient};
use kiln_cli::cli::{CacheArgs, CliArgs, Commands, PlanArgs, PublishArgs};
use kiln_cli::dry_run::DryRunSolver;
use kiln_cli::{init_logging, resolve_level, NAME, VERSION};
use kiln_core::KilnConfig;
use kiln_messaging::{FileObjectStore, OutboxBroker, StatusMessenger};

use anyhow::{Context, Result};
use clap::Parser;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    init_logging(
        resolve_level(
            args.log_level.as_deref(),
            args.verbose,
            args.quiet,
            &config.logging.level,
        ),
        config.logging.json,
    );

    debug!("{} v{} starting", NAME, VERSION);
    debug!("Arguments: {:?}", args);
    debug!("{}", config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let result = match &args.command {
        Commands::Plan(plan_args) => handle_plan(plan_args, &config, &args, cancel).await,
        Commands::Cache(cache_args) => handle_cache(cache_args, &config, &args, cancel).await,
        Commands::Publish(publish_args) => handle_publish(publish_args, &config).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load_config(args: &CliArgs) -> Result<KilnConfig> {
    let mut config = match &args.config {
        Some(path) => KilnConfig::load_from_file(path)?,
        None => KilnConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn dry_run_client(config: &KilnConfig, args: &CliArgs, cancel: CancellationToken) -> RemoteClient {
    RemoteClient::new(
        Arc::new(DryRunSolver::stdout()),
        Arc::new(ArchiveContextFetcher::new()),
    )
    .with_credentials(Arc::new(DockerAuthProvider::new(
        config.buildkit.auth_config_dir.clone(),
    )))
    .with_cancellation(cancel)
    .with_progress(args.quiet, args.verbose)
}

async fn handle_plan(
    plan_args: &PlanArgs,
    config: &KilnConfig,
    args: &CliArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let mut request = BuildRequest::new(plan_args.context.clone(), plan_args.images.clone())
        .with_build_args(plan_args.build_args.clone());
    if plan_args.no_cache_export {
        request = request.without_cache_export();
    }
    if plan_args.no_cache_import {
        request = request.without_cache_import();
    }

    info!("Planning build against {}", config.buildkit.addr);
    dry_run_client(config, args, cancel)
        .build(&request)
        .await
        .context("build plan failed")?;
    Ok(())
}

async fn handle_cache(
    cache_args: &CacheArgs,
    config: &KilnConfig,
    args: &CliArgs,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Planning cache of {} against {}", cache_args.image, config.buildkit.addr);
    dry_run_client(config, args, cancel)
        .cache(&cache_args.image)
        .await
        .context("cache plan failed")?;
    Ok(())
}

async fn handle_publish(publish_args: &PublishArgs, config: &KilnConfig) -> Result<()> {
    let store = Arc::new(FileObjectStore::new(&publish_args.object));
    let mut object = store
        .load()
        .await
        .with_context(|| format!("failed to load {}", publish_args.object.display()))?;

    let pending = object
        .status
        .transitions
        .iter()
        .filter(|t| !t.processed)
        .count();
    info!("{} has {} pending transition(s)", object.object_key(), pending);

    let messenger = StatusMessenger::new(config.messaging.clone(), Arc::new(OutboxBroker), store);
    messenger
        .reconcile(&mut object)
        .await
        .with_context(|| format!("failed to publish transitions of {}", object.object_key()))?;

    info!("Transitions of {} are up to date", object.object_key());
    Ok(())
}
