#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use naming::{Endpoint, Listener, NamingService};
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod config;

use config::{
    cli::{self, Command, Parser, ServiceArgs},
    trace,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.naming_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => Err(anyhow!(err).context("namingctl task failed")),
            Ok(result) => result,
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let naming = naming::connect(&config.naming_url)
        .await
        .with_context(|| format!("failed to connect to {}", config.naming_url))?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    let result = match &config.command {
        Command::Lookup { target } => lookup(&*naming, target).await,
        Command::Register { target, endpoint } => {
            register(&*naming, target, endpoint, token).await
        }
        Command::Watch { target } => watch(&*naming, target, token).await,
    };
    naming.close().await;
    debug!("exiting...");
    result
}

async fn lookup(naming: &dyn NamingService, target: &ServiceArgs) -> Result<()> {
    let info = target.subscribe_info();
    let endpoints = naming.lookup(&info).await?;
    info!(path = %info.path(), count = endpoints.len(), "lookup finished");
    for endpoint in endpoints {
        println!("{endpoint}");
    }
    Ok(())
}

async fn register(
    naming: &dyn NamingService,
    target: &ServiceArgs,
    endpoint: &Endpoint,
    token: CancellationToken,
) -> Result<()> {
    let info = target.register_info(endpoint);
    naming.register(&info).await?;
    info!(path = %info.path(), "instance announced, ctrl-c to withdraw");
    token.cancelled().await;
    naming
        .unregister(&info)
        .await
        .context("failed to withdraw instance")?;
    Ok(())
}

async fn watch(
    naming: &dyn NamingService,
    target: &ServiceArgs,
    token: CancellationToken,
) -> Result<()> {
    let info = target.subscribe_info();
    let listener: Listener = Arc::new(|added: &[Endpoint], removed: &[Endpoint]| {
        for line in render(added, removed) {
            println!("{line}");
        }
    });
    naming.subscribe(&info, listener).await?;
    info!(path = %info.path(), "watching, ctrl-c to stop");
    token.cancelled().await;
    naming.unsubscribe(&info).await?;
    Ok(())
}

/// One `+ endpoint` or `- endpoint` line per change.
fn render(added: &[Endpoint], removed: &[Endpoint]) -> Vec<String> {
    added
        .iter()
        .map(|ep| format!("+ {ep}"))
        .chain(removed.iter().map(|ep| format!("- {ep}")))
        .collect()
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
