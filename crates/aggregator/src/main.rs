//! metrics-aggregator daemon
//!
//! Discovers cluster nodes, scrapes their kubelet summaries every
//! resolution, enriches and aggregates the samples, and fans the
//! resulting batches out to the configured sinks. Exit codes: 0 on clean
//! stop, 1 on fatal configuration or startup errors, 2 on unrecoverable
//! runtime errors.

use aggregator::{api, config};
use aggregator_lib::kubernetes::{
    self, NamespaceCache, PodCache, DEFAULT_CACHE_REFRESH,
};
use aggregator_lib::manager::Manager;
use aggregator_lib::processor::{default_processors, DataProcessor};
use aggregator_lib::sink::manager::{DEFAULT_SINK_EXPORT_TIMEOUT, DEFAULT_SINK_STOP_TIMEOUT};
use aggregator_lib::sink::metric_sink::DEFAULT_RETAINED_BATCHES;
use aggregator_lib::sink::{build_sinks, DataSink, MetricSink, SinkManager};
use aggregator_lib::source::discovery::start_summary_provider;
use aggregator_lib::source::manager::{
    SourceManager, DEFAULT_MAX_PARALLELISM, DEFAULT_METRICS_SCRAPE_TIMEOUT,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    let opts = config::Opts::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting metrics-aggregator");

    if let Err(e) = opts.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if opts.max_procs > 0 {
        builder.worker_threads(opts.max_procs);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    std::process::exit(runtime.block_on(run(opts)));
}

struct App {
    manager: Manager,
    api_task: JoinHandle<Result<()>>,
}

async fn run(opts: config::Opts) -> i32 {
    let shutdown = CancellationToken::new();

    let mut app = match startup(&opts, &shutdown).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Fatal startup error");
            return 1;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received; shutting down");
            shutdown.cancel();
            if let Err(e) = app.manager.stop().await {
                error!(error = %e, "Error stopping pipeline");
            }
            app.api_task.abort();
            0
        }
        result = &mut app.api_task => {
            shutdown.cancel();
            let _ = app.manager.stop().await;
            match result {
                Ok(Ok(())) => error!("API server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task aborted"),
            }
            2
        }
    }
}

async fn startup(opts: &config::Opts, shutdown: &CancellationToken) -> Result<App> {
    let source_cfg = kubernetes::KubernetesConfig::from_uri(&opts.sources[0])?;
    let client = kubernetes::make_client(&source_cfg).await?;

    let provider =
        start_summary_provider(client.clone(), &source_cfg, shutdown.child_token()).await?;
    let source_manager = Arc::new(SourceManager::new(
        provider,
        DEFAULT_METRICS_SCRAPE_TIMEOUT,
        DEFAULT_MAX_PARALLELISM,
    ));

    let processors = build_processors(opts, client, shutdown)?;

    let metric_sink = Arc::new(MetricSink::new(DEFAULT_RETAINED_BATCHES));
    let mut sinks = build_sinks(&opts.sinks)?;
    sinks.push(metric_sink.clone() as Arc<dyn DataSink>);
    for sink in &sinks {
        info!(sink = %sink.name(), "Starting with sink");
    }
    let sink_manager = SinkManager::new(
        sinks,
        DEFAULT_SINK_EXPORT_TIMEOUT,
        DEFAULT_SINK_STOP_TIMEOUT,
    );

    let manager = Manager::new(
        source_manager,
        processors,
        sink_manager,
        opts.metric_resolution,
    );
    manager.start()?;

    let addr: SocketAddr = opts
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid listen address {:?}", opts.listen_addr()))?;
    let tls = opts.tls_cert.clone().zip(opts.tls_key.clone());
    if !opts.allowed_users.is_empty() {
        info!(
            allowed_users = %opts.allowed_users,
            "Client admission is enforced by the serving layer in front of this process"
        );
    }
    let state = Arc::new(api::AppState { metric_sink });
    let api_task = tokio::spawn(api::serve(addr, tls, state));

    Ok(App { manager, api_task })
}

fn build_processors(
    opts: &config::Opts,
    client: kube::Client,
    shutdown: &CancellationToken,
) -> Result<Vec<Box<dyn DataProcessor>>> {
    match opts.processors.as_str() {
        "kubernetes" => {
            let pod_cache = Arc::new(PodCache::new());
            let namespace_cache = Arc::new(NamespaceCache::new());
            tokio::spawn(kubernetes::run_pod_cache_refresher(
                client.clone(),
                pod_cache.clone(),
                DEFAULT_CACHE_REFRESH,
                shutdown.child_token(),
            ));
            tokio::spawn(kubernetes::run_namespace_cache_refresher(
                client,
                namespace_cache.clone(),
                DEFAULT_CACHE_REFRESH,
                shutdown.child_token(),
            ));
            Ok(default_processors(
                pod_cache,
                namespace_cache,
                opts.metric_resolution,
            ))
        }
        "" | "none" => Ok(Vec::new()),
        other => bail!("unknown processor chain {other:?} (known: kubernetes, none)"),
    }
}
