use std::sync::Arc;

use mailprobe::api::{spawn_api_server, ApiState};
use mailprobe::{Config, ProbeMetrics, ProbeSupervisor, ResourceStatus, ResourceWatcher};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

fn init(enhanced_logging: bool) {
    let level = if enhanced_logging {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = filter::Targets::new().with_targets(vec![("mailprobe", level), ("prober", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init(config.enhanced_logging);
    trace!("loaded config: {config:?}");

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(ProbeMetrics::new());
    let probes = mailprobe::probes::build_probes(&config)?;

    info!(
        target = %config.server_hostname,
        probes = probes.len(),
        interval_secs = config.collection_interval.as_secs(),
        "starting email server prober"
    );

    let supervisor = Arc::new(ProbeSupervisor::spawn(probes, &config, metrics.clone()));
    let cancel = supervisor.cancellation_token();

    let resources = Arc::new(ResourceStatus::new());
    let watcher = config.resource_check_enabled.then(|| {
        ResourceWatcher::spawn(&config, metrics.clone(), resources.clone(), cancel.clone())
    });

    let state = ApiState::new(supervisor.clone(), metrics, resources);
    let (_, server) = spawn_api_server(config.metrics_port, state, cancel.clone()).await?;

    info!("all workers started, press Ctrl+C to shutdown gracefully");
    shutdown_signal().await;

    info!("shutdown signal received, stopping workers");
    supervisor.shutdown().await;

    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }

    // The server drains in-flight requests once the token is cancelled
    let _ = server.await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("unable to listen for shutdown signal: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                error!("unable to listen for SIGTERM, falling back to Ctrl-C only: {err}");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
