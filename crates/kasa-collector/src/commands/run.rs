//! `kasa-collector run`: start the collector and wait for a signal.

use std::sync::Arc;

use tracing::{info, warn};

use kasa_config::Settings;
use kasa_core::sim::SimulatedProtocol;
use kasa_core::{Collector, DeviceProtocol, StorageSink};
use kasa_influx::InfluxSink;

use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn handle(args: RunArgs, settings: Settings) -> Result<(), CliError> {
    settings.validate()?;

    if !args.simulate {
        return Err(CliError::NoProtocolBackend);
    }
    info!("using the simulated device fleet");
    let protocol: Arc<dyn DeviceProtocol> = Arc::new(SimulatedProtocol::demo());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = %settings.storage_summary(),
        "starting kasa collector"
    );

    let influx = settings.to_influx_config()?;
    let sink: Arc<dyn StorageSink> = Arc::new(InfluxSink::new(&influx)?);

    let collector = Collector::builder(settings.to_collector_config(), protocol, sink)
        .transform(Arc::new(settings.rule_set()?))
        .build();

    let start = collector.start();
    tokio::pin!(start);
    let interrupted = tokio::select! {
        result = &mut start => {
            result?;
            false
        }
        () = shutdown_signal() => true,
    };

    if interrupted {
        // Let startup observe the cancellation and release what it opened.
        info!("shutdown requested during startup");
        let ((), result) = tokio::join!(collector.shutdown(), start);
        return result.map_err(CliError::from);
    }

    shutdown_signal().await;
    collector.shutdown().await;
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received terminate signal"),
    }
}
