//! `cronrelay serve`: run the scheduling runtime until interrupted.

use clap::ArgMatches;
use cronrelay_runtime::Runtime;

pub async fn run(matches: &ArgMatches) -> i32 {
    let config = match super::load_config(matches.get_one::<String>("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let runtime = match Runtime::build(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start: {e}");
            return 1;
        }
    };

    tracing::info!(
        backend = ?runtime.config.queue.backend,
        concurrency = runtime.config.worker.concurrency,
        "cronrelay serving"
    );
    let handles = runtime.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
    runtime.stop();

    for handle in handles {
        let _ = handle.await;
    }
    0
}
