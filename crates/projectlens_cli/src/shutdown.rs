use projectlens::sync::StageScheduler;

/// Set up the Ctrl+C handler for graceful shutdown.
///
/// The first Ctrl+C disposes the scheduler so in-flight stages stop issuing
/// requests and backoff sleeps end. A second one exits immediately.
pub(crate) fn setup_shutdown_handler(scheduler: StageScheduler) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            return;
        }

        tracing::warn!("Shutdown requested, finishing current operations (Ctrl+C again to force quit)");
        scheduler.dispose();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Force quit!");
            std::process::exit(130);
        }
    });
}
