use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    BANNER,
    config::{CLOVER_CONFIG, TEMP_ADMIN_KEY},
    error::CloverError,
    router::RouterBuilder,
    state::AppState,
};

/// Initialize logging, build the state and serve until shutdown.
pub async fn run() -> Result<(), CloverError> {
    let _log_guard = init_logging();
    println!("{}", *BANNER);
    println!("{}", *CLOVER_CONFIG.load());
    // force generation (and logging) of the temporary admin key early
    let _ = TEMP_ADMIN_KEY.as_deref();

    let state = AppState::new().await?;
    let router = RouterBuilder::new(state.to_owned())
        .with_default_setup()
        .build();

    let address = CLOVER_CONFIG.load().address();
    let listener = TcpListener::bind(address).await?;
    info!("Listening on {address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    Ok(())
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let config = CLOVER_CONFIG.load();
    if config.log_to_file && !config.no_filesystem_mode {
        let appender = tracing_appender::rolling::daily(config.log_dir(), "clover.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Some(guard);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to listen for SIGTERM: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
