use tracing::info;

use nanotunnel::config::{Config, Role};
use nanotunnel::{client, server};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting nanotunnel");

    let config = Config::load()?;
    info!(?config, "Configuration loaded");

    let result = match config.role {
        Role::Client => {
            tokio::select! {
                result = client::run_client(&config) => result,
                _ = wait_for_shutdown_signal() => Ok(()),
            }
        }
        Role::Server => {
            tokio::select! {
                result = server::run_server(&config) => result,
                _ = wait_for_shutdown_signal() => Ok(()),
            }
        }
    };

    info!("nanotunnel stopped");
    result
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nanotunnel=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
