use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tokio::sync::{oneshot, Notify};
use tracing_subscriber::EnvFilter;

use leafpub::config::{Cli, Config};
use leafpub::routes;
use leafpub::state::AppState;

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stop,
    Restart,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli);
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    // The install form restarts the server in normal mode once it succeeds
    loop {
        let restart = Arc::new(Notify::new());
        let (addr, app, state) = match Config::load(&cli) {
            Ok(loaded) => {
                let addr = address(&loaded.config)?;
                if !loaded.installed {
                    tracing::info!("No config at {}, serving the installer", loaded.path.display());
                    let app = routes::install::router(loaded.config, loaded.path, restart.clone());
                    (addr, app, None)
                } else {
                    match AppState::init(loaded.config) {
                        Ok(state) => (addr, routes::app(state.clone()), Some(state)),
                        Err(e) => {
                            tracing::error!("Startup failed: {}", e);
                            (addr, routes::system::router(e.to_string()), None)
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Could not load the config file: {:#}", e);
                let mut fallback = Config::default();
                if let Some(host) = &cli.host {
                    fallback.server.host = host.clone();
                }
                if let Some(port) = cli.port {
                    fallback.server.port = port;
                }
                let detail = format!("Configuration error: {}", e);
                (address(&fallback)?, routes::system::router(detail), None)
            }
        };

        let exit = serve(addr, app, restart).await?;
        if let Some(state) = state {
            state.shutdown();
        }
        if exit == Exit::Stop {
            break;
        }
        tracing::info!("Restarting");
    }

    Ok(())
}

fn address(config: &Config) -> anyhow::Result<SocketAddr> {
    Ok(format!("{}:{}", config.server.host, config.server.port).parse()?)
}

async fn serve(addr: SocketAddr, app: Router, restart: Arc<Notify>) -> anyhow::Result<Exit> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let (tx, rx) = oneshot::channel();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let exit = tokio::select! {
                _ = tokio::signal::ctrl_c() => Exit::Stop,
                _ = restart.notified() => Exit::Restart,
            };
            let _ = tx.send(exit);
        })
        .await?;

    Ok(rx.await.unwrap_or(Exit::Stop))
}
