use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use relay_server::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            e.print().ok();
            return ExitCode::from(1);
        }
    };
    let listen_port = config.listen_port;
    let base_domain = config.base_domain.clone();

    let state = relay_server::build_state(config).await;
    let app = relay_server::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listener");
            return ExitCode::from(2);
        }
    };

    info!(%addr, %base_domain, "relay server listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(relay_server::shutdown_signal())
        .await;

    if let Err(e) = result {
        error!(error = %e, "server exited with error");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
