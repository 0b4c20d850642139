use burrow_server::config::ServerConfig;
use burrow_server::service::Service;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BURROW_CONFIG").ok())
        .map(PathBuf::from)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,burrow_server=debug")),
        )
        .init();

    // rustls backends: both ring (quic) and aws-lc (tls) are linked, so the
    // process default must be picked explicitly.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        error!("a rustls crypto provider was already installed");
    }

    let config = match config_path() {
        Some(path) => match ServerConfig::load(&path) {
            Ok(c) => {
                info!("config loaded from {}", path.display());
                c
            }
            Err(e) => {
                error!("failed to load config {}: {e}", path.display());
                return ExitCode::from(1);
            }
        },
        None => {
            info!("no config file given, using defaults");
            let mut config = ServerConfig::default();
            config.complete();
            config
        }
    };

    let service = match Service::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    let cancel = service.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    match service.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {e}");
            ExitCode::from(1)
        }
    }
}
