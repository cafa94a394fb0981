use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tsgw::config::Config;
use tsgw::gateway::Gateway;

#[tokio::main]
async fn main() {
    // Install the rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tsgw.toml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "tsgw: failed to load configuration from {}: {:#}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    init_tracing(&config);
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel driven by SIGINT/SIGTERM
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let gateway = Gateway::new(config);
    if let Err(e) = gateway.run(shutdown_rx).await {
        error!(error = %format!("{:#}", e), "Gateway failed");
        std::process::exit(1);
    }

    info!("Shutdown complete");
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tsgw={},info", config.log_level))
    });

    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting TSGW (tailnet gateway)"
    );
    info!(
        routes = config.routes.len(),
        domain = %config.domain,
        http_port = config.http_port,
        https_port = config.https_port,
        state_dir = %config.state_dir,
        "Configuration"
    );
    info!(
        connect_timeout_secs = config.connect_timeout_secs,
        request_timeout_secs = config.request_timeout_secs,
        skip_tls_verify = config.skip_tls_verify,
        "Backend settings"
    );
    if let Ok(routes) = config.parsed_routes() {
        for route in routes {
            info!(
                service = %format!("svc:{}", route.name),
                backend = %route.backend,
                "Configured route"
            );
        }
    }
}
