//! PAPI server entrypoint
//!
//! Loads the environment and the main configuration, wires the subsystems
//! into one `AppState`, starts the background tasks (cluster stats poller,
//! hourly catalog refresh) and serves the API.
//!
//! Exit codes: 0 on normal shutdown, 1 on fatal startup error (bad or
//! missing configuration), 2 on a bad environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use papi_api::{build_router, AppState};
use papi_common::config::{EnvConfig, MainConfig, WorkloadAssets};
use papi_common::telemetry::{init_telemetry, TelemetryConfig};

/// Interval of the periodic catalog refresh
const CATALOG_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Platform API server
#[derive(Debug, Parser)]
#[command(name = "papi", about = "Platform API for the AI compute cluster")]
struct Args {
    /// Configuration directory (main.yaml plus workload assets)
    #[arg(long, env = "PAPI_CONF_DIR", default_value = "/etc/papi")]
    conf_dir: PathBuf,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// TLS certificate file (PEM); plain HTTP when absent
    #[arg(long, requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long, requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // The environment is read before telemetry so a broken variable is
    // reported even if logging cannot start
    let env = match EnvConfig::from_env() {
        Ok(env) => env,
        Err(err) => {
            eprintln!("bad environment: {err}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init_telemetry(TelemetryConfig {
        service_name: "papi-server".to_string(),
        ..Default::default()
    }) {
        eprintln!("telemetry init failed: {err}");
        return ExitCode::from(1);
    }

    match run(args, env).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

async fn run(args: Args, env: EnvConfig) -> Result<(), ExitCode> {
    if let Err(err) = env.check_secrets() {
        error!(error = %err, "missing required secret");
        return Err(ExitCode::from(1));
    }

    let config = MainConfig::load(&args.conf_dir.join("main.yaml")).map_err(|err| {
        error!(error = %err, "cannot load main configuration");
        ExitCode::from(1)
    })?;

    let assets = WorkloadAssets::load(&args.conf_dir).map_err(|err| {
        error!(error = %err, "cannot load workload assets");
        ExitCode::from(1)
    })?;

    let state = AppState::new(config, env, assets).map_err(|err| {
        error!(error = %err, "cannot build application state");
        ExitCode::from(1)
    })?;

    spawn_background_tasks(&state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|err| {
            error!(error = %err, "invalid bind address");
            ExitCode::from(1)
        })?;

    let app = build_router(state);

    info!(addr = %addr, "starting PAPI server");

    let served = match (args.ssl_cert, args.ssl_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|err| {
                    error!(error = %err, "cannot load TLS material");
                    ExitCode::from(1)
                })?;
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
                error!(error = %err, "cannot bind listener");
                ExitCode::from(1)
            })?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        }
    };

    served.map_err(|err| {
        error!(error = %err, "server error");
        ExitCode::from(1)
    })?;

    info!("shutdown complete");
    Ok(())
}

/// Stats poller and periodic catalog refresh
fn spawn_background_tasks(state: &AppState) {
    // Prime the stats snapshot before the first request arrives, then keep
    // it fresh every 30 seconds
    {
        let holder = state.cluster_stats.clone();
        let nomad = state.nomad.clone();
        let config = state.config.clone();
        tokio::spawn(async move {
            match papi_api::stats::cluster::poll_once(&nomad, &config).await {
                Ok(stats) => holder.set(stats).await,
                Err(err) => warn!(error = %err, "initial cluster stats poll failed"),
            }
            papi_api::stats::cluster::run_poller(holder, nomad, config).await;
        });
    }

    // Hourly catalog refresh keeps the caches warm without user-visible
    // upstream latency spikes
    {
        let modules = state.modules.clone();
        let tools = state.tools.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CATALOG_REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                modules.refresh(None).await;
                tools.refresh(None).await;
                if let Err(err) = modules.list().await {
                    warn!(error = %err, "periodic catalog refresh failed");
                }
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}
