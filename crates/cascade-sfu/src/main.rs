//! Cascade SFU entry point.
//!
//! Loads configuration, wires the Matrix signaling shim to the router, and
//! runs until SIGINT/SIGTERM or a fatal signaling failure. Exit status is
//! zero on a signalled shutdown, non-zero on fatal initialization errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cascade_sfu::config::SfuConfig;
use cascade_sfu::peer::factory::WebRtcPeerFactory;
use cascade_sfu::routing::Router;
use cascade_sfu::signaling::client::MatrixClient;
use cascade_sfu::signaling::{SignalingTransport, SignalingWorker};

/// Queue between the sync stream and the router.
const INBOUND_SIGNAL_QUEUE_DEPTH: usize = 256;

#[derive(Parser)]
#[command(name = "cascade-sfu", about = "Selective forwarding unit for Matrix conference calls")]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Write a CPU profile to this file (accepted for compatibility).
    #[arg(long = "cpuProfile")]
    cpu_profile: Option<PathBuf>,

    /// Write a memory profile to this file (accepted for compatibility).
    #[arg(long = "memProfile")]
    mem_profile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = SfuConfig::load(&args.config)?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.cpu_profile.is_some() || config.cpu_profile_path.is_some() {
        warn!("CPU profiling requested but not supported by this build; ignoring");
    }
    if args.mem_profile.is_some() || config.mem_profile_path.is_some() {
        warn!("memory profiling requested but not supported by this build; ignoring");
    }

    info!(
        homeserver = %config.matrix.homeserver_url,
        user_id = %config.matrix.user_id,
        device_id = %config.matrix.device_id,
        "starting SFU"
    );

    let factory = Arc::new(WebRtcPeerFactory::new(&config.webrtc)?);
    let client = Arc::new(MatrixClient::new(&config.matrix)?);

    let cancel = CancellationToken::new();

    // A fresh session token per process; clients use it to tell a restarted
    // SFU from the one they were talking to.
    let session_id = uuid::Uuid::new_v4().to_string();

    let (signaling, signaling_task) = SignalingWorker::spawn(
        Arc::clone(&client) as Arc<dyn SignalingTransport>,
        config.matrix.device_id.clone(),
        session_id,
        cancel.child_token(),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_SIGNAL_QUEUE_DEPTH);

    let router_task = Router::spawn(
        config.conference.clone(),
        config.matrix.user_id.clone(),
        config.matrix.device_id.clone(),
        factory,
        signaling,
        inbound_rx,
        cancel.child_token(),
    );

    let sync_cancel = cancel.child_token();
    let sync_client = Arc::clone(&client);
    let mut sync_task =
        tokio::spawn(async move { sync_client.run_sync(inbound_tx, sync_cancel).await });

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = &mut sync_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "matrix sync failed"),
                Ok(Ok(())) => info!("matrix sync ended"),
                Err(e) => error!(error = %e, "matrix sync task failed"),
            }
        }
    }

    // Graceful teardown: conferences drain, hangups go out, adapters close.
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), router_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), signaling_task).await;
    sync_task.abort();

    info!("SFU stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
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

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
}
