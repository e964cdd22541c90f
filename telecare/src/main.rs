use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use telecare_core::{bootstrap::load_config, logging};
use telecare_rtc::loopback::{LoopbackDevices, LoopbackNetwork, LoopbackTransport, MemoryPresenceStore};
use telecare_rtc::{
    Capabilities, CoordinatorConfig, SessionCoordinator, SessionDirectory, SessionIdentity,
};

#[derive(Parser, Debug)]
#[command(name = "telecare")]
#[command(about = "Telecare consultation session runner (in-process loopback)", long_about = None)]
struct Args {
    /// Config file path (falls back to TELECARE_CONFIG_PATH, then ./telecare.yaml)
    #[arg(long, env = "TELECARE_CONFIG")]
    config: Option<String>,

    /// Consultation (appointment) id
    #[arg(long, env = "TELECARE_SESSION", default_value = "appt-42")]
    session: String,

    /// Local participant id
    #[arg(long, env = "TELECARE_PARTICIPANT", default_value = "doc-1")]
    participant: String,

    /// Local display name
    #[arg(long, env = "TELECARE_NAME", default_value = "Dr. Silva")]
    name: String,

    /// Simulated remote participant id
    #[arg(long, env = "TELECARE_PEER", default_value = "pat-2")]
    peer: String,

    /// Simulated remote display name
    #[arg(long, env = "TELECARE_PEER_NAME", default_value = "Ana")]
    peer_name: String,

    /// Number of simulated local cameras
    #[arg(long, env = "TELECARE_CAMERAS", default_value = "2")]
    cameras: usize,

    /// Seconds to stay in the session before leaving (0 waits for Ctrl-C)
    #[arg(long, env = "TELECARE_DURATION_SECS", default_value = "5")]
    duration_secs: u64,

    /// Interval between printed session snapshots, in milliseconds
    #[arg(long, env = "TELECARE_SNAPSHOT_MS", default_value = "1000")]
    snapshot_ms: u64,
}

struct Loopback {
    network: Arc<LoopbackNetwork>,
    store: Arc<MemoryPresenceStore>,
}

impl Loopback {
    fn capabilities(&self, devices: LoopbackDevices) -> Capabilities {
        Capabilities {
            transport: Arc::new(LoopbackTransport::new(self.network.clone())),
            devices: Arc::new(devices),
            presence: self.store.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging; the guard flushes file output on exit
    let _log_guard = logging::init_logging(&config.logging)?;
    info!("Telecare session runner starting...");

    let coordinator_config = CoordinatorConfig::from(&config);
    let directory = SessionDirectory::new(Duration::from_secs(
        config.rtc.directory_cleanup_interval_secs.max(1),
    ));
    let loopback = Loopback {
        network: LoopbackNetwork::new(),
        store: Arc::new(MemoryPresenceStore::new()),
    };

    // 3. Local participant
    let local_identity = SessionIdentity::new(args.session.clone().into(), args.participant.clone().into());
    let local = directory.get_or_create(local_identity, || {
        SessionCoordinator::new(
            coordinator_config.clone(),
            loopback.capabilities(LoopbackDevices::new().cameras(args.cameras)),
        )
    });
    spawn_event_logger(&local);

    local
        .join(args.session.clone().into(), args.participant.clone().into(), &args.name)
        .await?;

    // 4. Simulated remote participant without a camera
    let peer_identity = SessionIdentity::new(args.session.clone().into(), args.peer.clone().into());
    let peer = directory.get_or_create(peer_identity, || {
        SessionCoordinator::new(
            coordinator_config.clone(),
            loopback.capabilities(LoopbackDevices::new().camera_denied()),
        )
    });
    if let Err(e) = peer
        .join(args.session.clone().into(), args.peer.clone().into(), &args.peer_name)
        .await
    {
        error!(participant_id = %args.peer, error = %e, "Simulated peer failed to join");
    }

    // 5. Exercise the controls
    if local.has_multiple_cameras().await {
        match local.switch_camera().await {
            Ok(device) => info!(device_id = %device.device_id, "Switched camera"),
            Err(e) => warn!(error = %e, "Camera switch failed"),
        }
    }
    match local.toggle_screen_share().await {
        Ok(active) => info!(active, "Screen share toggled"),
        Err(e) => warn!(error = %e, "Screen share failed"),
    }

    // 6. Print snapshots until the deadline or Ctrl-C
    let mut projection = local.projection(Duration::from_millis(args.snapshot_ms.max(10)));
    let deadline = async {
        if args.duration_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration_secs)).await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(snapshot) = projection.next() => {
                println!("{}", serde_json::to_string(&snapshot)?);
            }
            () = &mut deadline => {
                info!("Session duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    // 7. Teardown
    directory.leave_all().await;
    info!(
        remaining = directory.session_count(),
        "Telecare session runner shutting down"
    );
    Ok(())
}

fn spawn_event_logger(coordinator: &SessionCoordinator) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "Session event"),
                    Err(e) => warn!(error = %e, "Failed to encode session event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
