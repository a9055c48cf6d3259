// BLE mesh chat for Linux: console front end over the mesh coordinator.

use std::sync::Arc;

use anyhow::Context;
use blemesh_core::{DeviceInfo, IdentityProvider};
use blemesh_linux::host::LinuxIdentity;
use blemesh_linux::radio::{AdvertisingRadio, SharedAir};
use blemesh_linux::{config, logging, Config, Mesh, PeerChange, RadioKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("blemesh-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    logging::init(cfg.log_level.as_deref());
    let local = LinuxIdentity.collect();
    info!(version = VERSION, identity = %local, "starting");

    let rt = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    rt.block_on(run(cfg, local))
}

/// Open the configured radio. A radio that cannot be opened leaves the mesh network-only.
async fn radio_for(cfg: &Config, local: &DeviceInfo) -> Option<Arc<dyn AdvertisingRadio>> {
    match cfg.radio {
        RadioKind::None => None,
        RadioKind::Simulated => {
            // Single-process air: only loopback is observable.
            let id = local.device_id.as_str();
            let address = id
                .get(..12)
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .unwrap_or(0);
            let radio: Arc<dyn AdvertisingRadio> =
                Arc::new(SharedAir::new().radio(address, cfg.extended_advertising));
            Some(radio)
        }
        RadioKind::Bluez => open_bluez(cfg).await,
    }
}

#[cfg(feature = "bluez")]
async fn open_bluez(cfg: &Config) -> Option<Arc<dyn AdvertisingRadio>> {
    use blemesh_linux::radio::BluezRadio;

    match BluezRadio::open(cfg.adapter.as_deref(), cfg.extended_advertising).await {
        Ok(radio) => Some(Arc::new(radio)),
        Err(e) => {
            warn!("bluetooth unavailable, running network-only: {e}");
            None
        }
    }
}

#[cfg(not(feature = "bluez"))]
async fn open_bluez(_cfg: &Config) -> Option<Arc<dyn AdvertisingRadio>> {
    warn!("built without the bluez feature, running network-only");
    None
}

async fn run(cfg: Config, local: DeviceInfo) -> anyhow::Result<()> {
    let radio = radio_for(&cfg, &local).await;
    let mesh = Mesh::from_config(&cfg, local, radio);

    mesh.on_message(|m| match &m.sender {
        Some(sender) => println!("<{sender}> {}", m.text),
        None => println!("<?> {}", m.text),
    });
    mesh.on_peer(|change, info| match change {
        PeerChange::Discovered => println!("* discovered {info}"),
        PeerChange::Updated => println!("* updated {info}"),
    });

    mesh.start().await.context("starting mesh")?;
    println!("{} ready. Type to send; /peers, /announce, /quit.", mesh.local_info());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&mesh, line.trim()) {
                    break;
                }
            }
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }

    mesh.stop().await;
    Ok(())
}

/// Returns false when the console should exit. Sends run in the background.
fn handle_line(mesh: &Mesh, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/peers" => {
            let peers = mesh.peers();
            if peers.is_empty() {
                println!("no peers yet");
            }
            for p in peers {
                println!("  {} (seen {:?} ago)", p.info, p.last_seen.elapsed());
            }
        }
        "/announce" => {
            let mesh = mesh.clone();
            tokio::spawn(async move {
                if let Err(e) = mesh.announce().await {
                    warn!("announce failed: {e}");
                }
            });
        }
        text => {
            let mesh = mesh.clone();
            let text = text.to_string();
            tokio::spawn(async move {
                match mesh.send_message(&text).await {
                    Ok(report) if !report.delivered_any() => {
                        eprintln!("message {} was not sent on any transport", report.message_id)
                    }
                    Ok(_) => {}
                    Err(e) => eprintln!("send failed: {e}"),
                }
            });
        }
    }
    true
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
