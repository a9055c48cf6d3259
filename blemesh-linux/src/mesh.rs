//! Mesh coordinator: owns the transports, runs the event dispatcher and the startup
//! announcement, and fans sends out to every active transport.

use std::sync::Arc;
use std::time::Duration;

use blemesh_core::{DeviceInfo, MeshCore, MeshEvent, Outbound, PeerRecord, ReceivedMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::radio::AdvertisingRadio;
use crate::transport::{
    AdvertisementConfig, AdvertisementTransport, Inbound, Transport, TransportError,
    UdpConfig, UdpTransport,
};

type MessageHandler = Arc<dyn Fn(&ReceivedMessage) + Send + Sync>;
type PeerHandler = Arc<dyn Fn(PeerChange, &DeviceInfo) + Send + Sync>;

/// What happened to a peer in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    Discovered,
    Updated,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Core(#[from] blemesh_core::MeshError),
    #[error("mesh is not running")]
    NotRunning,
    #[error("mesh is already running")]
    AlreadyRunning,
    #[error("no transport could be started")]
    NoTransport,
}

/// Per-transport result of one broadcast.
#[derive(Debug)]
pub struct SendReport {
    pub message_id: u8,
    pub outcomes: Vec<(&'static str, Result<(), TransportError>)>,
}

impl SendReport {
    pub fn delivered_any(&self) -> bool {
        self.outcomes.iter().any(|(_, r)| r.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &TransportError)> {
        self.outcomes
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (*name, e)))
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    active: Vec<Arc<dyn Transport>>,
    tasks: Vec<JoinHandle<()>>,
}

enum Lifecycle {
    Stopped,
    /// Claimed by one `start` call while its transports come up.
    Starting,
    Running(Running),
}

/// Puts the mesh back to `Stopped` if `start` fails or is dropped before committing.
struct StartClaim<'a> {
    state: &'a Mutex<Lifecycle>,
    committed: bool,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            *self.state.lock() = Lifecycle::Stopped;
        }
    }
}

struct Inner {
    core: Arc<MeshCore>,
    transports: Vec<Arc<dyn Transport>>,
    discovery_delay: Duration,
    message_handlers: Mutex<Vec<MessageHandler>>,
    peer_handlers: Mutex<Vec<PeerHandler>>,
    state: Mutex<Lifecycle>,
}

/// Cheap to clone; clones share one running mesh.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<Inner>,
}

impl Mesh {
    pub fn new(
        core: Arc<MeshCore>,
        transports: Vec<Arc<dyn Transport>>,
        discovery_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core,
                transports,
                discovery_delay,
                message_handlers: Mutex::new(Vec::new()),
                peer_handlers: Mutex::new(Vec::new()),
                state: Mutex::new(Lifecycle::Stopped),
            }),
        }
    }

    /// Build transports from config. Without a radio the mesh runs network-only; a radio
    /// that is powered off fails its transport start and is skipped the same way.
    pub fn from_config(
        config: &Config,
        local: DeviceInfo,
        radio: Option<Arc<dyn AdvertisingRadio>>,
    ) -> Self {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        match radio {
            Some(radio) => {
                transports.push(Arc::new(AdvertisementTransport::new(
                    radio,
                    AdvertisementConfig::from(config),
                )));
            }
            None => info!("no radio configured; running network-only"),
        }
        if config.udp_enabled {
            transports.push(Arc::new(UdpTransport::new(UdpConfig::from(config))));
        }
        Self::new(
            Arc::new(MeshCore::new(local)),
            transports,
            config.discovery_delay(),
        )
    }

    pub fn core(&self) -> &Arc<MeshCore> {
        &self.inner.core
    }

    pub fn local_info(&self) -> &DeviceInfo {
        self.inner.core.local_info()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock(), Lifecycle::Running(_))
    }

    /// Called once per delivered message, on the dispatcher task.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.inner.message_handlers.lock().push(Arc::new(handler));
    }

    pub fn on_peer<F>(&self, handler: F)
    where
        F: Fn(PeerChange, &DeviceInfo) + Send + Sync + 'static,
    {
        self.inner.peer_handlers.lock().push(Arc::new(handler));
    }

    /// Start every transport (failures are logged and skipped), the dispatcher, and the
    /// delayed identity announcement. Concurrent calls: one wins, the rest get
    /// `AlreadyRunning` without touching any transport.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, Lifecycle::Stopped) {
                return Err(CoordinatorError::AlreadyRunning);
            }
            *state = Lifecycle::Starting;
        }
        let mut claim = StartClaim {
            state: &self.inner.state,
            committed: false,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inbound = Inbound::new(self.inner.core.clone(), events_tx);

        let mut active = Vec::new();
        for transport in &self.inner.transports {
            match transport.start(inbound.clone()).await {
                Ok(()) => active.push(transport.clone()),
                Err(e) => warn!(transport = transport.name(), "failed to start: {e}"),
            }
        }
        if active.is_empty() {
            return Err(CoordinatorError::NoTransport);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch_loop(self.inner.clone(), events_rx));
        let announcer = tokio::spawn(announce_after(
            self.inner.core.clone(),
            active.clone(),
            self.inner.discovery_delay,
            shutdown_rx,
        ));

        let names: Vec<_> = active.iter().map(|t| t.name()).collect();
        info!(
            device_id = %self.inner.core.local_id(),
            transports = ?names,
            "mesh started"
        );
        *self.inner.state.lock() = Lifecycle::Running(Running {
            shutdown,
            active,
            tasks: vec![dispatcher, announcer],
        });
        claim.committed = true;
        Ok(())
    }

    /// Stop all transports and background tasks. In-flight sends end with `Stopped`.
    /// No-op unless running.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *state = other;
                    return;
                }
            }
        };
        running.shutdown.send_replace(true);
        for transport in &running.active {
            transport.stop().await;
        }
        for task in running.tasks {
            task.abort();
        }
        info!("mesh stopped");
    }

    /// Broadcast `text` on every active transport concurrently. One transport failing
    /// does not affect the others; see the report.
    pub async fn send_message(&self, text: &str) -> Result<SendReport, CoordinatorError> {
        let active = self.active()?;
        let outbound = self.inner.core.prepare_text(text)?;
        Ok(broadcast(&active, outbound).await)
    }

    /// Broadcast the local identity now.
    pub async fn announce(&self) -> Result<SendReport, CoordinatorError> {
        let active = self.active()?;
        let outbound = self.inner.core.prepare_discovery()?;
        Ok(broadcast(&active, outbound).await)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.core.peers()
    }

    fn active(&self) -> Result<Vec<Arc<dyn Transport>>, CoordinatorError> {
        match &*self.inner.state.lock() {
            Lifecycle::Running(running) => Ok(running.active.clone()),
            _ => Err(CoordinatorError::NotRunning),
        }
    }
}

async fn broadcast(transports: &[Arc<dyn Transport>], outbound: Outbound) -> SendReport {
    let message_id = outbound.message_id;
    let outbound = Arc::new(outbound);
    let sends: Vec<_> = transports
        .iter()
        .map(|t| {
            let t = t.clone();
            let outbound = outbound.clone();
            (t.name(), tokio::spawn(async move { t.send(&outbound).await }))
        })
        .collect();

    let mut outcomes = Vec::with_capacity(sends.len());
    for (name, handle) in sends {
        let result = match handle.await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Stopped),
        };
        match &result {
            Ok(()) => debug!(transport = name, message_id, "broadcast complete"),
            Err(e) => warn!(transport = name, message_id, "broadcast failed: {e}"),
        }
        outcomes.push((name, result));
    }
    SendReport {
        message_id,
        outcomes,
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MeshEvent::Message(message) => {
                let handlers = inner.message_handlers.lock().clone();
                for handler in handlers {
                    handler(&message);
                }
            }
            MeshEvent::PeerDiscovered(info) => notify_peer(&inner, PeerChange::Discovered, &info),
            MeshEvent::PeerUpdated(info) => notify_peer(&inner, PeerChange::Updated, &info),
        }
    }
}

fn notify_peer(inner: &Inner, change: PeerChange, info: &DeviceInfo) {
    let handlers = inner.peer_handlers.lock().clone();
    for handler in handlers {
        handler(change, info);
    }
}

async fn announce_after(
    core: Arc<MeshCore>,
    transports: Vec<Arc<dyn Transport>>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => return,
    }
    match core.prepare_discovery() {
        Ok(outbound) => {
            broadcast(&transports, outbound).await;
        }
        Err(e) => warn!("cannot announce identity: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::SharedAir;
    use blemesh_core::DeviceId;

    fn info(id: &str) -> DeviceInfo {
        DeviceInfo::new(DeviceId::new(id))
    }

    fn quiet_config() -> Config {
        Config {
            udp_enabled: false,
            dwell_ms: 1,
            discovery_dwell_ms: 1,
            discovery_delay_ms: 60_000,
            ..Config::default()
        }
    }

    fn tiny_cycle() -> AdvertisementConfig {
        AdvertisementConfig {
            company_id: 0x1234,
            extended: false,
            dwell: Duration::from_millis(1),
            repetitions: 1,
            discovery_dwell: Duration::from_millis(1),
            discovery_repetitions: 1,
        }
    }

    #[tokio::test]
    async fn network_only_without_radio() {
        let mesh = Mesh::from_config(&quiet_config(), info("AAAA"), None);
        assert!(matches!(mesh.start().await, Err(CoordinatorError::NoTransport)));
        assert!(!mesh.is_running());
        // A failed start releases its claim.
        assert!(matches!(mesh.start().await, Err(CoordinatorError::NoTransport)));
    }

    #[tokio::test]
    async fn powered_off_radio_is_skipped() {
        let radio = SharedAir::new().radio(1, true);
        radio.set_powered(false);
        let mesh = Mesh::from_config(&quiet_config(), info("AAAA"), Some(Arc::new(radio)));
        assert!(matches!(mesh.start().await, Err(CoordinatorError::NoTransport)));
    }

    #[tokio::test]
    async fn send_requires_running() {
        let air = SharedAir::new();
        let radio = Arc::new(air.radio(1, true));
        let mesh = Mesh::from_config(&quiet_config(), info("AAAA"), Some(radio));
        assert!(matches!(
            mesh.send_message("hi").await,
            Err(CoordinatorError::NotRunning)
        ));

        mesh.start().await.unwrap();
        assert!(matches!(mesh.start().await, Err(CoordinatorError::AlreadyRunning)));
        let report = mesh.send_message("hi").await.unwrap();
        assert!(report.delivered_any());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].0, "advertisement");

        mesh.stop().await;
        assert!(!mesh.is_running());
        assert!(matches!(
            mesh.announce().await,
            Err(CoordinatorError::NotRunning)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_start_keeps_one_receive_path() {
        let air = SharedAir::new();
        let transport: Arc<dyn Transport> =
            Arc::new(AdvertisementTransport::new(Arc::new(air.radio(0xB, false)), tiny_cycle()));
        let receiver = Mesh::new(
            Arc::new(MeshCore::new(info("BBBB"))),
            vec![transport],
            Duration::from_secs(60),
        );
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        receiver.on_message(move |m| sink.lock().push(m.text.clone()));

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let mesh = receiver.clone();
                tokio::spawn(async move { mesh.start().await })
            })
            .collect();
        let mut won = 0;
        for start in starts {
            match start.await.unwrap() {
                Ok(()) => won += 1,
                Err(CoordinatorError::AlreadyRunning) => {}
                Err(e) => panic!("unexpected start error: {e}"),
            }
        }
        assert_eq!(won, 1);
        assert!(receiver.is_running());

        let sender = AdvertisementTransport::new(Arc::new(air.radio(0xA, false)), tiny_cycle());
        let out = MeshCore::new(info("AAAA")).prepare_text("still heard").unwrap();
        sender.send(&out).await.unwrap();

        for _ in 0..200 {
            if !inbox.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*inbox.lock(), vec!["still heard".to_string()]);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn failing_transport_does_not_block_others() {
        let air = SharedAir::new();
        let good = Arc::new(air.radio(1, false));
        let good_t: Arc<dyn Transport> = Arc::new(AdvertisementTransport::new(good, tiny_cycle()));
        let bad_radio = Arc::new(air.radio(2, false));
        let bad_t: Arc<dyn Transport> =
            Arc::new(AdvertisementTransport::new(bad_radio.clone(), tiny_cycle()));

        let mesh = Mesh::new(
            Arc::new(MeshCore::new(info("AAAA"))),
            vec![bad_t, good_t],
            Duration::from_secs(60),
        );
        mesh.start().await.unwrap();
        bad_radio.set_powered(false);

        let report = mesh.send_message("hi").await.unwrap();
        assert!(report.delivered_any());
        let failures: Vec<_> = report.failures().map(|(name, _)| name).collect();
        assert_eq!(failures, vec!["advertisement"]);
        mesh.stop().await;
    }
}
