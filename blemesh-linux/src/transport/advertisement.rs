//! Wireless advertisement transport: duty-cycled fragment broadcast, event-driven receive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blemesh_core::{
    encode_packet, Outbound, OutboundKind, SenderAddress, EXTENDED_FRAGMENT_SIZE,
    LEGACY_FRAGMENT_SIZE,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Inbound, Transport, TransportError};
use crate::config::Config;
use crate::radio::{AdvertisingRadio, RadioError};

#[derive(Debug, Clone)]
pub struct AdvertisementConfig {
    pub company_id: u16,
    pub extended: bool,
    pub dwell: Duration,
    pub repetitions: u32,
    pub discovery_dwell: Duration,
    pub discovery_repetitions: u32,
}

impl AdvertisementConfig {
    pub fn fragment_size(&self) -> usize {
        if self.extended {
            EXTENDED_FRAGMENT_SIZE
        } else {
            LEGACY_FRAGMENT_SIZE
        }
    }

    fn cycle_for(&self, kind: OutboundKind) -> (Duration, u32) {
        match kind {
            OutboundKind::Text => (self.dwell, self.repetitions),
            OutboundKind::Discovery => (self.discovery_dwell, self.discovery_repetitions),
        }
    }
}

impl From<&Config> for AdvertisementConfig {
    fn from(c: &Config) -> Self {
        Self {
            company_id: c.company_id,
            extended: c.extended_advertising,
            dwell: c.dwell(),
            repetitions: c.repetitions,
            discovery_dwell: c.discovery_dwell(),
            discovery_repetitions: c.discovery_repetitions,
        }
    }
}

/// Each fragment holds the single advertisement slot for one dwell interval; the whole
/// sequence is replayed `repetitions` times. Sends are serialised on the slot.
pub struct AdvertisementTransport {
    radio: Arc<dyn AdvertisingRadio>,
    config: AdvertisementConfig,
    slot: tokio::sync::Mutex<()>,
    stop_tx: watch::Sender<bool>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdvertisementTransport {
    pub fn new(radio: Arc<dyn AdvertisingRadio>, config: AdvertisementConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            radio,
            config,
            slot: tokio::sync::Mutex::new(()),
            stop_tx,
            scan_task: Mutex::new(None),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Hold for `d`. Returns true if stop was requested meanwhile.
    async fn hold(&self, d: Duration) -> bool {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => false,
            _ = stop.changed() => true,
        }
    }
}

#[async_trait]
impl Transport for AdvertisementTransport {
    fn name(&self) -> &'static str {
        "advertisement"
    }

    async fn start(&self, inbound: Inbound) -> Result<(), TransportError> {
        if !self.radio.is_powered().await {
            return Err(RadioError::PoweredOff.into());
        }
        self.stop_tx.send_replace(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.radio.start_scan(tx).await?;

        let company_id = self.config.company_id;
        let mut stop = self.stop_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    adv = rx.recv() => {
                        let Some(adv) = adv else { break };
                        if adv.company_id != company_id {
                            continue;
                        }
                        trace!(len = adv.data.len(), "advertisement received");
                        inbound.frame(&adv.data, SenderAddress::Radio(adv.address));
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("advertisement receive loop exited");
        });
        if let Some(old) = self.scan_task.lock().replace(task) {
            old.abort();
        }
        info!(
            company_id = format_args!("{:#06X}", company_id),
            fragment_size = self.config.fragment_size(),
            "advertisement transport started"
        );
        Ok(())
    }

    async fn send(&self, outbound: &Outbound) -> Result<(), TransportError> {
        let fragments = outbound.fragments(self.config.fragment_size())?;
        let frames: Vec<Vec<u8>> = fragments.iter().map(encode_packet).collect();
        let (dwell, repetitions) = self.config.cycle_for(outbound.kind);

        let _slot = self.slot.lock().await;
        debug!(
            message_id = outbound.message_id,
            fragments = frames.len(),
            repetitions,
            "advertising message"
        );
        for cycle in 0..repetitions {
            trace!(message_id = outbound.message_id, cycle = cycle + 1, "advertising cycle");
            for frame in &frames {
                if self.is_stopped() {
                    return Err(TransportError::Stopped);
                }
                self.radio
                    .start_advertising(self.config.company_id, frame)
                    .await?;
                let stopped = self.hold(dwell).await;
                if let Err(e) = self.radio.stop_advertising().await {
                    warn!("failed to withdraw advertisement: {e}");
                }
                if stopped {
                    return Err(TransportError::Stopped);
                }
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.radio.stop_advertising().await {
            warn!("failed to withdraw advertisement: {e}");
        }
        self.radio.stop_scan().await;
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        debug!("advertisement transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{Advertisement, SharedAir};
    use blemesh_core::{decode_packet, DeviceId, DeviceInfo, MeshCore};

    fn config(dwell_ms: u64, repetitions: u32) -> AdvertisementConfig {
        AdvertisementConfig {
            company_id: 0x1234,
            extended: false,
            dwell: Duration::from_millis(dwell_ms),
            repetitions,
            discovery_dwell: Duration::from_millis(dwell_ms),
            discovery_repetitions: repetitions + 2,
        }
    }

    fn core(id: &str) -> Arc<MeshCore> {
        Arc::new(MeshCore::new(DeviceInfo::new(DeviceId::new(id))))
    }

    #[tokio::test]
    async fn replays_every_fragment_each_cycle() {
        let air = SharedAir::new();
        let listener = air.radio(9, false);
        let (tx, mut rx) = mpsc::unbounded_channel::<Advertisement>();
        listener.start_scan(tx).await.unwrap();

        let radio = Arc::new(air.radio(1, false));
        let transport = AdvertisementTransport::new(radio.clone(), config(1, 3));
        let out = core("AAAA").prepare_text("a message long enough for several fragments").unwrap();
        let expected = out.fragments(LEGACY_FRAGMENT_SIZE).unwrap().len();
        assert!(expected > 1);

        transport.send(&out).await.unwrap();
        assert!(!radio.is_advertising());

        let mut seen = Vec::new();
        while let Ok(adv) = rx.try_recv() {
            seen.push(decode_packet(&adv.data).unwrap());
        }
        assert_eq!(seen.len(), expected * 3);
        assert_eq!(seen[0].index, 1);
        assert_eq!(seen[expected].index, 1);
        assert!(seen.iter().all(|f| f.message_id == out.message_id));
    }

    #[tokio::test]
    async fn discovery_uses_its_own_cycle() {
        let air = SharedAir::new();
        let listener = air.radio(9, false);
        let (tx, mut rx) = mpsc::unbounded_channel::<Advertisement>();
        listener.start_scan(tx).await.unwrap();

        let transport = AdvertisementTransport::new(Arc::new(air.radio(1, false)), config(1, 1));
        let out = core("AAAA").prepare_discovery().unwrap();
        let per_cycle = out.fragments(LEGACY_FRAGMENT_SIZE).unwrap().len();
        transport.send(&out).await.unwrap();

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, per_cycle * 3);
    }

    #[tokio::test]
    async fn receive_filters_company_and_reassembles() {
        let air = SharedAir::new();
        let receiver_core = core("BBBB");
        let transport = AdvertisementTransport::new(Arc::new(air.radio(2, false)), config(1, 1));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        transport
            .start(Inbound::new(receiver_core.clone(), events_tx))
            .await
            .unwrap();

        let foreign = air.radio(3, false);
        foreign.start_advertising(0x4C00, &[1, 1, 1, 0]).await.unwrap();

        let sender = AdvertisementTransport::new(Arc::new(air.radio(1, false)), config(1, 2));
        let out = core("AAAA").prepare_text("hi").unwrap();
        sender.send(&out).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, blemesh_core::MeshEvent::Message(ref m) if m.text == "hi"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events_rx.try_recv().is_err());
        transport.stop().await;
    }

    #[tokio::test]
    async fn too_large_for_legacy_is_rejected_before_air() {
        let radio = Arc::new(SharedAir::new().radio(1, false));
        let transport = AdvertisementTransport::new(radio.clone(), config(1, 1));
        let out = core("AAAA").prepare_text(&"x".repeat(6000)).unwrap();
        assert!(matches!(
            transport.send(&out).await,
            Err(TransportError::Fragment(_))
        ));
        assert!(!radio.is_advertising());
    }

    #[tokio::test]
    async fn radio_failure_surfaces() {
        let radio = Arc::new(SharedAir::new().radio(1, false));
        radio.set_powered(false);
        let transport = AdvertisementTransport::new(radio, config(1, 1));
        let out = core("AAAA").prepare_text("hi").unwrap();
        assert!(matches!(
            transport.send(&out).await,
            Err(TransportError::Radio(RadioError::PoweredOff))
        ));
    }

    #[tokio::test]
    async fn start_refuses_unpowered_radio() {
        let radio = Arc::new(SharedAir::new().radio(1, false));
        radio.set_powered(false);
        let transport = AdvertisementTransport::new(radio, config(1, 1));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let started = transport.start(Inbound::new(core("AAAA"), events_tx)).await;
        assert!(matches!(
            started,
            Err(TransportError::Radio(RadioError::PoweredOff))
        ));
    }

    #[tokio::test]
    async fn stop_interrupts_send_and_withdraws() {
        let radio = Arc::new(SharedAir::new().radio(1, false));
        let transport = Arc::new(AdvertisementTransport::new(radio.clone(), config(10_000, 3)));
        let out = core("AAAA").prepare_text("hi").unwrap();

        let sending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send(&out).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(radio.is_advertising());
        transport.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(2), sending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Stopped)));
        assert!(!radio.is_advertising());
    }
}
