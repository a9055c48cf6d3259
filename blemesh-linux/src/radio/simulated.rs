//! In-process broadcast medium for tests and single-host runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{max_advertisement_len, Advertisement, AdvertisingRadio, RadioError};

/// Every radio created from the same air hears every advertisement started on it,
/// including its own.
#[derive(Clone)]
pub struct SharedAir {
    tx: broadcast::Sender<Advertisement>,
}

impl SharedAir {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn radio(&self, address: u64, extended: bool) -> SimulatedRadio {
        SimulatedRadio {
            address,
            max_len: max_advertisement_len(extended),
            air: self.tx.clone(),
            powered: Arc::new(AtomicBool::new(true)),
            advertising: Mutex::new(None),
            scan: Mutex::new(None),
        }
    }
}

impl Default for SharedAir {
    fn default() -> Self {
        Self::new()
    }
}

/// Radio on a [`SharedAir`]. Starting an advertisement emits it once on the air.
pub struct SimulatedRadio {
    address: u64,
    max_len: usize,
    air: broadcast::Sender<Advertisement>,
    powered: Arc<AtomicBool>,
    advertising: Mutex<Option<Vec<u8>>>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedRadio {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_powered(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.lock().is_some()
    }

    fn powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvertisingRadio for SimulatedRadio {
    async fn is_powered(&self) -> bool {
        self.powered()
    }

    async fn start_advertising(&self, company_id: u16, data: &[u8]) -> Result<(), RadioError> {
        if !self.powered() {
            return Err(RadioError::PoweredOff);
        }
        if data.len() > self.max_len {
            return Err(RadioError::TooLarge {
                len: data.len(),
                max: self.max_len,
            });
        }
        *self.advertising.lock() = Some(data.to_vec());
        // No listeners is fine: nobody in range.
        let _ = self.air.send(Advertisement {
            address: self.address,
            company_id,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        self.advertising.lock().take();
        Ok(())
    }

    async fn start_scan(
        &self,
        sink: mpsc::UnboundedSender<Advertisement>,
    ) -> Result<(), RadioError> {
        if !self.powered() {
            return Err(RadioError::PoweredOff);
        }
        let mut rx = self.air.subscribe();
        let powered = self.powered.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(adv) => {
                        if !powered.load(Ordering::SeqCst) {
                            continue;
                        }
                        if sink.send(adv).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Scanning is lossy anyway.
                        tracing::debug!(missed = n, "simulated scan lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.scan.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) {
        if let Some(task) = self.scan.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn radios_hear_each_other_and_themselves() {
        let air = SharedAir::new();
        let a = air.radio(1, true);
        let b = air.radio(2, true);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.start_scan(tx_a).await.unwrap();
        b.start_scan(tx_b).await.unwrap();

        a.start_advertising(0x1234, &[1, 1, 1]).await.unwrap();
        assert!(a.is_advertising());
        let heard = rx_b.recv().await.unwrap();
        assert_eq!(heard.address, 1);
        assert_eq!(heard.company_id, 0x1234);
        assert_eq!(rx_a.recv().await.unwrap().data, vec![1, 1, 1]);

        a.stop_advertising().await.unwrap();
        assert!(!a.is_advertising());
        a.stop_scan().await;
        b.stop_scan().await;
    }

    #[tokio::test]
    async fn powered_off_rejects() {
        let radio = SharedAir::new().radio(1, false);
        radio.set_powered(false);
        assert!(!radio.is_powered().await);
        assert!(matches!(
            radio.start_advertising(0x1234, &[0; 3]).await,
            Err(RadioError::PoweredOff)
        ));
    }

    #[tokio::test]
    async fn legacy_size_limit() {
        let radio = SharedAir::new().radio(1, false);
        assert!(matches!(
            radio.start_advertising(0x1234, &[0; 25]).await,
            Err(RadioError::TooLarge { len: 25, max: 24 })
        ));
    }
}
