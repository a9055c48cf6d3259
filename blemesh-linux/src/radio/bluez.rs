//! BlueZ radio: manufacturer-data advertising and LE scanning over D-Bus.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bluer::adv::{Advertisement as LeAdvertisement, AdvertisementHandle, Type};
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::{address_to_u64, max_advertisement_len, Advertisement, AdvertisingRadio, RadioError};

impl From<bluer::Error> for RadioError {
    fn from(e: bluer::Error) -> Self {
        RadioError::Rejected(e.to_string())
    }
}

pub struct BluezRadio {
    _session: Session,
    adapter: Adapter,
    max_len: usize,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl BluezRadio {
    /// Open `adapter` (e.g. "hci0"), or the default adapter when `None`.
    pub async fn open(adapter: Option<&str>, extended: bool) -> Result<Self, RadioError> {
        let session = Session::new().await?;
        let adapter = match adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!(
            adapter = adapter.name(),
            address = %adapter.address().await?,
            "bluez adapter opened"
        );
        Ok(Self {
            _session: session,
            adapter,
            max_len: max_advertisement_len(extended),
            advertisement: Mutex::new(None),
            scan: Mutex::new(None),
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }
}

/// Non-connectable broadcast carrying `data` as manufacturer data under `company_id`.
fn le_advertisement(company_id: u16, data: &[u8]) -> LeAdvertisement {
    LeAdvertisement {
        advertisement_type: Type::Broadcast,
        manufacturer_data: BTreeMap::from([(company_id, data.to_vec())]),
        ..Default::default()
    }
}

/// Push every manufacturer-data entry to `sink`. False once the sink is gone.
fn forward(
    address: u64,
    data: HashMap<u16, Vec<u8>>,
    sink: &mpsc::UnboundedSender<Advertisement>,
) -> bool {
    for (company_id, data) in data {
        let adv = Advertisement {
            address,
            company_id,
            data,
        };
        if sink.send(adv).is_err() {
            return false;
        }
    }
    true
}

async fn watch_device(device: Device, sink: mpsc::UnboundedSender<Advertisement>) {
    let address = address_to_u64(device.address().0);
    match device.manufacturer_data().await {
        Ok(Some(data)) => {
            if !forward(address, data, &sink) {
                return;
            }
        }
        Ok(None) => {}
        Err(e) => trace!(address = %device.address(), "no manufacturer data: {e}"),
    }
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            debug!(address = %device.address(), "cannot watch device: {e}");
            return;
        }
    };
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::ManufacturerData(data)) = event {
            if !forward(address, data, &sink) {
                return;
            }
        }
    }
}

/// Track discovered devices; each one gets a watcher for manufacturer-data changes.
async fn scan_loop(
    adapter: Adapter,
    discovery: impl Stream<Item = AdapterEvent>,
    sink: mpsc::UnboundedSender<Advertisement>,
) {
    tokio::pin!(discovery);
    let mut watchers: HashMap<Address, AbortHandle> = HashMap::new();
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            event = discovery.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    if watchers.contains_key(&address) {
                        continue;
                    }
                    match adapter.device(address) {
                        Ok(device) => {
                            let handle = tasks.spawn(watch_device(device, sink.clone()));
                            watchers.insert(address, handle);
                        }
                        Err(e) => debug!(%address, "cannot open device: {e}"),
                    }
                }
                Some(AdapterEvent::DeviceRemoved(address)) => {
                    if let Some(handle) = watchers.remove(&address) {
                        handle.abort();
                    }
                }
                Some(_) => {}
                None => break,
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
        if sink.is_closed() {
            break;
        }
    }
    debug!("bluez scan loop exited");
}

#[async_trait]
impl AdvertisingRadio for BluezRadio {
    async fn is_powered(&self) -> bool {
        match self.adapter.is_powered().await {
            Ok(powered) => powered,
            Err(e) => {
                warn!(adapter = self.adapter.name(), "cannot query power state: {e}");
                false
            }
        }
    }

    async fn start_advertising(&self, company_id: u16, data: &[u8]) -> Result<(), RadioError> {
        if data.len() > self.max_len {
            return Err(RadioError::TooLarge {
                len: data.len(),
                max: self.max_len,
            });
        }
        // One slot: the previous advertisement is unregistered when its handle drops.
        drop(self.advertisement.lock().take());
        let handle = self
            .adapter
            .advertise(le_advertisement(company_id, data))
            .await?;
        *self.advertisement.lock() = Some(handle);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        drop(self.advertisement.lock().take());
        Ok(())
    }

    async fn start_scan(
        &self,
        sink: mpsc::UnboundedSender<Advertisement>,
    ) -> Result<(), RadioError> {
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;
        let discovery = self.adapter.discover_devices().await?;
        let task = tokio::spawn(scan_loop(self.adapter.clone(), discovery, sink));
        if let Some(old) = self.scan.lock().replace(task) {
            old.abort();
        }
        info!(adapter = self.adapter.name(), "bluez scan started");
        Ok(())
    }

    async fn stop_scan(&self) {
        if let Some(task) = self.scan.lock().take() {
            task.abort();
        }
    }
}
