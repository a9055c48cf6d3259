//! Network broadcast transport: whole ciphertext in one datagram, no fragmentation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blemesh_core::{Outbound, SenderAddress};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Inbound, Transport, TransportError};
use crate::config::Config;

const RECV_BUFFER: usize = 65536;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local address to listen on; all interfaces by default.
    pub bind: SocketAddr,
    /// Where sends go; the limited broadcast address by default.
    pub target: SocketAddr,
}

impl UdpConfig {
    pub fn broadcast(port: u16, broadcast_addr: Ipv4Addr) -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            target: SocketAddr::new(IpAddr::V4(broadcast_addr), port),
        }
    }
}

impl From<&Config> for UdpConfig {
    fn from(c: &Config) -> Self {
        Self::broadcast(c.udp_port, c.broadcast_addr)
    }
}

pub struct UdpTransport {
    config: UdpConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    stop_tx: watch::Sender<bool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            socket: Mutex::new(None),
            stop_tx,
            recv_task: Mutex::new(None),
        }
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }
}

/// Address reuse lets several instances on one host share the broadcast port.
fn make_broadcast_socket(bind: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

async fn recv_loop(socket: Arc<UdpSocket>, inbound: Inbound, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, from)) => {
                    trace!(%from, len = n, "datagram received");
                    inbound.datagram(&buf[..n], SenderAddress::Network(from.ip()));
                }
                Err(e) => {
                    warn!("datagram receive failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                        _ = stop.changed() => break,
                    }
                }
            },
            _ = stop.changed() => break,
        }
    }
    debug!("datagram receive loop exited");
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn start(&self, inbound: Inbound) -> Result<(), TransportError> {
        let socket = Arc::new(make_broadcast_socket(self.config.bind)?);
        self.stop_tx.send_replace(false);
        let stop = self.stop_tx.subscribe();
        let task = tokio::spawn(recv_loop(socket.clone(), inbound, stop));
        info!(
            bind = %socket.local_addr()?,
            target = %self.config.target,
            "udp transport started"
        );
        *self.socket.lock() = Some(socket);
        if let Some(old) = self.recv_task.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn send(&self, outbound: &Outbound) -> Result<(), TransportError> {
        if *self.stop_tx.borrow() {
            return Err(TransportError::Stopped);
        }
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or(TransportError::NotStarted)?;
        let n = socket
            .send_to(&outbound.ciphertext, self.config.target)
            .await?;
        debug!(
            message_id = outbound.message_id,
            len = n,
            target = %self.config.target,
            "datagram sent"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
        self.socket.lock().take();
        debug!("udp transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blemesh_core::{DeviceId, DeviceInfo, MeshCore, MeshEvent};
    use tokio::sync::mpsc;

    fn loopback() -> UdpConfig {
        let any = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        UdpConfig {
            bind: any,
            target: any,
        }
    }

    fn core(id: &str) -> Arc<MeshCore> {
        Arc::new(MeshCore::new(DeviceInfo::new(DeviceId::new(id))))
    }

    #[test]
    fn default_targets_broadcast() {
        let c = UdpConfig::broadcast(12345, Ipv4Addr::BROADCAST);
        assert_eq!(c.target, "255.255.255.255:12345".parse().unwrap());
        assert_eq!(c.bind, "0.0.0.0:12345".parse().unwrap());
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let t = UdpTransport::new(loopback());
        let out = core("AAAA").prepare_text("hi").unwrap();
        assert!(matches!(t.send(&out).await, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn delivers_whole_message_in_one_datagram() {
        let receiver = UdpTransport::new(loopback());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        receiver
            .start(Inbound::new(core("BBBB"), events_tx))
            .await
            .unwrap();
        let target = receiver.local_addr().unwrap();

        let sender = UdpTransport::new(UdpConfig {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            target,
        });
        let (sink, _unused) = mpsc::unbounded_channel();
        sender.start(Inbound::new(core("AAAA"), sink)).await.unwrap();

        let long = "y".repeat(1000);
        let out = core("AAAA").prepare_text(&long).unwrap();
        sender.send(&out).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            MeshEvent::Message(m) => {
                assert_eq!(m.text, long);
                assert_eq!(m.sender, Some(DeviceId::new("AAAA")));
            }
            other => panic!("unexpected event {other:?}"),
        }

        sender.stop().await;
        receiver.stop().await;
        assert!(receiver.local_addr().is_none());
    }

    #[tokio::test]
    async fn two_instances_share_a_port() {
        let port = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let shared = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let config = UdpConfig {
            bind: shared,
            target: shared,
        };

        let first = UdpTransport::new(config.clone());
        let second = UdpTransport::new(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        first.start(Inbound::new(core("AAAA"), tx.clone())).await.unwrap();
        second.start(Inbound::new(core("BBBB"), tx)).await.unwrap();
        assert_eq!(first.local_addr(), Some(shared));
        assert_eq!(second.local_addr(), Some(shared));

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn noise_is_ignored() {
        let receiver = UdpTransport::new(loopback());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        receiver
            .start(Inbound::new(core("BBBB"), events_tx))
            .await
            .unwrap();
        let target = receiver.local_addr().unwrap();

        let raw = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        raw.send_to(b"definitely not ciphertext", target).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events_rx.try_recv().is_err());
        receiver.stop().await;
    }
}
