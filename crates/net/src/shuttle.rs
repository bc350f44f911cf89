//! Packet shuttle: pumps frames between a VM's packet source and the mesh
//! tunnel session addressed to the owning peer.

use crate::error::NetError;
use crate::source::{PacketSource, PacketStream};
use omerta_core::mesh::TunnelSession;
use omerta_core::MeshError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;

/// Traffic counters, captured at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShuttleSnapshot {
    pub packets_to_tunnel: u64,
    pub bytes_to_tunnel: u64,
    pub packets_from_tunnel: u64,
    pub bytes_from_tunnel: u64,
}

#[derive(Default)]
struct Counters {
    packets_to_tunnel: AtomicU64,
    bytes_to_tunnel: AtomicU64,
    packets_from_tunnel: AtomicU64,
    bytes_from_tunnel: AtomicU64,
}

/// Two concurrent forwarders bound to one VM.
///
/// Outbound consumes the source's packet stream into the tunnel; inbound
/// consumes the tunnel's return stream into the source. A failed write for
/// a single packet is logged and skipped; a terminated stream ends that
/// direction. Both directions end on [`PacketShuttle::stop`].
pub struct PacketShuttle {
    counters: Arc<Counters>,
    tunnel: Arc<dyn TunnelSession>,
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl PacketShuttle {
    pub fn spawn(
        source: Arc<PacketSource>,
        stream: PacketStream,
        tunnel: Arc<dyn TunnelSession>,
    ) -> Self {
        let counters = Arc::new(Counters::default());

        let outbound = tokio::spawn(outbound_loop(stream, tunnel.clone(), counters.clone()));
        let inbound = tokio::spawn(inbound_loop(source, tunnel.clone(), counters.clone()));

        Self {
            counters,
            tunnel,
            outbound,
            inbound,
        }
    }

    pub fn stats(&self) -> ShuttleSnapshot {
        ShuttleSnapshot {
            packets_to_tunnel: self.counters.packets_to_tunnel.load(Ordering::Relaxed),
            bytes_to_tunnel: self.counters.bytes_to_tunnel.load(Ordering::Relaxed),
            packets_from_tunnel: self.counters.packets_from_tunnel.load(Ordering::Relaxed),
            bytes_from_tunnel: self.counters.bytes_from_tunnel.load(Ordering::Relaxed),
        }
    }

    /// Stop both forwarders and close the tunnel session. Idempotent.
    pub async fn stop(&self) {
        self.outbound.abort();
        self.inbound.abort();
        self.tunnel.close().await;
    }
}

impl Drop for PacketShuttle {
    fn drop(&mut self) {
        self.outbound.abort();
        self.inbound.abort();
    }
}

async fn outbound_loop(
    mut stream: PacketStream,
    tunnel: Arc<dyn TunnelSession>,
    counters: Arc<Counters>,
) {
    while let Some(packet) = stream.recv().await {
        match tunnel.inject(&packet).await {
            Ok(()) => {
                counters.packets_to_tunnel.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_to_tunnel
                    .fetch_add(packet.len() as u64, Ordering::Relaxed);
            }
            Err(MeshError::TunnelClosed | MeshError::Closed) => {
                tracing::debug!("tunnel closed, outbound forwarder ending");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping outbound packet");
            }
        }
    }
    tracing::debug!("packet stream ended, outbound forwarder ending");
}

async fn inbound_loop(
    source: Arc<PacketSource>,
    tunnel: Arc<dyn TunnelSession>,
    counters: Arc<Counters>,
) {
    while let Some(packet) = tunnel.next_return().await {
        match source.write(&packet).await {
            Ok(()) => {
                counters.packets_from_tunnel.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_from_tunnel
                    .fetch_add(packet.len() as u64, Ordering::Relaxed);
            }
            Err(NetError::NotStarted) => {
                tracing::debug!("packet source stopped, inbound forwarder ending");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping inbound packet");
            }
        }
    }
    tracing::debug!("tunnel return stream ended, inbound forwarder ending");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socketpair::DgramSocketDevice;
    use async_trait::async_trait;
    use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};
    use std::os::fd::{AsRawFd, OwnedFd};
    use tokio::sync::{Mutex, mpsc};

    struct FakeTunnel {
        injected_tx: mpsc::Sender<Vec<u8>>,
        returns: Mutex<mpsc::Receiver<Vec<u8>>>,
    }

    #[async_trait]
    impl TunnelSession for FakeTunnel {
        async fn inject(&self, packet: &[u8]) -> Result<(), MeshError> {
            self.injected_tx
                .send(packet.to_vec())
                .await
                .map_err(|_| MeshError::TunnelClosed)
        }

        async fn next_return(&self) -> Option<Vec<u8>> {
            self.returns.lock().await.recv().await
        }

        async fn close(&self) {}
    }

    fn fake_tunnel() -> (Arc<FakeTunnel>, mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>) {
        let (injected_tx, injected_rx) = mpsc::channel(64);
        let (return_tx, return_rx) = mpsc::channel(64);
        let tunnel = Arc::new(FakeTunnel {
            injected_tx,
            returns: Mutex::new(return_rx),
        });
        (tunnel, injected_rx, return_tx)
    }

    const VM_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x0a, 0x0b, 0x0c];

    fn ip_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 14 + payload.len()];
        let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.set_dst_addr(EthernetAddress(crate::gateway::GATEWAY_MAC));
        eth.set_src_addr(EthernetAddress(VM_MAC));
        eth.set_ethertype(EthernetProtocol::Ipv4);
        eth.payload_mut().copy_from_slice(payload);
        buf
    }

    fn ipv4_payload(len: usize) -> Vec<u8> {
        let mut p = vec![0u8; len];
        p[0] = 0x45;
        p
    }

    fn send_raw(fd: &OwnedFd, bytes: &[u8]) {
        let n = unsafe { libc::send(fd.as_raw_fd(), bytes.as_ptr() as *const _, bytes.len(), 0) };
        assert_eq!(n as usize, bytes.len());
    }

    #[tokio::test]
    async fn forwards_outbound_and_counts() {
        let (device, guest) = DgramSocketDevice::create().unwrap();
        let source = Arc::new(PacketSource::dgram(device));
        let stream = source.start().unwrap();
        let (tunnel, mut injected, _returns) = fake_tunnel();

        let shuttle = PacketShuttle::spawn(source, stream, tunnel);

        send_raw(&guest, &ip_frame(&ipv4_payload(28)));
        let packet = injected.recv().await.unwrap();
        assert_eq!(packet, ipv4_payload(28));

        let stats = shuttle.stats();
        assert_eq!(stats.packets_to_tunnel, 1);
        assert_eq!(stats.bytes_to_tunnel, 28);
    }

    #[tokio::test]
    async fn forwards_inbound_and_counts() {
        let (device, guest) = DgramSocketDevice::create().unwrap();
        let source = Arc::new(PacketSource::dgram(device));
        let stream = source.start().unwrap();
        let (tunnel, mut injected, returns) = fake_tunnel();

        let shuttle = PacketShuttle::spawn(source, stream, tunnel);

        // Teach the gateway the VM MAC first.
        send_raw(&guest, &ip_frame(&ipv4_payload(28)));
        injected.recv().await.unwrap();

        returns.send(ipv4_payload(40)).await.unwrap();

        // The guest side of the socketpair should receive a framed packet.
        // Non-blocking poll so the forwarder tasks keep getting scheduled.
        let mut buf = vec![0u8; 2048];
        let n = loop {
            let n = unsafe {
                libc::recv(
                    guest.as_raw_fd(),
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n > 0 {
                break n as usize;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        let eth = EthernetFrame::new_checked(&buf[..n]).unwrap();
        assert_eq!(eth.payload(), &ipv4_payload(40)[..]);

        let stats = shuttle.stats();
        assert_eq!(stats.packets_from_tunnel, 1);
        assert_eq!(stats.bytes_from_tunnel, 40);
    }

    #[tokio::test]
    async fn stop_ends_both_directions() {
        let (device, _guest) = DgramSocketDevice::create().unwrap();
        let source = Arc::new(PacketSource::dgram(device));
        let stream = source.start().unwrap();
        let (tunnel, _injected, returns) = fake_tunnel();

        let shuttle = PacketShuttle::spawn(source, stream, tunnel);
        shuttle.stop().await;
        while !shuttle.outbound.is_finished() || !shuttle.inbound.is_finished() {
            tokio::task::yield_now().await;
        }

        // Forwarders are gone; pushing a return packet goes nowhere.
        let _ = returns.send(ipv4_payload(28)).await;
        assert_eq!(shuttle.stats().packets_from_tunnel, 0);
    }
}
