//! Packet source: one VM-side NIC endpoint as a packet stream.

use crate::error::{NetError, Result};
use crate::frame_io::FrameIo;
use crate::gateway::{Outbound, VirtualGateway};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames/packets read from the VM, in arrival order.
pub type PacketStream = mpsc::Receiver<Vec<u8>>;

const STREAM_DEPTH: usize = 256;

enum State {
    Idle,
    Started(JoinHandle<()>),
    Stopped,
}

/// Bidirectional endpoint on a VM's virtual NIC.
///
/// `start` spawns the reader task and hands back the output stream; `write`
/// delivers packets to the VM; `stop` terminates the stream and rejects
/// further I/O. On the datagram path a [`VirtualGateway`] translates
/// between the VM's L2 frames and the tunnel's bare IP packets; the TAP
/// path carries raw ethernet frames unchanged.
pub struct PacketSource {
    device: Arc<dyn FrameIo>,
    gateway: Option<Arc<VirtualGateway>>,
    state: Mutex<State>,
}

impl PacketSource {
    pub fn new(device: Arc<dyn FrameIo>, gateway: Option<VirtualGateway>) -> Self {
        Self {
            device,
            gateway: gateway.map(Arc::new),
            state: Mutex::new(State::Idle),
        }
    }

    /// TAP-backed source (Linux): L2 frames pass through untouched.
    #[cfg(target_os = "linux")]
    pub fn tap(device: crate::tap::TapDevice) -> Self {
        Self::new(Arc::new(device), None)
    }

    /// Socketpair-backed source (macOS): runs the virtual gateway.
    pub fn dgram(device: crate::socketpair::DgramSocketDevice) -> Self {
        Self::new(Arc::new(device), Some(VirtualGateway::new()))
    }

    /// Begin yielding frames. Fails once started or after `stop`.
    pub fn start(&self) -> Result<PacketStream> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Idle => {}
            State::Started(_) => return Err(NetError::AlreadyStarted),
            State::Stopped => return Err(NetError::NotStarted),
        }

        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let device = self.device.clone();
        let gateway = self.gateway.clone();
        *state = State::Started(tokio::spawn(read_loop(device, gateway, tx)));
        Ok(rx)
    }

    /// Deliver one packet to the VM.
    ///
    /// On the datagram path this re-frames the IP payload for the guest;
    /// packets arriving before the VM's MAC is known are dropped.
    pub async fn write(&self, packet: &[u8]) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if !matches!(*state, State::Started(_)) {
                return Err(NetError::NotStarted);
            }
        }

        let frame = match &self.gateway {
            Some(gateway) => match gateway.frame_inbound(packet) {
                Some(frame) => frame,
                None => {
                    tracing::trace!(len = packet.len(), "dropping packet, VM MAC not learned yet");
                    return Ok(());
                }
            },
            None => packet.to_vec(),
        };

        self.device
            .send(&frame)
            .await
            .map_err(|e| NetError::WriteFailed(e.to_string()))
    }

    /// Terminate the stream and reject further I/O. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Started(task) = std::mem::replace(&mut *state, State::Stopped) {
            task.abort();
        }
    }
}

impl Drop for PacketSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop(
    device: Arc<dyn FrameIo>,
    gateway: Option<Arc<VirtualGateway>>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = vec![0u8; device.mtu() + 64];
    loop {
        let n = match device.recv(&mut buf).await {
            Ok(0) => {
                tracing::debug!("packet source closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "packet source read failed");
                return;
            }
        };

        let out = match &gateway {
            Some(gateway) => match gateway.handle_outbound(&buf[..n]) {
                Outbound::ArpReply(reply) => {
                    if let Err(e) = device.send(&reply).await {
                        tracing::warn!(error = %e, "failed to write ARP reply");
                    }
                    continue;
                }
                Outbound::Packet(packet) => packet,
                Outbound::Drop => continue,
            },
            None => buf[..n].to_vec(),
        };

        if tx.send(out).await.is_err() {
            // Receiver gone; the shuttle was stopped.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socketpair::DgramSocketDevice;
    use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};
    use std::os::fd::{AsRawFd, OwnedFd};

    const VM_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x01, 0x02, 0x03];

    fn send_raw(fd: &OwnedFd, bytes: &[u8]) {
        let n = unsafe { libc::send(fd.as_raw_fd(), bytes.as_ptr() as *const _, bytes.len(), 0) };
        assert_eq!(n as usize, bytes.len());
    }

    fn recv_raw(fd: &OwnedFd) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let n = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len(), 0) };
        assert!(n >= 0);
        buf.truncate(n as usize);
        buf
    }

    fn ip_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 14 + payload.len()];
        let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
        eth.set_dst_addr(EthernetAddress(crate::gateway::GATEWAY_MAC));
        eth.set_src_addr(EthernetAddress(VM_MAC));
        eth.set_ethertype(EthernetProtocol::Ipv4);
        eth.payload_mut().copy_from_slice(payload);
        buf
    }

    fn ipv4_payload() -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p
    }

    #[tokio::test]
    async fn start_yields_stripped_packets() {
        let (device, guest) = DgramSocketDevice::create().unwrap();
        let source = PacketSource::dgram(device);
        let mut stream = source.start().unwrap();

        send_raw(&guest, &ip_frame(&ipv4_payload()));
        let packet = stream.recv().await.unwrap();
        assert_eq!(packet, ipv4_payload());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (device, _guest) = DgramSocketDevice::create().unwrap();
        let source = PacketSource::dgram(device);
        let _stream = source.start().unwrap();
        assert!(matches!(source.start(), Err(NetError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn write_requires_start() {
        let (device, _guest) = DgramSocketDevice::create().unwrap();
        let source = PacketSource::dgram(device);
        assert!(matches!(
            source.write(&ipv4_payload()).await,
            Err(NetError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn write_reframes_for_guest_after_mac_learned() {
        let (device, guest) = DgramSocketDevice::create().unwrap();
        let source = PacketSource::dgram(device);
        let mut stream = source.start().unwrap();

        // Teach the gateway the VM MAC.
        send_raw(&guest, &ip_frame(&ipv4_payload()));
        stream.recv().await.unwrap();

        source.write(&ipv4_payload()).await.unwrap();
        let frame = recv_raw(&guest);
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), EthernetAddress(VM_MAC));
        assert_eq!(eth.payload(), &ipv4_payload()[..]);
    }

    #[tokio::test]
    async fn stop_terminates_stream_and_rejects_io() {
        let (device, _guest) = DgramSocketDevice::create().unwrap();
        let source = PacketSource::dgram(device);
        let mut stream = source.start().unwrap();

        source.stop();
        assert_eq!(stream.recv().await, None);
        assert!(matches!(
            source.write(&ipv4_payload()).await,
            Err(NetError::NotStarted)
        ));
        assert!(matches!(source.start(), Err(NetError::NotStarted)));
    }
}
