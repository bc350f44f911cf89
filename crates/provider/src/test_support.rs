//! In-memory fakes for exercising the provider without a mesh overlay or
//! a real hypervisor. Used by the integration tests; not part of the
//! public API surface proper.

use async_trait::async_trait;
use omerta_core::hypervisor::{Hypervisor, LaunchSpec, NetworkMode, VmHandle};
use omerta_core::mesh::{Mesh, MeshEnvelope, TunnelSession};
use omerta_core::{ControlMessage, MeshError, PeerId, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// Deterministic peer ids for tests.
pub fn peer(tag: u8) -> PeerId {
    PeerId::new([tag; 32])
}

/// Mesh fake: records outgoing sends, hands out loopback tunnels, and can
/// be told to fail sends to drive heartbeat failure paths.
pub struct TestMesh {
    local: PeerId,
    sent_tx: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    fail_sends: AtomicBool,
    endpoints: Mutex<std::collections::HashMap<PeerId, SocketAddr>>,
    tunnels_opened: AtomicUsize,
}

impl TestMesh {
    pub fn new(local: PeerId) -> (Arc<Self>, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                local,
                sent_tx,
                fail_sends: AtomicBool::new(false),
                endpoints: Mutex::new(std::collections::HashMap::new()),
                tunnels_opened: AtomicUsize::new(0),
            }),
            sent_rx,
        )
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn learn_endpoint(&self, peer: PeerId, addr: SocketAddr) {
        self.endpoints.lock().unwrap().insert(peer, addr);
    }

    pub fn tunnels_opened(&self) -> usize {
        self.tunnels_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mesh for TestMesh {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send_to(&self, peer: &PeerId, payload: &[u8]) -> std::result::Result<(), MeshError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MeshError::PeerUnreachable(*peer));
        }
        self.sent_tx
            .send((*peer, payload.to_vec()))
            .map_err(|_| MeshError::Closed)
    }

    fn endpoint_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.endpoints.lock().unwrap().get(peer).copied()
    }

    async fn open_tunnel(
        &self,
        _peer: &PeerId,
    ) -> std::result::Result<Arc<dyn TunnelSession>, MeshError> {
        self.tunnels_opened.fetch_add(1, Ordering::SeqCst);
        let (_injected_tx, injected_rx) = mpsc::channel(64);
        let (return_tx, return_rx) = mpsc::channel(64);
        Ok(Arc::new(TestTunnel {
            injected_rx: AsyncMutex::new(injected_rx),
            return_tx,
            returns: AsyncMutex::new(return_rx),
        }))
    }

    async fn close(&self) {}
}

/// Loopback tunnel: injected packets vanish, return packets come from the
/// test via [`TestTunnel::push_return`].
pub struct TestTunnel {
    #[allow(dead_code)]
    injected_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    return_tx: mpsc::Sender<Vec<u8>>,
    returns: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

impl TestTunnel {
    pub async fn push_return(&self, packet: Vec<u8>) {
        let _ = self.return_tx.send(packet).await;
    }
}

#[async_trait]
impl TunnelSession for TestTunnel {
    async fn inject(&self, _packet: &[u8]) -> std::result::Result<(), MeshError> {
        Ok(())
    }

    async fn next_return(&self) -> Option<Vec<u8>> {
        self.returns.lock().await.recv().await
    }

    async fn close(&self) {}
}

/// Hypervisor fake: copies the base image as the "overlay", launches
/// nothing, and keeps per-handle running state the tests can flip.
pub struct StubHypervisor {
    launches: AtomicUsize,
    fail_launches: AtomicBool,
    handles: Mutex<Vec<Arc<StubState>>>,
}

struct StubState {
    running: AtomicBool,
    stops: AtomicUsize,
}

impl StubHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            fail_launches: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make every subsequent launch fail, to exercise rollback paths.
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Total stop calls across every handle ever launched.
    pub fn total_stops(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.stops.load(Ordering::SeqCst))
            .sum()
    }

    pub fn running_handles(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.running.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl Hypervisor for StubHypervisor {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn network_mode(&self) -> NetworkMode {
        NetworkMode::FileHandle
    }

    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        tokio::fs::copy(base, overlay).await?;
        Ok(())
    }

    async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn VmHandle>> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(omerta_core::Error::StartFailed(
                "stub launch failure".to_string(),
            ));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(StubState {
            running: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        });
        self.handles.lock().unwrap().push(state.clone());
        Ok(Box::new(StubVmHandle { state }))
    }
}

struct StubVmHandle {
    state: Arc<StubState>,
}

#[async_trait]
impl VmHandle for StubVmHandle {
    async fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    async fn stop(&self, _grace: Duration) -> Result<()> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Drain all messages currently queued on the outbox, decoded.
pub fn drain_sent(
    rx: &mut mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
) -> Vec<(PeerId, ControlMessage)> {
    let mut out = Vec::new();
    while let Ok((peer, bytes)) = rx.try_recv() {
        if let Ok(message) = ControlMessage::decode(&bytes) {
            out.push((peer, message));
        }
    }
    out
}
