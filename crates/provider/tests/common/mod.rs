//! Shared fixture for the provider integration tests: a daemon wired to
//! the in-memory mesh and the stub hypervisor, rooted in a temp dir.

use omerta_core::mesh::MeshEnvelope;
use omerta_core::{ControlMessage, PeerId, VmId, VmRequest};
use omerta_provider::test_support::{StubHypervisor, TestMesh};
use omerta_provider::{ProviderConfig, ProviderDaemon};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use omerta_provider::test_support::{drain_sent, peer};

pub struct TestEnv {
    pub daemon: ProviderDaemon,
    pub mesh: Arc<TestMesh>,
    pub hypervisor: Arc<StubHypervisor>,
    pub outbox: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
    pub local_peer: PeerId,
    // Held for its Drop; removes all on-disk state.
    _root: tempfile::TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut ProviderConfig)) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let base_image = root.path().join("base.img");
        std::fs::write(&base_image, b"base image contents").expect("base image");

        let mut config = ProviderConfig {
            home_dir: root.path().join("home"),
            base_image,
            log_dir: root.path().join("logs"),
            firewall_marker_dir: root.path().join("firewall"),
            network_id: Some("testnet".to_string()),
            provider_public_key: Some("provider-pk".to_string()),
            iso_tool: Some("/bin/true".into()),
            ..ProviderConfig::default()
        };
        tweak(&mut config);

        let local_peer = peer(1);
        let (mesh, outbox) = TestMesh::new(local_peer);
        let hypervisor = StubHypervisor::new();
        let daemon = ProviderDaemon::new(config, mesh.clone(), hypervisor.clone())
            .expect("daemon construction");

        Self {
            daemon,
            mesh,
            hypervisor,
            outbox,
            local_peer,
            _root: root,
        }
    }

    pub fn vm_disks_dir(&self) -> std::path::PathBuf {
        self._root.path().join("home").join("vm-disks")
    }

    pub fn log_dir(&self) -> std::path::PathBuf {
        self._root.path().join("logs")
    }

    /// Deliver one control message to the dispatcher, as the mesh would.
    pub async fn deliver(&self, from: PeerId, message: &ControlMessage) {
        self.daemon
            .dispatcher()
            .handle_message(MeshEnvelope {
                from,
                payload: message.encode(),
            })
            .await;
    }

    /// Next decoded message on the outbox.
    pub async fn next_sent(&mut self) -> (PeerId, ControlMessage) {
        let (peer, bytes) = self.outbox.recv().await.expect("outbox open");
        let message = ControlMessage::decode(&bytes).expect("decodable reply");
        (peer, message)
    }

    /// Drive one `vm_request` through the dispatcher, answering its
    /// `vm_created` with an ACK. Panics on an error reply.
    pub async fn create_vm(&mut self, owner: PeerId, request: VmRequest) -> ControlMessage {
        let dispatcher = self.daemon.dispatcher().clone();
        let envelope = MeshEnvelope {
            from: owner,
            payload: ControlMessage::VmRequest(request.clone()).encode(),
        };
        let handling = tokio::spawn(async move {
            dispatcher.handle_message(envelope).await;
        });

        let (to, reply) = self.next_sent().await;
        assert_eq!(to, owner);
        if let ControlMessage::VmCreated { vm_id, error: None, .. } = &reply {
            self.deliver(
                owner,
                &ControlMessage::VmAck {
                    vm_id: *vm_id,
                    success: true,
                },
            )
            .await;
        }
        handling.await.expect("request handling");
        reply
    }
}

pub fn vm_id(tag: u8) -> VmId {
    uuid::Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0000u128 + tag as u128)
}

pub fn vm_request(id: VmId) -> VmRequest {
    VmRequest {
        vm_id: id,
        requirements: Default::default(),
        ssh_public_key: "ssh-ed25519 AAAA consumer@test".to_string(),
        ssh_user: "dev".to_string(),
        consumer_public_key: Some("consumer-pk".to_string()),
        consumer_endpoint: None,
        vm_vpn_ip: Some("10.200.200.2".to_string()),
        consumer_vpn_ip: Some("10.200.200.1".to_string()),
        timeout_minutes: Some(10),
    }
}
