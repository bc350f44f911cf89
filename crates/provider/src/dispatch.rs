//! Mesh message dispatch and the VM request lifecycle.
//!
//! Decodes incoming control messages, enforces authorization and filter
//! policy, drives the VM manager, and sends typed replies. `vm_created`
//! replies wait up to five seconds for the consumer's ACK; a missing ACK
//! is logged but never rolls the VM back.

use crate::config::ProviderConfig;
use crate::events::{EventFamily, EventLogger};
use crate::filter::{FilterDecision, FilterEngine, FilterRequest};
use crate::heartbeat::HeartbeatLoop;
use crate::vm::{StartVmParams, VmManager};
use omerta_core::mesh::{Mesh, MeshEnvelope};
use omerta_core::{ControlMessage, PeerId, VmId, VmRequest};
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Handler for messages outside the provider taxonomy.
pub type FallbackHandler = Box<dyn Fn(MeshEnvelope) + Send + Sync>;

pub struct RequestDispatcher {
    mesh: Arc<dyn Mesh>,
    vms: Arc<VmManager>,
    filter: Arc<FilterEngine>,
    events: Arc<EventLogger>,
    heartbeat: Arc<HeartbeatLoop>,
    config: Arc<ProviderConfig>,
    pending_acks: Mutex<HashMap<VmId, oneshot::Sender<bool>>>,
    fallback: Option<FallbackHandler>,
}

impl RequestDispatcher {
    pub fn new(
        mesh: Arc<dyn Mesh>,
        vms: Arc<VmManager>,
        filter: Arc<FilterEngine>,
        events: Arc<EventLogger>,
        heartbeat: Arc<HeartbeatLoop>,
        config: Arc<ProviderConfig>,
    ) -> Self {
        Self {
            mesh,
            vms,
            filter,
            events,
            heartbeat,
            config,
            pending_acks: Mutex::new(HashMap::new()),
            fallback: None,
        }
    }

    /// Install a handler for message types this dispatcher does not own.
    pub fn set_fallback(&mut self, handler: FallbackHandler) {
        self.fallback = Some(handler);
    }

    /// Consume the incoming mesh channel until it closes.
    ///
    /// Each message is handled on its own task so a long VM start never
    /// delays heartbeat responses. Loss of the channel is fatal to the
    /// provider; the daemon observes this task ending.
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<MeshEnvelope>) {
        while let Some(envelope) = incoming.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.handle_message(envelope).await;
            });
        }
        tracing::error!("mesh receive channel closed");
        self.events.error("dispatcher", "mesh receive channel closed");
    }

    pub async fn handle_message(&self, envelope: MeshEnvelope) {
        let from = envelope.from;
        let message = match ControlMessage::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                if let Some(fallback) = &self.fallback {
                    fallback(envelope);
                } else {
                    tracing::debug!(%from, error = %e, "undecodable mesh message");
                }
                return;
            }
        };

        tracing::debug!(%from, kind = message.kind(), "mesh message");
        match message {
            ControlMessage::VmHeartbeatResponse { active_vm_ids } => {
                self.heartbeat.handle_response(from, active_vm_ids).await;
            }
            ControlMessage::VmAck { vm_id, success } => {
                self.resolve_ack(vm_id, success);
            }
            ControlMessage::VmReleaseAck { vm_id, success } => {
                tracing::debug!(%vm_id, success, "release acknowledged");
            }
            ControlMessage::VmRequest(request) => {
                self.handle_vm_request(request, from).await;
            }
            ControlMessage::VmRelease { vm_id } => {
                self.handle_vm_release(vm_id, from).await;
            }
            other => {
                if let Some(fallback) = &self.fallback {
                    fallback(MeshEnvelope {
                        from,
                        payload: other.encode(),
                    });
                } else {
                    tracing::debug!(%from, kind = other.kind(), "unhandled message type");
                }
            }
        }
    }

    async fn handle_vm_request(&self, request: VmRequest, from: PeerId) {
        let vm_id = request.vm_id;

        if from == self.mesh.local_peer() {
            self.send_error(from, vm_id, "Cannot request VM from self").await;
            return;
        }
        if self.config.consumer_only {
            self.send_error(from, vm_id, "Provider is in consumer-only mode")
                .await;
            return;
        }

        self.events.emit(
            EventFamily::VmRequests,
            "vm_request",
            json!({
                "vm_id": vm_id.to_string(),
                "peer": from.to_hex(),
                "cpu_cores": request.requirements.cpu_cores(),
                "memory_mb": request.requirements.memory_mb(),
                "storage_mb": request.requirements.storage_mb(),
            }),
        );

        let decision = self.filter.evaluate(&FilterRequest {
            requester: from,
            network_id: self.config.network_id.as_deref(),
            requirements: &request.requirements,
            activity_description: None,
        });
        match decision {
            FilterDecision::Accept { .. } => {}
            FilterDecision::Reject { reason } => {
                self.events.error("filter", &reason);
                self.send_error(from, vm_id, &format!("Request rejected: {reason}"))
                    .await;
                return;
            }
            FilterDecision::RequireApproval { reason } => {
                // No interactive approval surface on the mesh path.
                self.send_error(from, vm_id, &format!("Request requires approval: {reason}"))
                    .await;
                return;
            }
        }

        // Prefer the endpoint the mesh learned over the one asserted in
        // the request; only relevant to the legacy consumer-side tunnel.
        let consumer_endpoint = self
            .mesh
            .endpoint_of(&from)
            .map(|addr| addr.to_string())
            .or_else(|| request.consumer_endpoint.clone());
        if let Some(endpoint) = &consumer_endpoint {
            tracing::debug!(%from, endpoint, "resolved consumer endpoint");
        }

        let vpn_ip = request
            .vm_vpn_ip
            .as_deref()
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok());
        let params = StartVmParams {
            vm_id,
            owner: from,
            requirements: request.requirements,
            ssh_public_key: request.ssh_public_key.clone(),
            ssh_user: request.ssh_user.clone(),
            vpn_ip,
            wg_public_key: request.consumer_public_key.clone(),
            max_heartbeat_failures: request
                .timeout_minutes
                .unwrap_or(self.config.default_max_heartbeat_failures),
        };

        let vm_ip = match self.vms.start_vm(params).await {
            Ok(vm_ip) => vm_ip,
            Err(e) => {
                self.events.emit(
                    EventFamily::VmRequests,
                    "vm_created",
                    json!({ "vm_id": vm_id.to_string(), "success": false, "error": e.to_string() }),
                );
                self.events.error("start_vm", &e.to_string());
                self.send_error(from, vm_id, &e.to_string()).await;
                return;
            }
        };

        // Bind the packet shuttle to the requester's tunnel session. A VM
        // without a working tunnel is useless to the consumer, so failure
        // here rolls the VM back.
        if let Err(e) = self.bind_tunnel(vm_id, from).await {
            tracing::warn!(%vm_id, error = %e, "tunnel binding failed");
            let _ = self.vms.stop_vm(&vm_id).await;
            self.send_error(from, vm_id, &format!("Tunnel setup failed: {e}"))
                .await;
            return;
        }

        self.events.emit(
            EventFamily::VmRequests,
            "vm_created",
            json!({ "vm_id": vm_id.to_string(), "success": true, "vm_ip": vm_ip.to_string() }),
        );
        self.send(
            from,
            &ControlMessage::VmCreated {
                vm_id,
                vm_ip: Some(vm_ip.to_string()),
                provider_public_key: self.config.provider_public_key.clone(),
                error: None,
            },
        )
        .await;

        self.wait_for_ack(vm_id).await;
    }

    async fn bind_tunnel(&self, vm_id: VmId, peer: PeerId) -> omerta_core::Result<()> {
        let tunnel = self.mesh.open_tunnel(&peer).await?;
        self.vms.bind_shuttle(&vm_id, tunnel).await
    }

    /// Park a one-shot continuation for the consumer's ACK. Exactly one of
    /// the ACK or the timeout resolves it; either way the entry is gone
    /// afterwards.
    async fn wait_for_ack(&self, vm_id: VmId) {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().unwrap().insert(vm_id, tx);

        match tokio::time::timeout(self.config.ack_timeout(), rx).await {
            Ok(Ok(success)) => {
                tracing::debug!(%vm_id, success, "vm_created acknowledged");
            }
            Ok(Err(_)) | Err(_) => {
                self.pending_acks.lock().unwrap().remove(&vm_id);
                tracing::warn!(%vm_id, "no ACK for vm_created; keeping the VM");
            }
        }
    }

    fn resolve_ack(&self, vm_id: VmId, success: bool) {
        match self.pending_acks.lock().unwrap().remove(&vm_id) {
            Some(tx) => {
                let _ = tx.send(success);
            }
            None => {
                tracing::debug!(%vm_id, "stale ACK ignored");
            }
        }
    }

    async fn handle_vm_release(&self, vm_id: VmId, from: PeerId) {
        match self.vms.owner_of(&vm_id) {
            // Releasing an unknown VM succeeds; release is idempotent.
            None => {
                self.send(from, &ControlMessage::VmReleased { vm_id, error: None })
                    .await;
            }
            Some(owner) if owner != from => {
                self.send_error(from, vm_id, "Not authorized to release this VM")
                    .await;
            }
            Some(owner) => {
                if let Err(e) = self.vms.stop_vm(&vm_id).await {
                    // Continue anyway: the entry is gone and the reply is
                    // still a release.
                    tracing::warn!(%vm_id, error = %e, "stop during release failed");
                }
                self.heartbeat.discard_if_unowned(&owner);
                self.events.emit(
                    EventFamily::VmLifecycle,
                    "vm_released",
                    json!({
                        "vm_id": vm_id.to_string(),
                        "owner": owner.to_hex(),
                        "reason": "released by owner",
                    }),
                );
                self.send(from, &ControlMessage::VmReleased { vm_id, error: None })
                    .await;
            }
        }
    }

    /// Number of vm_created replies still waiting on an ACK.
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().unwrap().len()
    }

    async fn send_error(&self, to: PeerId, vm_id: VmId, error: &str) {
        self.send(
            to,
            &ControlMessage::VmError {
                vm_id,
                error: error.to_string(),
            },
        )
        .await;
    }

    async fn send(&self, to: PeerId, message: &ControlMessage) {
        if let Err(e) = self.mesh.send_to(&to, &message.encode()).await {
            tracing::warn!(%to, kind = message.kind(), error = %e, "reply send failed");
        }
    }
}
