//! Heartbeat loop and peer-authoritative reconciliation.
//!
//! One background task per provider. Every tick it sweeps timed-out
//! pending probes, groups active VMs by owner, and sends one
//! `vm_heartbeat` per peer that has none outstanding. Responses carry the
//! peer's authoritative VM set; anything the provider tracks beyond that
//! set is abandoned and reclaimed. Failure counters are per peer and are
//! discarded with the peer's last VM.

use crate::events::{EventFamily, EventLogger};
use crate::vm::VmManager;
use omerta_core::mesh::Mesh;
use omerta_core::{ControlMessage, PeerId, VmId};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub pending_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct State {
    pending: HashMap<PeerId, Instant>,
    failures: HashMap<PeerId, u32>,
}

pub struct HeartbeatLoop {
    mesh: Arc<dyn Mesh>,
    vms: Arc<VmManager>,
    events: Arc<EventLogger>,
    config: HeartbeatConfig,
    state: Mutex<State>,
}

impl HeartbeatLoop {
    pub fn new(
        mesh: Arc<dyn Mesh>,
        vms: Arc<VmManager>,
        events: Arc<EventLogger>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            mesh,
            vms,
            events,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.tick().await;
            }
        })
    }

    /// One heartbeat cycle: timeout sweep, then probes.
    pub async fn tick(&self) {
        let now = Instant::now();
        let timed_out: Vec<PeerId> = {
            let mut state = self.state.lock().unwrap();
            let expired: Vec<PeerId> = state
                .pending
                .iter()
                .filter(|(_, sent)| now.duration_since(**sent) > self.config.pending_timeout)
                .map(|(peer, _)| *peer)
                .collect();
            for peer in &expired {
                state.pending.remove(peer);
            }
            expired
        };
        for peer in timed_out {
            tracing::warn!(%peer, "heartbeat timed out");
            self.record_failure(peer).await;
        }

        for (peer, vm_ids) in self.vms.owners_snapshot() {
            {
                let mut state = self.state.lock().unwrap();
                if state.pending.contains_key(&peer) {
                    continue;
                }
                state.pending.insert(peer, Instant::now());
            }

            let message = ControlMessage::VmHeartbeat {
                vm_ids: vm_ids.clone(),
            };
            match self.mesh.send_to(&peer, &message.encode()).await {
                Ok(()) => {
                    self.events.emit(
                        EventFamily::Heartbeats,
                        "heartbeat_sent",
                        json!({ "peer": peer.to_hex(), "vm_count": vm_ids.len() }),
                    );
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "heartbeat send failed");
                    self.state.lock().unwrap().pending.remove(&peer);
                    self.record_failure(peer).await;
                }
            }
        }
    }

    /// Apply a `vm_heartbeat_response` from a peer.
    ///
    /// The response is authoritative: VMs the peer no longer claims are
    /// reclaimed. A response equal to our own view is a no-op.
    pub async fn handle_response(&self, from: PeerId, active_vm_ids: Vec<VmId>) {
        {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(&from);
            state.failures.remove(&from);
        }

        let active: HashSet<VmId> = active_vm_ids.into_iter().collect();
        let abandoned: Vec<VmId> = self
            .vms
            .owned_by(&from)
            .into_iter()
            .filter(|vm_id| !active.contains(vm_id))
            .collect();

        self.events.emit(
            EventFamily::Heartbeats,
            "heartbeat_response",
            json!({
                "peer": from.to_hex(),
                "active_count": active.len(),
                "abandoned_count": abandoned.len(),
            }),
        );

        for vm_id in abandoned {
            self.cleanup_vm(vm_id, "consumer no longer tracking".to_string())
                .await;
        }
    }

    /// Record one failed probe for a peer and evict any of its VMs whose
    /// threshold the counter now meets.
    async fn record_failure(&self, peer: PeerId) {
        let count = {
            let mut state = self.state.lock().unwrap();
            let counter = state.failures.entry(peer).or_insert(0);
            *counter += 1;
            *counter
        };
        self.events.emit(
            EventFamily::Heartbeats,
            "heartbeat_failure",
            json!({ "peer": peer.to_hex(), "consecutive_failures": count }),
        );

        for vm_id in self.vms.owned_by(&peer) {
            let Some(max) = self.vms.max_failures_of(&vm_id) else {
                continue;
            };
            if count >= max {
                self.cleanup_vm(
                    vm_id,
                    format!("heartbeat timeout ({count} consecutive failures)"),
                )
                .await;
            }
        }
    }

    /// Stop and forget one VM; drop the peer's counters with its last VM.
    async fn cleanup_vm(&self, vm_id: VmId, reason: String) {
        let Some(owner) = self.vms.owner_of(&vm_id) else {
            // Already gone; reconciliation racing a release is fine.
            return;
        };

        tracing::info!(%vm_id, %owner, %reason, "reclaiming vm");
        if let Err(e) = self.vms.stop_vm(&vm_id).await {
            tracing::warn!(%vm_id, error = %e, "cleanup stop failed");
        }
        self.events.emit(
            EventFamily::VmLifecycle,
            "vm_released",
            json!({
                "vm_id": vm_id.to_string(),
                "owner": owner.to_hex(),
                "reason": reason,
            }),
        );

        self.discard_if_unowned(&owner);
    }

    /// Drop a peer's counters once it owns no VMs. Also called by the
    /// dispatcher after an owner-initiated release.
    pub fn discard_if_unowned(&self, peer: &PeerId) {
        if self.vms.owned_by(peer).is_empty() {
            let mut state = self.state.lock().unwrap();
            state.failures.remove(peer);
            state.pending.remove(peer);
        }
    }

    /// Consecutive-failure count for a peer, if any.
    pub fn failures_of(&self, peer: &PeerId) -> Option<u32> {
        self.state.lock().unwrap().failures.get(peer).copied()
    }

    pub fn has_pending(&self, peer: &PeerId) -> bool {
        self.state.lock().unwrap().pending.contains_key(peer)
    }
}
