//! Daemon root: owns every subsystem and sequences shutdown.

use crate::config::ProviderConfig;
use crate::dispatch::RequestDispatcher;
use crate::events::{EventFamily, EventLogger};
use crate::filter::FilterEngine;
use crate::heartbeat::{HeartbeatConfig, HeartbeatLoop};
use crate::vm::VmManager;
use omerta_core::hypervisor::Hypervisor;
use omerta_core::mesh::{Mesh, MeshEnvelope};
use omerta_core::{ControlMessage, Result};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long shutdown notifications get to reach peers before VMs die.
const SHUTDOWN_NOTIFY_GRACE: Duration = Duration::from_millis(500);

/// The provider daemon.
///
/// Construction wires the subsystems; [`start`](ProviderDaemon::start)
/// attaches the mesh receive channel and launches the background tasks.
/// The daemon owns all of them — neither the dispatcher nor the VM manager
/// keeps the other alive, so shutdown can sequence them deterministically:
/// cancel the heartbeat, notify every owning peer, stop the VMs, close the
/// mesh.
pub struct ProviderDaemon {
    config: Arc<ProviderConfig>,
    mesh: Arc<dyn Mesh>,
    events: Arc<EventLogger>,
    vms: Arc<VmManager>,
    heartbeat: Arc<HeartbeatLoop>,
    dispatcher: Arc<RequestDispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProviderDaemon {
    pub fn new(
        config: ProviderConfig,
        mesh: Arc<dyn Mesh>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Result<Self> {
        config.validate()?;
        if !hypervisor.is_available() {
            return Err(omerta_core::Error::PlatformNotSupported(format!(
                "hypervisor backend '{}' is unavailable",
                hypervisor.name()
            )));
        }

        let config = Arc::new(config);
        let events = Arc::new(EventLogger::new(&config.log_dir));
        let vms = Arc::new(VmManager::new(config.clone(), hypervisor, events.clone()));
        let heartbeat = Arc::new(HeartbeatLoop::new(
            mesh.clone(),
            vms.clone(),
            events.clone(),
            HeartbeatConfig {
                interval: config.heartbeat_interval(),
                pending_timeout: config.heartbeat_timeout(),
            },
        ));
        let filter = Arc::new(FilterEngine::new(config.default_filter_action));
        if let Some(owner) = config.owner_peer {
            filter.set_owner(owner);
        }
        if let Some(network) = &config.network_id {
            filter.trust_network(network.clone());
        }
        for network in &config.trusted_networks {
            filter.trust_network(network.clone());
        }
        for peer in &config.blocked_peers {
            filter.block_peer(*peer);
        }
        for rule in &config.filter_rules {
            filter.add_rule(rule.clone());
        }
        let dispatcher = Arc::new(RequestDispatcher::new(
            mesh.clone(),
            vms.clone(),
            filter,
            events.clone(),
            heartbeat.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            mesh,
            events,
            vms,
            heartbeat,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Launch the dispatcher and heartbeat tasks.
    pub fn start(&self, incoming: mpsc::Receiver<MeshEnvelope>) {
        tracing::info!(
            peer = %self.mesh.local_peer(),
            consumer_only = self.config.consumer_only,
            "provider starting"
        );
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(self.dispatcher.clone().run(incoming)));
        tasks.push(self.heartbeat.spawn());
    }

    pub fn vm_manager(&self) -> &Arc<VmManager> {
        &self.vms
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatLoop> {
        &self.heartbeat
    }

    /// Orderly shutdown: cancel background tasks, tell every owning peer
    /// which VMs are going away, give the messages a moment to drain, then
    /// stop the VMs and close the mesh.
    pub async fn shutdown(&self) {
        tracing::info!("provider shutting down");
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let groups = self.vms.owners_snapshot();
        for (peer, vm_ids) in &groups {
            let message = ControlMessage::ProviderShutdown {
                vm_ids: vm_ids.clone(),
            };
            if let Err(e) = self.mesh.send_to(peer, &message.encode()).await {
                tracing::warn!(%peer, error = %e, "shutdown notification failed");
            }
        }
        if !groups.is_empty() {
            tokio::time::sleep(SHUTDOWN_NOTIFY_GRACE).await;
        }

        self.vms.stop_all().await;
        self.mesh.close().await;

        self.events.emit(
            EventFamily::VmLifecycle,
            "provider_shutdown",
            json!({ "notified_peers": groups.len() }),
        );
        self.events.stop();
    }
}
