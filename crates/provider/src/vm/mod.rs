//! VM lifecycle management.
//!
//! The manager owns the table of active VMs and the full start pipeline:
//! overlay disk, network endpoint, cloud-init seed, hypervisor launch,
//! tracking entry. Every step has a compensating rollback; any failure
//! leaves no artefact behind. Teardown releases the hypervisor, the
//! endpoint, the disk artefacts and the tracking entry together, on every
//! exit path.

#[cfg(target_os = "linux")]
mod qemu;
#[cfg(target_os = "macos")]
mod virtualization;

#[cfg(target_os = "linux")]
pub use qemu::QemuBackend;
#[cfg(target_os = "macos")]
pub use virtualization::VzBackend;

use crate::cloudinit::{CloudInitAuthor, CloudInitSpec, StaticNetwork};
use crate::config::ProviderConfig;
use crate::events::{EventFamily, EventLogger};
use chrono::{DateTime, Utc};
use omerta_core::hypervisor::{Hypervisor, LaunchSpec, NetAttachment, NetworkMode, VmHandle};
use omerta_core::mesh::TunnelSession;
use omerta_core::{Error, PeerId, ResourceRequirements, Result, VmId};
use omerta_net::{DgramSocketDevice, PacketShuttle, PacketSource};
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Grace between SIGTERM and SIGKILL (or framework stop) at teardown.
const STOP_GRACE: Duration = Duration::from_secs(2);
const SSH_PORT: u16 = 22;
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const SSH_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Everything `start_vm` needs for one VM.
#[derive(Debug, Clone)]
pub struct StartVmParams {
    pub vm_id: VmId,
    pub owner: PeerId,
    pub requirements: ResourceRequirements,
    pub ssh_public_key: String,
    pub ssh_user: String,
    /// Address the consumer expects the VM to carry; required on the
    /// file-handle path, overrides the TAP guest address otherwise.
    pub vpn_ip: Option<Ipv4Addr>,
    /// Consumer public key, kept for the legacy tunnel monitor.
    pub wg_public_key: Option<String>,
    pub max_heartbeat_failures: u32,
}

/// Public view of one tracked VM.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub vm_id: VmId,
    pub owner: PeerId,
    pub vm_ip: Ipv4Addr,
    pub created_at: DateTime<Utc>,
    pub max_heartbeat_failures: u32,
    pub pid: Option<u32>,
}

enum Endpoint {
    #[cfg(target_os = "linux")]
    Tap {
        interface: String,
        subnet: omerta_net::TapSubnet,
        uplink: Option<String>,
    },
    Dgram {
        _guest_fd: Arc<OwnedFd>,
    },
    Nat,
}

struct ActiveVm {
    vm_id: VmId,
    owner: PeerId,
    vm_ip: Ipv4Addr,
    #[allow(dead_code)]
    wg_public_key: Option<String>,
    endpoint: Endpoint,
    handle: Arc<dyn VmHandle>,
    source: Option<Arc<PacketSource>>,
    shuttle: StdMutex<Option<Arc<PacketShuttle>>>,
    disk_dir: PathBuf,
    created_at: DateTime<Utc>,
    max_heartbeat_failures: u32,
}

/// Result of endpoint provisioning, before the hypervisor launch.
struct Provisioned {
    endpoint: Endpoint,
    source: Option<Arc<PacketSource>>,
    attachment: NetAttachment,
    vm_ip: Ipv4Addr,
    gateway: Ipv4Addr,
}

#[cfg(target_os = "linux")]
struct TapProvisioner {
    pool: omerta_net::SubnetPool,
    host: omerta_net::HostNetwork,
}

pub struct VmManager {
    config: Arc<ProviderConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    events: Arc<EventLogger>,
    cloudinit: CloudInitAuthor,
    vms: StdMutex<HashMap<VmId, Arc<ActiveVm>>>,
    /// Serializes all mutating operations. Never held across the SSH wait.
    ops: Mutex<()>,
    #[cfg(target_os = "linux")]
    tap: TapProvisioner,
}

impl VmManager {
    pub fn new(
        config: Arc<ProviderConfig>,
        hypervisor: Arc<dyn Hypervisor>,
        events: Arc<EventLogger>,
    ) -> Self {
        let cloudinit = match &config.iso_tool {
            Some(tool) => CloudInitAuthor::with_tool(tool),
            None => CloudInitAuthor::new(),
        };
        Self {
            cloudinit,
            hypervisor,
            events,
            vms: StdMutex::new(HashMap::new()),
            ops: Mutex::new(()),
            #[cfg(target_os = "linux")]
            tap: TapProvisioner {
                pool: omerta_net::SubnetPool::new(),
                host: omerta_net::HostNetwork::new(&config.firewall_marker_dir),
            },
            config,
        }
    }

    /// Start one VM. Returns the address the consumer should reach it at.
    ///
    /// Steps run in order — base image check, overlay, endpoint, seed ISO,
    /// launch, record — and every failure rolls back the artefacts of the
    /// steps before it.
    pub async fn start_vm(&self, params: StartVmParams) -> Result<Ipv4Addr> {
        let _ops = self.ops.lock().await;

        if self.vms.lock().unwrap().contains_key(&params.vm_id) {
            return Err(Error::StartFailed(format!(
                "vm {} is already tracked",
                params.vm_id
            )));
        }

        let base = &self.config.base_image;
        if !base.exists() {
            return Err(Error::DiskImageNotFound(base.clone()));
        }

        let disk_dir = self.config.vm_disks_dir().join(params.vm_id.to_string());
        tokio::fs::create_dir_all(&disk_dir).await?;

        let overlay = disk_dir.join("overlay.img");
        if let Err(e) = self.hypervisor.create_overlay(base, &overlay).await {
            self.scrub_disk_dir(&disk_dir).await;
            return Err(e);
        }

        let provisioned = match self.provision_endpoint(&params).await {
            Ok(p) => p,
            Err(e) => {
                self.scrub_disk_dir(&disk_dir).await;
                return Err(e);
            }
        };

        let seed_iso = disk_dir.join("seed.iso");
        let seed_spec = self.seed_spec(&params, &provisioned);
        if let Err(e) = self
            .cloudinit
            .build_seed_iso(&seed_spec, &disk_dir.join("seed"), &seed_iso)
            .await
        {
            self.teardown_endpoint(&provisioned.endpoint, provisioned.source.as_deref())
                .await;
            self.scrub_disk_dir(&disk_dir).await;
            return Err(e);
        }

        let launch = LaunchSpec {
            vm_id: params.vm_id,
            overlay,
            seed_iso,
            cpu_cores: params.requirements.cpu_cores(),
            memory_mb: params.requirements.memory_mb(),
            network: provisioned.attachment.clone(),
            disk_dir: disk_dir.clone(),
        };
        let handle = match self.hypervisor.launch(&launch).await {
            Ok(handle) => handle,
            Err(e) => {
                self.teardown_endpoint(&provisioned.endpoint, provisioned.source.as_deref())
                    .await;
                self.scrub_disk_dir(&disk_dir).await;
                return Err(e);
            }
        };

        let vm = Arc::new(ActiveVm {
            vm_id: params.vm_id,
            owner: params.owner,
            vm_ip: provisioned.vm_ip,
            wg_public_key: params.wg_public_key.clone(),
            endpoint: provisioned.endpoint,
            handle: Arc::from(handle),
            source: provisioned.source,
            shuttle: StdMutex::new(None),
            disk_dir,
            created_at: Utc::now(),
            max_heartbeat_failures: params.max_heartbeat_failures,
        });
        self.vms.lock().unwrap().insert(params.vm_id, vm);

        self.events.emit(
            EventFamily::VmLifecycle,
            "vm_started",
            json!({
                "vm_id": params.vm_id.to_string(),
                "owner": params.owner.to_hex(),
                "vm_ip": provisioned.vm_ip.to_string(),
                "backend": self.hypervisor.name(),
            }),
        );
        self.events.emit(
            EventFamily::Resources,
            "resources_reserved",
            json!({
                "vm_id": params.vm_id.to_string(),
                "cpu_cores": params.requirements.cpu_cores(),
                "memory_mb": params.requirements.memory_mb(),
                "storage_mb": params.requirements.storage_mb(),
            }),
        );

        Ok(provisioned.vm_ip)
    }

    /// Bind the VM's packet source to a mesh tunnel session.
    ///
    /// A VM carries exactly one shuttle; binding twice is an error.
    pub async fn bind_shuttle(&self, vm_id: &VmId, tunnel: Arc<dyn TunnelSession>) -> Result<()> {
        let _ops = self.ops.lock().await;
        let vm = self.lookup(vm_id)?;

        let source = vm
            .source
            .clone()
            .ok_or_else(|| Error::StartFailed("vm has no packet source".to_string()))?;
        if vm.shuttle.lock().unwrap().is_some() {
            return Err(Error::StartFailed("shuttle already bound".to_string()));
        }

        let stream = source
            .start()
            .map_err(|e| Error::NetworkPipeCreationFailed(e.to_string()))?;
        let shuttle = Arc::new(PacketShuttle::spawn(source, stream, tunnel));
        *vm.shuttle.lock().unwrap() = Some(shuttle);
        Ok(())
    }

    /// Stop a VM and release everything it held. Idempotent: an unknown id
    /// is a successful no-op (`Ok(false)`).
    pub async fn stop_vm(&self, vm_id: &VmId) -> Result<bool> {
        let _ops = self.ops.lock().await;
        let Some(vm) = self.vms.lock().unwrap().remove(vm_id) else {
            return Ok(false);
        };
        self.teardown(&vm).await;
        Ok(true)
    }

    /// Best-effort stop of every tracked VM, for provider shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<VmId> = self.vms.lock().unwrap().keys().copied().collect();
        for vm_id in ids {
            if let Err(e) = self.stop_vm(&vm_id).await {
                tracing::warn!(%vm_id, error = %e, "failed to stop vm during shutdown");
            }
        }
    }

    pub async fn is_running(&self, vm_id: &VmId) -> bool {
        let handle = match self.lookup(vm_id) {
            Ok(vm) => vm.handle.clone(),
            Err(_) => return false,
        };
        handle.is_running().await
    }

    pub fn get_info(&self, vm_id: &VmId) -> Result<VmInfo> {
        let vm = self.lookup(vm_id)?;
        Ok(VmInfo {
            vm_id: vm.vm_id,
            owner: vm.owner,
            vm_ip: vm.vm_ip,
            created_at: vm.created_at,
            max_heartbeat_failures: vm.max_heartbeat_failures,
            pid: vm.handle.pid(),
        })
    }

    /// Probe TCP port 22 until the guest accepts, the hypervisor dies, or
    /// the deadline passes. Does not hold the ops lock.
    pub async fn wait_for_ssh(&self, vm_id: &VmId, timeout: Duration) -> Result<()> {
        let (handle, ip) = {
            let vm = self.lookup(vm_id)?;
            (vm.handle.clone(), vm.vm_ip)
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !handle.is_running().await {
                return Err(Error::StartFailed(
                    "hypervisor exited while waiting for SSH".to_string(),
                ));
            }
            if tokio::time::timeout(SSH_PROBE_TIMEOUT, TcpStream::connect((ip, SSH_PORT)))
                .await
                .is_ok_and(|r| r.is_ok())
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "ssh on {ip}:{SSH_PORT} not reachable"
                )));
            }
            tokio::time::sleep(SSH_PROBE_INTERVAL).await;
        }
    }

    pub fn contains(&self, vm_id: &VmId) -> bool {
        self.vms.lock().unwrap().contains_key(vm_id)
    }

    pub fn owner_of(&self, vm_id: &VmId) -> Option<PeerId> {
        self.vms.lock().unwrap().get(vm_id).map(|vm| vm.owner)
    }

    pub fn max_failures_of(&self, vm_id: &VmId) -> Option<u32> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .map(|vm| vm.max_heartbeat_failures)
    }

    pub fn owned_by(&self, peer: &PeerId) -> Vec<VmId> {
        self.vms
            .lock()
            .unwrap()
            .values()
            .filter(|vm| vm.owner == *peer)
            .map(|vm| vm.vm_id)
            .collect()
    }

    /// Active VMs grouped by owning peer.
    pub fn owners_snapshot(&self) -> HashMap<PeerId, Vec<VmId>> {
        let mut groups: HashMap<PeerId, Vec<VmId>> = HashMap::new();
        for vm in self.vms.lock().unwrap().values() {
            groups.entry(vm.owner).or_default().push(vm.vm_id);
        }
        groups
    }

    pub fn count(&self) -> usize {
        self.vms.lock().unwrap().len()
    }

    fn lookup(&self, vm_id: &VmId) -> Result<Arc<ActiveVm>> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or(Error::VmNotFound(*vm_id))
    }

    fn seed_spec(&self, params: &StartVmParams, provisioned: &Provisioned) -> CloudInitSpec {
        let short_id = params.vm_id.simple().to_string();
        let network = match provisioned.attachment {
            // NAT mode leaves addressing to the hypervisor's DHCP.
            NetAttachment::Nat => None,
            _ => Some(StaticNetwork {
                address: provisioned.vm_ip,
                prefix_len: 24,
                gateway: provisioned.gateway,
                dns: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            }),
        };
        CloudInitSpec {
            instance_id: params.vm_id.to_string(),
            hostname: format!("vm-{}", &short_id[..8]),
            ssh_user: params.ssh_user.clone(),
            ssh_public_key: params.ssh_public_key.clone(),
            network,
            lockdown: self.config.test_mode,
        }
    }

    async fn provision_endpoint(&self, params: &StartVmParams) -> Result<Provisioned> {
        match self.hypervisor.network_mode() {
            NetworkMode::Tap => self.provision_tap(params).await,
            NetworkMode::FileHandle => self.provision_dgram(params),
        }
    }

    #[cfg(target_os = "linux")]
    async fn provision_tap(&self, params: &StartVmParams) -> Result<Provisioned> {
        let subnet = self
            .tap
            .pool
            .allocate()
            .map_err(|_| Error::InsufficientResources("TAP subnet pool exhausted".to_string()))?;

        let short_id = params.vm_id.simple().to_string();
        let interface = format!("tap-{}", &short_id[..8]);

        let device = match omerta_net::TapDevice::create(&interface) {
            Ok(device) => device,
            Err(e) => {
                self.tap.pool.release(subnet);
                return Err(Error::TapCreationFailed(e.to_string()));
            }
        };

        if let Err(e) = self.tap.host.configure_tap(&interface, &subnet).await {
            drop(device);
            self.tap.host.delete_tap(&interface).await;
            self.tap.pool.release(subnet);
            return Err(Error::TapCreationFailed(e.to_string()));
        }

        let uplink = match self.tap.host.install_forwarding(&interface, &subnet).await {
            Ok(uplink) => Some(uplink),
            Err(e) => {
                drop(device);
                self.tap.host.delete_tap(&interface).await;
                self.tap.pool.release(subnet);
                return Err(Error::TapCreationFailed(e.to_string()));
            }
        };

        let vm_ip = params.vpn_ip.unwrap_or_else(|| subnet.guest());
        Ok(Provisioned {
            source: Some(Arc::new(PacketSource::tap(device))),
            attachment: NetAttachment::Tap {
                interface: interface.clone(),
            },
            vm_ip,
            gateway: subnet.gateway(),
            endpoint: Endpoint::Tap {
                interface,
                subnet,
                uplink,
            },
        })
    }

    #[cfg(not(target_os = "linux"))]
    async fn provision_tap(&self, _params: &StartVmParams) -> Result<Provisioned> {
        Err(Error::PlatformNotSupported(
            "TAP endpoints are Linux-only".to_string(),
        ))
    }

    fn provision_dgram(&self, params: &StartVmParams) -> Result<Provisioned> {
        let vm_ip = params.vpn_ip.ok_or_else(|| {
            Error::MissingConfig("vm_vpn_ip is required for the file-handle attachment".to_string())
        })?;
        let octets = vm_ip.octets();
        let gateway = Ipv4Addr::new(octets[0], octets[1], octets[2], 1);

        if self.config.reverse_tunnel {
            return Ok(Provisioned {
                endpoint: Endpoint::Nat,
                source: None,
                attachment: NetAttachment::Nat,
                vm_ip,
                gateway,
            });
        }

        let (device, guest_fd) = DgramSocketDevice::create()
            .map_err(|e| Error::NetworkPipeCreationFailed(e.to_string()))?;
        let guest_fd = Arc::new(guest_fd);

        Ok(Provisioned {
            source: Some(Arc::new(PacketSource::dgram(device))),
            attachment: NetAttachment::FileHandle {
                guest_fd: guest_fd.clone(),
            },
            vm_ip,
            gateway,
            endpoint: Endpoint::Dgram {
                _guest_fd: guest_fd,
            },
        })
    }

    async fn teardown(&self, vm: &ActiveVm) {
        let shuttle = vm.shuttle.lock().unwrap().take();
        if let Some(shuttle) = shuttle {
            shuttle.stop().await;
        }
        if let Some(source) = &vm.source {
            source.stop();
        }

        if let Err(e) = vm.handle.stop(STOP_GRACE).await {
            tracing::warn!(vm_id = %vm.vm_id, error = %e, "hypervisor stop failed");
        }

        self.teardown_endpoint(&vm.endpoint, vm.source.as_deref()).await;
        self.scrub_disk_dir(&vm.disk_dir).await;

        self.events.emit(
            EventFamily::VmLifecycle,
            "vm_stopped",
            json!({
                "vm_id": vm.vm_id.to_string(),
                "owner": vm.owner.to_hex(),
            }),
        );
        self.events.emit(
            EventFamily::Resources,
            "resources_released",
            json!({ "vm_id": vm.vm_id.to_string() }),
        );
    }

    #[allow(unused_variables)]
    async fn teardown_endpoint(&self, endpoint: &Endpoint, source: Option<&PacketSource>) {
        if let Some(source) = source {
            source.stop();
        }
        match endpoint {
            #[cfg(target_os = "linux")]
            Endpoint::Tap {
                interface,
                subnet,
                uplink,
            } => {
                if let Some(uplink) = uplink {
                    self.tap
                        .host
                        .remove_forwarding(interface, subnet, uplink)
                        .await;
                }
                self.tap.host.delete_tap(interface).await;
                self.tap.pool.release(*subnet);
            }
            Endpoint::Dgram { .. } | Endpoint::Nat => {}
        }
    }

    async fn scrub_disk_dir(&self, disk_dir: &PathBuf) {
        if let Err(e) = tokio::fs::remove_dir_all(disk_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %disk_dir.display(), error = %e, "failed to remove vm disk dir");
            }
        }
    }
}
