//! Hypervisor backend contract.
//!
//! Two backends exist: QEMU/KVM on Linux and the Virtualization framework
//! on macOS. Both take a prepared overlay disk plus seed ISO and yield a
//! handle with a common stop contract.

use crate::VmId;
use crate::error::Result;
use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which endpoint family a backend consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Backend binds to a host TAP interface.
    Tap,
    /// Backend takes the guest end of a datagram socketpair.
    FileHandle,
}

/// How the VM's virtual NIC is attached to the host.
#[derive(Debug, Clone)]
pub enum NetAttachment {
    /// A host TAP interface, already created and configured (Linux).
    Tap { interface: String },
    /// Guest end of a datagram socketpair, handed to the hypervisor as a
    /// file-handle NIC backend (macOS).
    FileHandle { guest_fd: Arc<OwnedFd> },
    /// Hypervisor-provided NAT; used in reverse-tunnel mode only.
    Nat,
}

/// Everything a backend needs to launch one VM.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub vm_id: VmId,
    /// Copy-on-write overlay (QCOW2) or raw working copy, backend-specific.
    pub overlay: PathBuf,
    /// Cloud-init seed ISO, attached read-only.
    pub seed_iso: PathBuf,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub network: NetAttachment,
    /// Per-VM scratch directory for pid file, serial logs and EFI store.
    pub disk_dir: PathBuf,
}

/// Handle to a launched VM.
#[async_trait]
pub trait VmHandle: Send + Sync {
    async fn is_running(&self) -> bool;

    /// Stop the VM: graceful signal first, hard kill after `grace`.
    async fn stop(&self, grace: Duration) -> Result<()>;

    /// Host process id, when the backend runs the VM as a child process.
    fn pid(&self) -> Option<u32>;
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// The endpoint family this backend expects in [`LaunchSpec::network`].
    fn network_mode(&self) -> NetworkMode;

    /// Create the per-VM disk from the immutable base image.
    ///
    /// QEMU builds a QCOW2 overlay backed by `base`; the framework backend
    /// has no QCOW2 support and takes a raw copy instead.
    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()>;

    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn VmHandle>>;
}
