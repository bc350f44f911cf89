//! Omerta VM provider daemon.
//!
//! A provider node accepts VM requests from remote peers over an
//! encrypted mesh, launches isolated Linux VMs (QEMU/KVM on Linux, the
//! Virtualization framework on macOS), carries each VM's traffic back to
//! the requesting peer over a per-peer tunnel session, and reclaims VMs
//! when the requester stops answering heartbeats.
//!
//! The mesh overlay itself is an external collaborator: embedders provide
//! implementations of [`omerta_core::Mesh`] and feed received envelopes
//! into [`ProviderDaemon::start`].

pub mod cloudinit;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod events;
pub mod filter;
pub mod heartbeat;
pub mod test_support;
pub mod tunnel_monitor;
pub mod udp_control;
pub mod vm;

pub use cloudinit::{CloudInitAuthor, CloudInitSpec, StaticNetwork};
pub use config::ProviderConfig;
pub use daemon::ProviderDaemon;
pub use dispatch::RequestDispatcher;
pub use events::{EventFamily, EventLogger};
pub use filter::{
    AcceptBasis, DefaultAction, FilterDecision, FilterEngine, FilterRequest, QuietHoursAction,
    Rule, RuleKind,
};
pub use heartbeat::{HeartbeatConfig, HeartbeatLoop};
pub use tunnel_monitor::{TunnelHealthConfig, TunnelHealthMonitor};
pub use udp_control::{ControlEnvelope, SealedCipher, UdpControlServer};
pub use vm::{StartVmParams, VmInfo, VmManager};

#[cfg(target_os = "linux")]
pub use vm::QemuBackend;
#[cfg(target_os = "macos")]
pub use vm::VzBackend;
