//! VM-side networking for the omerta provider.
//!
//! Each VM gets a frame device (TAP on Linux, datagram socketpair on macOS),
//! wrapped in a [`PacketSource`] that yields a packet stream, and a
//! [`PacketShuttle`] that pumps packets between that source and the mesh
//! tunnel session addressed to the owning peer. The datagram path also runs
//! a minimal virtual gateway answering ARP on behalf of the host.

mod error;
mod frame_io;
mod gateway;
mod shuttle;
mod socketpair;
mod source;
mod subnet;

#[cfg(target_os = "linux")]
mod host;
#[cfg(target_os = "linux")]
mod tap;

pub use error::{NetError, Result};
pub use frame_io::FrameIo;
pub use gateway::{GATEWAY_MAC, Outbound, VirtualGateway};
pub use shuttle::{PacketShuttle, ShuttleSnapshot};
pub use socketpair::DgramSocketDevice;
pub use source::{PacketSource, PacketStream};
pub use subnet::{SUBNET_POOL_SIZE, SubnetPool, TapSubnet};

#[cfg(target_os = "linux")]
pub use host::HostNetwork;
#[cfg(target_os = "linux")]
pub use tap::TapDevice;
