pub mod error;
pub mod hypervisor;
pub mod mesh;
pub mod message;
pub mod peer;
pub mod resources;

pub use error::{Error, MeshError, Result};
pub use hypervisor::{Hypervisor, LaunchSpec, NetAttachment, NetworkMode, VmHandle};
pub use mesh::{Mesh, MeshEnvelope, TunnelSession};
pub use message::{ControlMessage, VmRequest};
pub use peer::PeerId;
pub use resources::ResourceRequirements;

/// Identifier of a single VM, chosen by the requesting peer.
///
/// Globally unique within one provider; string-serialized on the wire.
pub type VmId = uuid::Uuid;
