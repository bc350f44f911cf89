use crate::VmId;
use crate::peer::PeerId;
use std::path::PathBuf;

/// Errors surfaced by the provider core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base disk image not found: {}", .0.display())]
    DiskImageNotFound(PathBuf),

    #[error("overlay creation failed: {0}")]
    OverlayCreationFailed(String),

    #[error("TAP interface creation failed: {0}")]
    TapCreationFailed(String),

    #[error("VM failed to start: {0}")]
    StartFailed(String),

    #[error("VM failed to stop: {0}")]
    StopFailed(String),

    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    #[error("platform not supported: {0}")]
    PlatformNotSupported(String),

    #[error("no ISO authoring tool available")]
    IsoToolNotFound,

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("network pipe creation failed: {0}")]
    NetworkPipeCreationFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the mesh transport contract.
///
/// The overlay itself is an external collaborator; these are the only
/// failure modes the provider observes through it.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("peer {0} is not reachable")]
    PeerUnreachable(PeerId),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("mesh is shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_disk_image() {
        let err = Error::DiskImageNotFound(PathBuf::from("/tmp/base.qcow2"));
        assert_eq!(err.to_string(), "base disk image not found: /tmp/base.qcow2");
    }

    #[test]
    fn error_display_vm_not_found() {
        let id: VmId = "6fa459ea-ee8a-3ca4-894e-db77e160355e".parse().unwrap();
        let err = Error::VmNotFound(id);
        assert_eq!(
            err.to_string(),
            "VM not found: 6fa459ea-ee8a-3ca4-894e-db77e160355e"
        );
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn mesh_error_wraps_into_core_error() {
        let err: Error = MeshError::TunnelClosed.into();
        assert_eq!(err.to_string(), "mesh error: tunnel closed");
    }
}
