use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("packet source already started")]
    AlreadyStarted,

    #[error("packet source not started")]
    NotStarted,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("TAP interface creation failed: {0}")]
    TapCreation(String),

    #[error("socket pair creation failed: {0}")]
    SocketPairCreation(String),

    #[error("no free TAP subnet")]
    SubnetPoolExhausted,

    #[error("host command `{command}` failed: {stderr}")]
    HostCommand { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
