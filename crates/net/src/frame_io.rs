use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Abstraction for ethernet frame transport.
///
/// Lets the packet source work with different frame devices: TAP on Linux,
/// datagram socketpairs on macOS. Handles are shared between one reader
/// task and any number of writers, so both operations take `&self`.
#[async_trait]
pub trait FrameIo: Send + Sync + 'static {
    /// Maximum transmission unit (typically 1500 for ethernet).
    fn mtu(&self) -> usize {
        1500
    }

    /// Receive one frame into `buf`, waiting until one is available.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one frame, retrying on `EAGAIN` and short writes.
    async fn send(&self, frame: &[u8]) -> io::Result<()>;
}

/// Back-off applied between send retries when the device is saturated.
pub(crate) const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);
pub(crate) const SEND_RETRY_LIMIT: u32 = 16;
