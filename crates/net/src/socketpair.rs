//! Frame I/O via Unix socketpair for the macOS Virtualization framework.
//!
//! Creates a SOCK_DGRAM socketpair where each message is one ethernet
//! frame — kernel datagram boundaries are the framing, never a length
//! prefix. One end is kept by this device for the host side, the other is
//! handed to the hypervisor's file-handle NIC attachment.

use crate::error::{NetError, Result};
use crate::frame_io::{FrameIo, SEND_RETRY_DELAY, SEND_RETRY_LIMIT};
use async_trait::async_trait;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

pub struct DgramSocketDevice {
    fd: AsyncFd<OwnedFd>,
}

impl DgramSocketDevice {
    /// Create a new socketpair device.
    ///
    /// Returns `(host_device, guest_fd)`; the guest fd goes to the
    /// hypervisor as the VM's NIC backend.
    pub fn create() -> Result<(Self, OwnedFd)> {
        let mut fds: [RawFd; 2] = [-1, -1];

        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(NetError::SocketPairCreation(
                io::Error::last_os_error().to_string(),
            ));
        }

        let host_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let guest_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        set_nonblocking(&host_fd)?;

        let fd = AsyncFd::new(host_fd).map_err(NetError::Io)?;
        Ok((Self { fd }, guest_fd))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[async_trait]
impl FrameIo for DgramSocketDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(inner.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len(), 0)
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        // Datagram sends are all-or-nothing; a short count should not
        // happen, but resubmit the whole frame if it does.
        let mut attempts = 0;
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::send(inner.as_raw_fd(), frame.as_ptr() as *const _, frame.len(), 0)
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(_)) => {
                    attempts += 1;
                    if attempts >= SEND_RETRY_LIMIT {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "incomplete frame send",
                        ));
                    }
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(NetError::Io(io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(NetError::Io(io::Error::last_os_error()));
    }
    Ok(())
}
