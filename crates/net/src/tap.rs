//! TAP device for Linux VM networking.
//!
//! Opens the kernel tuntap device and attaches it to a named interface in
//! TAP (L2) mode with no packet-info header. The interface exists while the
//! descriptor stays open; host-side addressing and forwarding are handled
//! separately by [`crate::HostNetwork`].

use crate::frame_io::{FrameIo, SEND_RETRY_DELAY, SEND_RETRY_LIMIT};
use async_trait::async_trait;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

const TUN_DEVICE: &str = "/dev/net/tun";

// From <linux/if_tun.h>.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[derive(Debug)]
pub struct TapDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TapDevice {
    /// Create a TAP interface with the given name.
    ///
    /// Requires `CAP_NET_ADMIN`. The interface disappears when the returned
    /// device is dropped.
    pub fn create(name: &str) -> io::Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name too long: {name}"),
            ));
        }

        let path = CString::new(TUN_DEVICE).map_err(io::Error::other)?;
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[async_trait]
impl FrameIo for TapDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
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
        // TAP writes are frame-atomic; a short write means the frame was
        // truncated and must be resubmitted whole.
        let mut attempts = 0;
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.as_raw_fd(), frame.as_ptr() as *const _, frame.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    attempts += 1;
                    if attempts >= SEND_RETRY_LIMIT {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short TAP write: {n} of {}", frame.len()),
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
