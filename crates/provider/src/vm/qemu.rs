//! QEMU/KVM backend (Linux).
//!
//! Overlays are QCOW2 files backed by the immutable base image, created
//! with `qemu-img`. The VM runs as a `qemu-system-<arch>` child process:
//! KVM acceleration when `/dev/kvm` is openable, TCG otherwise; UEFI
//! firmware on aarch64; virtio for the overlay disk, the read-only seed
//! ISO and the TAP-backed NIC. Serial output lands in the VM disk dir next
//! to the pid file.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use omerta_core::hypervisor::{Hypervisor, LaunchSpec, NetAttachment, NetworkMode, VmHandle};
use omerta_core::{Error, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const AARCH64_FIRMWARE_PATHS: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI.fd",
];

pub struct QemuBackend {
    qemu_system: Option<PathBuf>,
    qemu_img: Option<PathBuf>,
    arch: &'static str,
}

impl QemuBackend {
    pub fn new() -> Self {
        let arch = std::env::consts::ARCH;
        Self {
            qemu_system: which::which(format!("qemu-system-{arch}")).ok(),
            qemu_img: which::which("qemu-img").ok(),
            arch,
        }
    }

    fn kvm_available() -> bool {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .is_ok()
    }

    fn pid_file(spec: &LaunchSpec) -> PathBuf {
        spec.disk_dir.join("qemu.pid")
    }

    fn build_args(&self, spec: &LaunchSpec, interface: &str, kvm: bool) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-name".into(),
            format!("omerta-{}", spec.vm_id.simple()),
            "-m".into(),
            format!("{}M", spec.memory_mb),
            "-smp".into(),
            spec.cpu_cores.to_string(),
            "-display".into(),
            "none".into(),
        ];

        if kvm {
            args.push("-enable-kvm".into());
            args.extend(["-cpu".into(), "host".into()]);
        } else {
            args.extend(["-accel".into(), "tcg".into(), "-cpu".into(), "max".into()]);
        }

        if self.arch == "aarch64" {
            args.extend(["-machine".into(), "virt".into()]);
            if let Some(firmware) = AARCH64_FIRMWARE_PATHS.iter().find(|p| Path::new(p).exists())
            {
                args.extend(["-bios".into(), (*firmware).into()]);
            }
        }

        args.extend([
            "-drive".into(),
            format!(
                "file={},if=virtio,format=qcow2,media=disk",
                spec.overlay.display()
            ),
            "-drive".into(),
            format!(
                "file={},if=virtio,format=raw,media=cdrom,readonly=on",
                spec.seed_iso.display()
            ),
            "-netdev".into(),
            format!("tap,id=net0,ifname={interface},script=no,downscript=no"),
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-serial".into(),
            "stdio".into(),
            "-pidfile".into(),
            Self::pid_file(spec).display().to_string(),
        ]);

        args
    }
}

impl Default for QemuBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn is_available(&self) -> bool {
        self.qemu_system.is_some() && self.qemu_img.is_some()
    }

    fn network_mode(&self) -> NetworkMode {
        NetworkMode::Tap
    }

    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        let qemu_img = self
            .qemu_img
            .as_ref()
            .ok_or_else(|| Error::PlatformNotSupported("qemu-img not found".to_string()))?;

        let output = Command::new(qemu_img)
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(base)
            .arg(overlay)
            .output()
            .await
            .map_err(|e| Error::OverlayCreationFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::OverlayCreationFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn VmHandle>> {
        let qemu = self
            .qemu_system
            .as_ref()
            .ok_or_else(|| Error::PlatformNotSupported(format!(
                "qemu-system-{} not found",
                self.arch
            )))?;

        let NetAttachment::Tap { interface } = &spec.network else {
            return Err(Error::StartFailed(
                "qemu backend requires a TAP attachment".to_string(),
            ));
        };

        let kvm = Self::kvm_available();
        let args = self.build_args(spec, interface, kvm);
        tracing::debug!(vm_id = %spec.vm_id, kvm, ?args, "launching qemu");

        let serial_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.disk_dir.join("serial.log"))?;
        let stderr_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.disk_dir.join("stderr.log"))?;

        let child = Command::new(qemu)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(serial_log))
            .stderr(Stdio::from(stderr_log))
            .spawn()
            .map_err(|e| Error::StartFailed(format!("failed to spawn qemu: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::StartFailed("qemu exited before launch completed".to_string()))?;

        tracing::info!(vm_id = %spec.vm_id, pid, "qemu started");
        Ok(Box::new(QemuVmHandle {
            child: Arc::new(Mutex::new(child)),
            pid,
            running: AtomicBool::new(true),
        }))
    }
}

struct QemuVmHandle {
    child: Arc<Mutex<Child>>,
    pid: u32,
    running: AtomicBool,
}

#[async_trait]
impl VmHandle for QemuVmHandle {
    async fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let _ = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(pid = self.pid, "qemu ignored SIGTERM, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| Error::StopFailed(e.to_string()))?;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}
