//! Virtualization.framework backend (macOS).
//!
//! Builds a generic ARM64 machine with an EFI boot loader backed by a
//! per-VM variable store (recreated on every launch), virtio entropy and
//! balloon devices, two virtio block devices (raw overlay + seed ISO), a
//! virtio console writing to a log file, and either the file-handle NIC
//! attachment fed by the datagram socketpair or the framework's NAT in
//! reverse-tunnel mode.
//!
//! SAFETY: VZVirtualMachine is not thread-safe and must only be touched
//! from the main queue. Every framework call below is dispatched there;
//! the machine pointer travels between closures as a raw address.

use async_trait::async_trait;
use block2::RcBlock;
use objc2::AllocAnyThread;
use objc2::rc::Retained;
use objc2_foundation::{NSArray, NSError, NSFileHandle, NSString, NSURL};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZEFIBootLoader, VZEFIVariableStore,
    VZEFIVariableStoreInitializationOptions, VZFileHandleNetworkDeviceAttachment,
    VZFileSerialPortAttachment, VZGenericPlatformConfiguration, VZNATNetworkDeviceAttachment,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioNetworkDeviceConfiguration,
    VZVirtioTraditionalMemoryBalloonDeviceConfiguration, VZVirtualMachine,
    VZVirtualMachineConfiguration, VZVirtualMachineState,
};
use omerta_core::hypervisor::{Hypervisor, LaunchSpec, NetAttachment, NetworkMode, VmHandle};
use omerta_core::{Error, Result};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Run a closure on the main dispatch queue and await its result.
async fn on_main<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    dispatch::Queue::main().exec_async(move || {
        let _ = tx.send(f());
    });
    rx.await
        .map_err(|_| Error::StartFailed("main queue is not running".to_string()))
}

pub struct VzBackend;

impl VzBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VzBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for VzBackend {
    fn name(&self) -> &'static str {
        "virtualization-framework"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn network_mode(&self) -> NetworkMode {
        NetworkMode::FileHandle
    }

    /// The framework has no QCOW2 support; the overlay is a raw copy.
    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        tokio::fs::copy(base, overlay)
            .await
            .map_err(|e| Error::OverlayCreationFailed(e.to_string()))?;
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn VmHandle>> {
        let efi_store = spec.disk_dir.join("efi-vars.fd");
        // A stale store from a previous run must not leak firmware state.
        let _ = tokio::fs::remove_file(&efi_store).await;

        let serial_log = spec.disk_dir.join("console.log");
        let overlay = spec.overlay.clone();
        let seed_iso = spec.seed_iso.clone();
        let cpus = spec.cpu_cores as usize;
        let memory_bytes = spec.memory_mb * 1024 * 1024;

        // The NIC fd crosses into the main-queue closure as a raw value;
        // the duplicate is owned by the framework's NSFileHandle.
        let nic = match &spec.network {
            NetAttachment::FileHandle { guest_fd } => {
                let dup = unsafe { libc::dup(guest_fd.as_raw_fd()) };
                if dup < 0 {
                    return Err(Error::StartFailed(
                        "failed to duplicate NIC descriptor".to_string(),
                    ));
                }
                NicMode::FileHandle(dup)
            }
            NetAttachment::Nat => NicMode::Nat,
            NetAttachment::Tap { .. } => {
                return Err(Error::StartFailed(
                    "framework backend cannot bind a TAP interface".to_string(),
                ));
            }
        };

        let vm_addr = on_main(move || {
            build_machine(
                &efi_store,
                &overlay,
                &seed_iso,
                &serial_log,
                cpus,
                memory_bytes,
                nic,
            )
        })
        .await??;

        // Start on the main queue via a continuation.
        let (start_tx, start_rx) = tokio::sync::oneshot::channel();
        on_main(move || start_machine(vm_addr, start_tx)).await?;

        match tokio::time::timeout(Duration::from_secs(30), start_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(Error::StartFailed(e)),
            Ok(Err(_)) => return Err(Error::StartFailed("VM start channel closed".to_string())),
            Err(_) => return Err(Error::StartFailed("VM start timed out".to_string())),
        }

        tracing::info!(vm_id = %spec.vm_id, "virtual machine started");
        Ok(Box::new(VzVmHandle {
            vm_addr: AtomicUsize::new(vm_addr),
            running: AtomicBool::new(true),
        }))
    }
}

enum NicMode {
    FileHandle(RawFd),
    Nat,
}

fn file_url(path: &Path) -> Result<Retained<NSURL>> {
    let s = path
        .to_str()
        .ok_or_else(|| Error::StartFailed(format!("non-UTF-8 path: {}", path.display())))?;
    Ok(unsafe { NSURL::fileURLWithPath(&NSString::from_str(s)) })
}

fn ns_error(e: &NSError) -> String {
    unsafe { e.localizedDescription().to_string() }
}

#[allow(clippy::too_many_arguments)]
fn build_machine(
    efi_store: &Path,
    overlay: &Path,
    seed_iso: &Path,
    serial_log: &Path,
    cpus: usize,
    memory_bytes: u64,
    nic: NicMode,
) -> Result<usize> {
    unsafe {
        let config = VZVirtualMachineConfiguration::new();
        config.setCPUCount(cpus);
        config.setMemorySize(memory_bytes);
        config.setPlatform(&VZGenericPlatformConfiguration::new());

        // EFI boot with a variable store created fresh for this run.
        let store = VZEFIVariableStore::initCreatingVariableStoreAtURL_options_error(
            VZEFIVariableStore::alloc(),
            &file_url(efi_store)?,
            VZEFIVariableStoreInitializationOptions::AllowOverwrite,
        )
        .map_err(|e| Error::StartFailed(format!("EFI store creation failed: {}", ns_error(&e))))?;
        let boot_loader = VZEFIBootLoader::new();
        boot_loader.setVariableStore(Some(&store));
        config.setBootLoader(Some(&boot_loader));

        let entropy = VZVirtioEntropyDeviceConfiguration::new();
        config.setEntropyDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            entropy,
        )]));

        let balloon = VZVirtioTraditionalMemoryBalloonDeviceConfiguration::new();
        config.setMemoryBalloonDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            balloon,
        )]));

        // Overlay first so it enumerates as the boot disk, then the seed.
        let overlay_attachment = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &file_url(overlay)?,
            false,
        )
        .map_err(|e| Error::StartFailed(format!("overlay attach failed: {}", ns_error(&e))))?;
        let seed_attachment = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &file_url(seed_iso)?,
            true,
        )
        .map_err(|e| Error::StartFailed(format!("seed attach failed: {}", ns_error(&e))))?;
        let overlay_disk = VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &overlay_attachment,
        );
        let seed_disk = VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &seed_attachment,
        );
        config.setStorageDevices(&NSArray::from_retained_slice(&[
            Retained::into_super(overlay_disk),
            Retained::into_super(seed_disk),
        ]));

        let net_config = VZVirtioNetworkDeviceConfiguration::new();
        match nic {
            NicMode::FileHandle(fd) => {
                let handle = NSFileHandle::initWithFileDescriptor(NSFileHandle::alloc(), fd);
                let attachment = VZFileHandleNetworkDeviceAttachment::initWithFileHandle(
                    VZFileHandleNetworkDeviceAttachment::alloc(),
                    &handle,
                );
                net_config.setAttachment(Some(&attachment));
            }
            NicMode::Nat => {
                net_config.setAttachment(Some(&VZNATNetworkDeviceAttachment::new()));
            }
        }
        config.setNetworkDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            net_config,
        )]));

        let serial_attachment = VZFileSerialPortAttachment::initWithURL_append_error(
            VZFileSerialPortAttachment::alloc(),
            &file_url(serial_log)?,
            true,
        )
        .map_err(|e| Error::StartFailed(format!("serial log attach failed: {}", ns_error(&e))))?;
        let serial_config = VZVirtioConsoleDeviceSerialPortConfiguration::new();
        serial_config.setAttachment(Some(&serial_attachment));
        config.setSerialPorts(&NSArray::from_retained_slice(&[Retained::into_super(
            serial_config,
        )]));

        config
            .validateWithError()
            .map_err(|e| Error::StartFailed(format!("configuration invalid: {}", ns_error(&e))))?;

        let vm = VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), &config);
        Ok(Retained::into_raw(vm) as usize)
    }
}

fn start_machine(
    vm_addr: usize,
    result_tx: tokio::sync::oneshot::Sender<std::result::Result<(), String>>,
) {
    unsafe {
        let ptr = vm_addr as *mut VZVirtualMachine;

        // The completion handler is a Fn block but fires exactly once.
        let result_tx = std::sync::Mutex::new(Some(result_tx));
        let completion = RcBlock::new(move |error: *mut NSError| {
            if let Some(tx) = result_tx.lock().unwrap().take() {
                if error.is_null() {
                    let _ = tx.send(Ok(()));
                } else {
                    let _ = tx.send(Err(ns_error(&*error)));
                }
            }
        });
        std::mem::forget(completion.clone());

        (*ptr).startWithCompletionHandler(&completion);
    }
}

struct VzVmHandle {
    vm_addr: AtomicUsize,
    running: AtomicBool,
}

impl Drop for VzVmHandle {
    fn drop(&mut self) {
        let addr = self.vm_addr.swap(0, Ordering::SeqCst);
        if addr != 0 {
            dispatch::Queue::main().exec_async(move || unsafe {
                let _ = Retained::from_raw(addr as *mut VZVirtualMachine);
            });
        }
    }
}

#[async_trait]
impl VmHandle for VzVmHandle {
    async fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let addr = self.vm_addr.load(Ordering::SeqCst);
        let state = on_main(move || unsafe { (*(addr as *const VZVirtualMachine)).state() }).await;
        match state {
            Ok(VZVirtualMachineState::Stopped | VZVirtualMachineState::Error) => {
                self.running.store(false, Ordering::SeqCst);
                false
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let addr = self.vm_addr.load(Ordering::SeqCst);
        if addr == 0 || !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Ask the guest first.
        let _ = on_main(move || unsafe {
            let vm = addr as *const VZVirtualMachine;
            if (*vm).canRequestStop() {
                let _ = (*vm).requestStopWithError();
            }
        })
        .await;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Hard stop with a continuation, like start.
        let (tx, rx) = tokio::sync::oneshot::channel::<bool>();
        let _ = on_main(move || unsafe {
            let vm = addr as *const VZVirtualMachine;
            let tx = std::sync::Mutex::new(Some(tx));
            let completion = RcBlock::new(move |error: *mut NSError| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(error.is_null());
                }
            });
            std::mem::forget(completion.clone());
            (*vm).stopWithCompletionHandler(&completion);
        })
        .await;

        let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}
