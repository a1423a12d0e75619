//! Seams to the host OS: subprocess spawning, CIFS mounts, USB gadget
//! configuration. Each seam is a trait so the state machine can be exercised
//! against recording doubles.

use crate::config::NbdDevice;
use nix::{
    mount::{MntFlags, MsFlags},
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    cell::RefCell,
    env, fs, io,
    os::unix::{fs::symlink, process::ExitStatusExt},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    rc::Rc,
};
use tokio::process::Command;
use tracing::{debug, warn};

/// Path of the nbd-client binary.
pub const NBD_CLIENT: &str = "/usr/sbin/nbd-client";
/// Path of the nbdkit binary.
pub const NBDKIT: &str = "/usr/sbin/nbdkit";

const CONFIGFS_GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget";
const UDC_CLASS_DIR: &str = "/sys/class/udc";

/// Kernel-side view of an NBD device, as reported by the device monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChange {
    Inserted,
    Removed,
    Unknown,
}

impl StateChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateChange::Inserted => "inserted",
            StateChange::Removed => "removed",
            StateChange::Unknown => "unknown",
        }
    }
}

/// Invoked once with the exit code when the subprocess ends.
pub type ExitHandler = Box<dyn FnOnce(i32)>;
/// Invoked once the subprocess has actually gone away after a stop request.
pub type StopHandler = Box<dyn FnOnce()>;

/// Running subprocess owned by a [`crate::resources::Process`].
pub trait ProcessHandle {
    /// Ask the subprocess to terminate. `done` runs on the event loop once
    /// the process has exited; if it already has, `done` is scheduled for
    /// the next loop turn.
    fn stop(self: Box<Self>, done: StopHandler);
}

/// Spawns external programs by path.
pub trait Spawner {
    fn spawn(
        &self,
        name: &str,
        path: &Path,
        args: &[String],
        on_exit: ExitHandler,
    ) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Performs CIFS mount and unmount syscalls.
pub trait SmbMounter {
    fn mount(&self, remote: &Path, target: &Path, options: &str) -> io::Result<()>;
    fn unmount(&self, target: &Path) -> io::Result<()>;
    /// Detaching unmount used when reclaiming stale state at startup.
    fn force_unmount(&self, target: &Path) -> io::Result<()>;
}

/// Configures the USB mass-storage gadget for an NBD device.
///
/// `configure` returns 0 on success, mirroring the sysfs helper it wraps;
/// callers decide whether a non-zero status is fatal.
pub trait UsbGadget {
    fn configure(&self, name: &str, nbd: &NbdDevice, state: StateChange, rw: bool) -> i32;
    /// Opaque I/O counter string; any change means the medium was touched.
    fn stats(&self, nbd: &NbdDevice) -> Option<String>;
}

/// Bundle of OS seams handed to every state machine.
#[derive(Clone)]
pub struct System {
    pub spawner: Rc<dyn Spawner>,
    pub smb: Rc<dyn SmbMounter>,
    pub gadget: Rc<dyn UsbGadget>,
    /// Root under which per-mount-point directories are created.
    pub temp_root: PathBuf,
}

impl System {
    /// Seams backed by the real host: tokio subprocesses, cifs mount(2),
    /// configfs gadget.
    pub fn host() -> Self {
        System {
            spawner: Rc::new(TokioSpawner),
            smb: Rc::new(HostSmbMounter),
            gadget: Rc::new(ConfigfsGadget),
            temp_root: env::temp_dir(),
        }
    }
}

#[derive(Default)]
struct ProcState {
    exited: bool,
    stop_waiters: Vec<StopHandler>,
}

struct TokioProcessHandle {
    pid: Option<i32>,
    state: Rc<RefCell<ProcState>>,
}

impl ProcessHandle for TokioProcessHandle {
    fn stop(self: Box<Self>, done: StopHandler) {
        if let Some(pid) = self.pid {
            if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(pid, %err, "SIGTERM delivery failed");
            }
        }
        let mut state = self.state.borrow_mut();
        if state.exited {
            drop(state);
            tokio::task::spawn_local(async move { done() });
        } else {
            state.stop_waiters.push(done);
        }
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Spawner backed by `tokio::process`. Must run inside a `LocalSet`.
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(
        &self,
        name: &str,
        path: &Path,
        args: &[String],
        on_exit: ExitHandler,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().map(|id| id as i32);
        debug!(name, path = %path.display(), ?pid, "spawned subprocess");

        let state = Rc::new(RefCell::new(ProcState::default()));
        let task_state = Rc::clone(&state);
        let name = name.to_string();
        tokio::task::spawn_local(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(&status),
                Err(err) => {
                    warn!(name = %name, %err, "waiting for subprocess failed");
                    -1
                }
            };
            on_exit(code);
            let waiters = {
                let mut state = task_state.borrow_mut();
                state.exited = true;
                std::mem::take(&mut state.stop_waiters)
            };
            for waiter in waiters {
                waiter();
            }
        });

        Ok(Box::new(TokioProcessHandle { pid, state }))
    }
}

/// CIFS mounter backed by mount(2)/umount(2).
pub struct HostSmbMounter;

impl SmbMounter for HostSmbMounter {
    fn mount(&self, remote: &Path, target: &Path, options: &str) -> io::Result<()> {
        nix::mount::mount(
            Some(remote),
            target,
            Some("cifs"),
            MsFlags::empty(),
            Some(options),
        )
        .map_err(io::Error::from)
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        nix::mount::umount(target).map_err(io::Error::from)
    }

    fn force_unmount(&self, target: &Path) -> io::Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH)
            .map_err(io::Error::from)
    }
}

/// Mass-storage gadget driven through configfs.
pub struct ConfigfsGadget;

impl ConfigfsGadget {
    fn gadget_dir(name: &str) -> PathBuf {
        Path::new(CONFIGFS_GADGET_ROOT).join(format!("mass-storage-{name}"))
    }

    fn setup(name: &str, nbd: &NbdDevice, rw: bool) -> io::Result<()> {
        let base = Self::gadget_dir(name);
        let lun = base.join("functions/mass_storage.usb0/lun.0");
        fs::create_dir_all(base.join("strings/0x409"))?;
        fs::create_dir_all(base.join("configs/c.1/strings/0x409"))?;
        fs::create_dir_all(&lun)?;

        fs::write(base.join("idVendor"), "0x1d6b")?;
        fs::write(base.join("idProduct"), "0x0104")?;
        fs::write(base.join("strings/0x409/manufacturer"), "OpenBMC")?;
        fs::write(base.join("strings/0x409/product"), "Virtual Media Device")?;
        fs::write(
            base.join("configs/c.1/strings/0x409/configuration"),
            "config 1",
        )?;
        fs::write(lun.join("removable"), "1")?;
        fs::write(lun.join("ro"), if rw { "0" } else { "1" })?;
        fs::write(lun.join("cdrom"), "0")?;
        fs::write(lun.join("file"), nbd.to_path().display().to_string())?;

        let link = base.join("configs/c.1/mass_storage.usb0");
        if !link.exists() {
            symlink(base.join("functions/mass_storage.usb0"), link)?;
        }

        let udc = first_udc()?;
        fs::write(base.join("UDC"), udc)
    }

    fn teardown(name: &str) -> io::Result<()> {
        let base = Self::gadget_dir(name);
        if !base.exists() {
            return Ok(());
        }
        // Unbind before dismantling; the write fails harmlessly when the
        // gadget was never bound.
        let _ = fs::write(base.join("UDC"), "");
        remove_if_present(&base.join("configs/c.1/mass_storage.usb0"), remove_link)?;
        remove_if_present(&base.join("configs/c.1/strings/0x409"), remove_dir)?;
        remove_if_present(&base.join("configs/c.1"), remove_dir)?;
        remove_if_present(&base.join("functions/mass_storage.usb0"), remove_dir)?;
        remove_if_present(&base.join("strings/0x409"), remove_dir)?;
        remove_if_present(&base, remove_dir)
    }
}

fn remove_link(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

fn remove_dir(path: &Path) -> io::Result<()> {
    fs::remove_dir(path)
}

fn remove_if_present(path: &Path, remove: fn(&Path) -> io::Result<()>) -> io::Result<()> {
    match remove(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn first_udc() -> io::Result<String> {
    let mut entries = fs::read_dir(UDC_CLASS_DIR)?;
    match entries.next() {
        Some(entry) => Ok(entry?.file_name().to_string_lossy().into_owned()),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no UDC available",
        )),
    }
}

impl UsbGadget for ConfigfsGadget {
    fn configure(&self, name: &str, nbd: &NbdDevice, state: StateChange, rw: bool) -> i32 {
        let result = match state {
            StateChange::Inserted => Self::setup(name, nbd, rw),
            StateChange::Removed | StateChange::Unknown => Self::teardown(name),
        };
        match result {
            Ok(()) => 0,
            Err(err) => {
                warn!(name, device = %nbd, state = state.as_str(), %err, "gadget configfs operation failed");
                -1
            }
        }
    }

    fn stats(&self, nbd: &NbdDevice) -> Option<String> {
        fs::read_to_string(nbd.sys_stat_path()).ok()
    }
}
