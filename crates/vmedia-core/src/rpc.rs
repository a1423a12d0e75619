//! Blocking Mount/Unmount RPCs over the event-driven core.
//!
//! An RPC emits its event synchronously, then polls the machine every
//! 100 ms until it reaches the expected terminal state, bounded by
//! `(timeout + 5 s) / 100 ms`.

use crate::{
    config::{Mode, POLL_PERIOD, TIMEOUT_GRACE_SECS},
    credentials::{secure_cleanup, CredentialsProvider, SECRET_LIMIT},
    error::Error,
    machine::{Event, MountPointStateMachine, Target},
};
use std::{
    cell::RefCell,
    io::Read,
    os::fd::OwnedFd,
    path::PathBuf,
    rc::Rc,
};
use tokio::time::sleep;
use tracing::{debug, error, info};

enum MountOutcome {
    Ready(Option<Error>),
    Active,
}

/// Bus-facing object for one mount point: methods and properties of the
/// MountPoint, Process, and service interfaces.
#[derive(Clone)]
pub struct MountPointRpc {
    machine: Rc<RefCell<MountPointStateMachine>>,
}

impl MountPointRpc {
    pub fn new(machine: Rc<RefCell<MountPointStateMachine>>) -> Self {
        MountPointRpc { machine }
    }

    /// Legacy `Mount(imgUrl, rw, fd)`. The optional descriptor carries the
    /// `user\0pass\0` secret payload.
    pub async fn mount(
        &self,
        img_url: &str,
        rw: bool,
        fd: Option<OwnedFd>,
    ) -> Result<bool, Error> {
        {
            let machine = self.machine.borrow();
            info!(name = %machine.name(), url = img_url, "Mount called");
            if machine.config().mode != Mode::Legacy {
                return Err(Error::NotSupported(
                    "Mount with arguments requires legacy mode".into(),
                ));
            }
        }

        let credentials = match fd {
            Some(fd) => {
                debug!("extra data available");
                Some(read_secret_pipe(fd)?)
            }
            None => None,
        };

        let target = Target::new(img_url.to_string(), rw, credentials);
        let result = self.do_mount(Some(target)).await;
        // The secret must not linger in the machine past the RPC.
        self.machine.borrow_mut().clear_credentials();
        debug!(ok = result.as_ref().map(|v| *v).unwrap_or(false), "mount completed");
        result
    }

    /// Proxy `Mount()`: no image payload, the NBD source is pre-negotiated.
    pub async fn mount_proxy(&self) -> Result<bool, Error> {
        {
            let machine = self.machine.borrow();
            info!(name = %machine.name(), "Mount called");
            if machine.config().mode != Mode::Proxy {
                return Err(Error::NotSupported(
                    "Argument-less mount requires proxy mode".into(),
                ));
            }
        }
        self.do_mount(None).await
    }

    pub async fn unmount(&self) -> Result<bool, Error> {
        info!(name = %self.machine.borrow().name(), "Unmount called");
        self.machine.borrow_mut().emit(Event::Unmount)?;

        match self.wait_for(|machine| machine.ready_error().map(|_| ())).await {
            Some(()) => {
                debug!("unmount ok");
                Ok(true)
            }
            None => {
                error!("timed out when waiting for ready state");
                Err(Error::Busy("Timed out when waiting for ready state".into()))
            }
        }
    }

    async fn do_mount(&self, target: Option<Target>) -> Result<bool, Error> {
        {
            let mut machine = self.machine.borrow_mut();
            machine.emit(Event::Mount(target))?;
            if machine.config().mode == Mode::Legacy {
                machine.notification_start();
            }
        }

        let outcome = self
            .wait_for(|machine| {
                if let Some(error) = machine.ready_error() {
                    return Some(MountOutcome::Ready(error));
                }
                if machine.is_active() {
                    return Some(MountOutcome::Active);
                }
                None
            })
            .await;

        match outcome {
            Some(MountOutcome::Active) => {
                debug!("mount ok");
                Ok(true)
            }
            Some(MountOutcome::Ready(Some(error))) => {
                self.machine.borrow_mut().notify(error.errno());
                Err(error)
            }
            Some(MountOutcome::Ready(None)) => {
                error!("mount failed");
                self.machine.borrow_mut().notify(0);
                Ok(false)
            }
            None => {
                error!("timed out when waiting for active state");
                Err(Error::Busy("Timed out when waiting for active state".into()))
            }
        }
    }

    async fn wait_for<T>(
        &self,
        check: impl Fn(&MountPointStateMachine) -> Option<T>,
    ) -> Option<T> {
        let wait_cnt = {
            let machine = self.machine.borrow();
            (machine.config().timeout_secs() + TIMEOUT_GRACE_SECS) * 1000
                / POLL_PERIOD.as_millis() as u64
        };
        for _ in 0..wait_cnt {
            if let Some(value) = check(&self.machine.borrow()) {
                return Some(value);
            }
            sleep(POLL_PERIOD).await;
        }
        None
    }

    // MountPoint interface properties.

    pub fn device(&self) -> String {
        self.machine
            .borrow()
            .config()
            .nbd_device
            .to_path()
            .display()
            .to_string()
    }

    pub fn endpoint_id(&self) -> String {
        self.machine.borrow().config().endpoint_id.clone()
    }

    pub fn socket(&self) -> PathBuf {
        self.machine.borrow().config().unix_socket.clone()
    }

    /// Empty when no target is mounted.
    pub fn image_url(&self) -> String {
        self.machine
            .borrow()
            .target()
            .map(|target| target.img_url.clone())
            .unwrap_or_default()
    }

    /// Defaults to write-protected when nothing is mounted.
    pub fn write_protected(&self) -> bool {
        self.machine
            .borrow()
            .target()
            .map(|target| !target.rw)
            .unwrap_or(true)
    }

    pub fn timeout(&self) -> u64 {
        self.machine.borrow().config().timeout_secs()
    }

    pub fn remaining_inactivity_timeout(&self) -> u64 {
        self.machine.borrow().remaining_inactivity_timeout()
    }

    /// The property is read-only on the bus.
    pub fn set_remaining_inactivity_timeout(&self, _value: u64) -> Result<(), Error> {
        Err(Error::NotPermitted(
            "Setting RemainingInactivityTimeout property is not allowed".into(),
        ))
    }

    // Process interface properties.

    pub fn active(&self) -> bool {
        self.machine.borrow().is_active()
    }

    pub fn exit_code(&self) -> i32 {
        self.machine.borrow().exit_code()
    }
}

/// Read and split the secret payload from a descriptor passed with the
/// Mount call. The scratch buffer is wiped before returning.
fn read_secret_pipe(fd: OwnedFd) -> Result<CredentialsProvider, Error> {
    let mut file = std::fs::File::from(fd);
    let mut buf = [0u8; SECRET_LIMIT + 1];
    let read = file
        .read(&mut buf)
        .map_err(|err| Error::from_io(&err, "read secret pipe"))?;
    let result = CredentialsProvider::from_secret_pipe(&buf[..read]);
    secure_cleanup(&mut buf);
    result
}
