//! Scoped resources with guaranteed release.
//!
//! Constructors acquire or fail without leaving artefacts behind. Drop
//! implementations release unconditionally; failures are logged, never
//! propagated. Back-references to the owning machine are [`MachineHandle`]s,
//! so a resource can outlive the state that created it without keeping the
//! machine alive.

use crate::{
    config::NbdDevice,
    credentials::CredentialsProvider,
    error::Error,
    machine::{Event, MachineHandle},
    smb::SmbShare,
    system::{ExitHandler, ProcessHandle, SmbMounter, Spawner, StateChange, UsbGadget},
};
use std::{
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};
use tracing::{debug, error};

/// Freshly created empty directory under the temp root; removed on drop.
#[derive(Debug)]
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    pub fn create(root: &Path, name: &str) -> Result<Self, Error> {
        let path = root.join(name);
        if let Err(err) = fs::create_dir(&path) {
            error!(path = %path.display(), %err, "unable to create mount directory");
            return Err(Error::from_io(&err, "Failed to create mount directory"));
        }
        Ok(Directory { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            error!(path = %self.path.display(), %err, "unable to remove directory");
        }
    }
}

/// Live CIFS mount over an owned [`Directory`]; unmounted on drop.
pub struct Mount {
    directory: Directory,
    smb: Rc<dyn SmbMounter>,
}

impl Mount {
    pub fn new(
        directory: Directory,
        smb: Rc<dyn SmbMounter>,
        remote: &Path,
        rw: bool,
        credentials: Option<&mut CredentialsProvider>,
    ) -> Result<Self, Error> {
        SmbShare::new(directory.path()).mount(&*smb, remote, rw, credentials)?;
        Ok(Mount { directory, smb })
    }

    pub fn path(&self) -> &Path {
        self.directory.path()
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Err(err) = self.smb.unmount(self.directory.path()) {
            error!(path = %self.directory.path().display(), %err, "unable to unmount directory");
        }
    }
}

/// Running subprocess. Destruction is two-phase: drop requests the stop and
/// the machine is informed by `SubprocessStoppedEvent` once the subprocess
/// has actually exited.
pub struct Process {
    machine: MachineHandle,
    handle: Option<Box<dyn ProcessHandle>>,
}

impl Process {
    pub fn spawn(
        machine: MachineHandle,
        spawner: &dyn Spawner,
        path: &Path,
        args: &[String],
        on_exit: ExitHandler,
    ) -> Result<Self, Error> {
        let handle = spawner
            .spawn(machine.name(), path, args, on_exit)
            .map_err(|err| {
                error!(name = %machine.name(), path = %path.display(), %err, "failed to spawn process");
                Error::OperationCanceled(format!("Failed to spawn process: {err}"))
            })?;
        Ok(Process {
            machine,
            handle: Some(handle),
        })
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(name = %self.machine.name(), "stopping subprocess");
            let machine = self.machine.clone();
            handle.stop(Box::new(move || {
                machine.post(Event::SubprocessStopped);
            }));
        }
    }
}

/// Configured USB gadget; torn down on drop.
pub struct Gadget {
    machine: MachineHandle,
    gadget: Rc<dyn UsbGadget>,
    nbd: NbdDevice,
}

impl Gadget {
    pub fn new(
        machine: MachineHandle,
        gadget: Rc<dyn UsbGadget>,
        nbd: NbdDevice,
        dev_state: StateChange,
        rw: bool,
    ) -> Self {
        let status = gadget.configure(machine.name(), &nbd, dev_state, rw);
        if status != 0 {
            error!(name = %machine.name(), status, "USB gadget configuration failed");
        }
        Gadget {
            machine,
            gadget,
            nbd,
        }
    }
}

impl Drop for Gadget {
    fn drop(&mut self) {
        let status =
            self.gadget
                .configure(self.machine.name(), &self.nbd, StateChange::Removed, false);
        if status != 0 {
            // The machine is told the device state is unknown so it can
            // converge; a restart may be the only real remedy.
            error!(name = %self.machine.name(), status, "USB gadget teardown failed");
            self.machine.post(Event::UdevStateChange(StateChange::Unknown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, io};

    #[test]
    fn directory_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let dir = Directory::create(root.path(), "usb0").unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.is_dir());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn directory_create_fails_on_existing_path() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("usb0")).unwrap();
        let err = Directory::create(root.path(), "usb0").unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    struct JournalMounter {
        journal: RefCell<Vec<String>>,
    }

    impl SmbMounter for JournalMounter {
        fn mount(&self, remote: &Path, _target: &Path, _options: &str) -> io::Result<()> {
            self.journal
                .borrow_mut()
                .push(format!("mount {}", remote.display()));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> io::Result<()> {
            // The mount directory must still exist while unmounting.
            assert!(target.is_dir());
            self.journal.borrow_mut().push("unmount".into());
            Ok(())
        }

        fn force_unmount(&self, _target: &Path) -> io::Result<()> {
            unreachable!("not used by Mount")
        }
    }

    #[test]
    fn mount_unmounts_before_directory_removal() {
        let root = tempfile::tempdir().unwrap();
        let mounter = Rc::new(JournalMounter {
            journal: RefCell::new(Vec::new()),
        });

        let dir = Directory::create(root.path(), "usb0").unwrap();
        let dir_path = dir.path().to_path_buf();
        let mount = Mount::new(
            dir,
            Rc::<JournalMounter>::clone(&mounter),
            Path::new("//host/share"),
            false,
            None,
        )
        .unwrap();
        drop(mount);

        assert_eq!(
            *mounter.journal.borrow(),
            ["mount //host/share", "unmount"]
        );
        assert!(!dir_path.exists());
    }
}
