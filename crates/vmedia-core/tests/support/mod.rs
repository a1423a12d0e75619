//! Shared test rig: a state machine wired to recording doubles of every OS
//! seam, plus helpers to drive device events and drain the pump.
#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    io,
    path::{Path, PathBuf},
    rc::Rc,
};
use tokio::sync::mpsc::UnboundedReceiver;
use vmedia_core::{
    bus::{CompletionSignal, ObjectServer},
    machine::RegisterDbusEvent,
    rpc::MountPointRpc,
    system::{ExitHandler, ProcessHandle, SmbMounter, Spawner, StopHandler, UsbGadget},
    Event, Mode, MountPoint, MountPointStateMachine, NbdDevice, StateChange, System,
};

pub type Journal = Rc<RefCell<Vec<String>>>;

pub struct ProcRecord {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub exited: bool,
    pub stop_requested: bool,
    on_exit: Option<ExitHandler>,
    stop_done: Vec<StopHandler>,
}

/// Handle to every subprocess the mock spawner has created.
#[derive(Clone)]
pub struct MockProcs {
    inner: Rc<RefCell<Vec<ProcRecord>>>,
}

impl MockProcs {
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn args(&self, idx: usize) -> Vec<String> {
        self.inner.borrow()[idx].args.clone()
    }

    pub fn path(&self, idx: usize) -> PathBuf {
        self.inner.borrow()[idx].path.clone()
    }

    pub fn stop_requested(&self, idx: usize) -> bool {
        self.inner.borrow()[idx].stop_requested
    }

    /// Simulate the subprocess exiting with `code`.
    pub fn trigger_exit(&self, idx: usize, code: i32) {
        let (on_exit, waiters) = {
            let mut procs = self.inner.borrow_mut();
            let proc = &mut procs[idx];
            if proc.exited {
                return;
            }
            proc.exited = true;
            (proc.on_exit.take(), std::mem::take(&mut proc.stop_done))
        };
        if let Some(on_exit) = on_exit {
            on_exit(code);
        }
        for waiter in waiters {
            waiter();
        }
    }
}

pub struct MockSpawner {
    procs: Rc<RefCell<Vec<ProcRecord>>>,
    journal: Journal,
    pub fail_next: Cell<bool>,
    /// When set, a stop request exits the subprocess with code 0 on the next
    /// loop turn, as SIGTERM would.
    pub auto_exit_on_stop: Cell<bool>,
}

struct MockHandle {
    idx: usize,
    procs: Rc<RefCell<Vec<ProcRecord>>>,
    journal: Journal,
    auto_exit: bool,
}

impl ProcessHandle for MockHandle {
    fn stop(self: Box<Self>, done: StopHandler) {
        self.journal.borrow_mut().push("process stop".into());
        let mut procs = self.procs.borrow_mut();
        let proc = &mut procs[self.idx];
        proc.stop_requested = true;
        if proc.exited {
            drop(procs);
            tokio::task::spawn_local(async move { done() });
        } else if self.auto_exit {
            proc.exited = true;
            let on_exit = proc.on_exit.take();
            drop(procs);
            tokio::task::spawn_local(async move {
                if let Some(on_exit) = on_exit {
                    on_exit(0);
                }
                done();
            });
        } else {
            proc.stop_done.push(done);
        }
    }
}

impl Spawner for MockSpawner {
    fn spawn(
        &self,
        _name: &str,
        path: &Path,
        args: &[String],
        on_exit: ExitHandler,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        if self.fail_next.get() {
            self.fail_next.set(false);
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let binary = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.journal.borrow_mut().push(format!("spawn {binary}"));
        let idx = {
            let mut procs = self.procs.borrow_mut();
            procs.push(ProcRecord {
                path: path.to_path_buf(),
                args: args.to_vec(),
                exited: false,
                stop_requested: false,
                on_exit: Some(on_exit),
                stop_done: Vec::new(),
            });
            procs.len() - 1
        };
        Ok(Box::new(MockHandle {
            idx,
            procs: Rc::clone(&self.procs),
            journal: Rc::clone(&self.journal),
            auto_exit: self.auto_exit_on_stop.get(),
        }))
    }
}

pub struct MockSmb {
    journal: Journal,
    pub options: RefCell<Vec<String>>,
    pub fail_mount: Cell<bool>,
}

impl SmbMounter for MockSmb {
    fn mount(&self, remote: &Path, _target: &Path, options: &str) -> io::Result<()> {
        self.options.borrow_mut().push(options.to_string());
        if self.fail_mount.get() {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.journal
            .borrow_mut()
            .push(format!("smb mount {}", remote.display()));
        Ok(())
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        self.journal.borrow_mut().push("smb unmount".into());
        Ok(())
    }

    fn force_unmount(&self, _target: &Path) -> io::Result<()> {
        self.journal.borrow_mut().push("smb force unmount".into());
        Ok(())
    }
}

pub struct MockGadget {
    journal: Journal,
    pub stats_value: RefCell<Option<String>>,
    pub fail_teardown: Cell<bool>,
}

impl UsbGadget for MockGadget {
    fn configure(&self, _name: &str, _nbd: &NbdDevice, state: StateChange, rw: bool) -> i32 {
        match state {
            StateChange::Inserted => {
                self.journal
                    .borrow_mut()
                    .push(format!("gadget configure rw={rw}"));
                0
            }
            StateChange::Removed | StateChange::Unknown => {
                self.journal.borrow_mut().push("gadget teardown".into());
                if self.fail_teardown.get() {
                    -1
                } else {
                    0
                }
            }
        }
    }

    fn stats(&self, _nbd: &NbdDevice) -> Option<String> {
        self.stats_value.borrow().clone()
    }
}

pub fn test_config(mode: Mode, temp_root: &Path) -> MountPoint {
    MountPoint {
        name: "usb0".into(),
        mode,
        nbd_device: NbdDevice::new("nbd0").unwrap(),
        endpoint_id: "/redfish/v1/eth0".into(),
        unix_socket: temp_root.join("run/vmedia/nbd0.sock"),
        timeout: None,
    }
}

pub struct TestRig {
    pub machine: Rc<RefCell<MountPointStateMachine>>,
    pub rpc: MountPointRpc,
    pub server: Rc<RefCell<ObjectServer>>,
    pub completions: UnboundedReceiver<CompletionSignal>,
    pub procs: MockProcs,
    pub spawner: Rc<MockSpawner>,
    pub smb: Rc<MockSmb>,
    pub gadget: Rc<MockGadget>,
    pub journal: Journal,
    pub temp: tempfile::TempDir,
    pump: tokio::task::JoinHandle<()>,
}

impl TestRig {
    /// Build a registered machine in Ready. Must run inside a `LocalSet`.
    pub fn new(mode: Mode) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(mode, temp.path());
        Self::with_config(config, temp)
    }

    pub fn with_config(config: MountPoint, temp: tempfile::TempDir) -> Self {
        let journal: Journal = Rc::new(RefCell::new(Vec::new()));
        let procs = Rc::new(RefCell::new(Vec::new()));
        let spawner = Rc::new(MockSpawner {
            procs: Rc::clone(&procs),
            journal: Rc::clone(&journal),
            fail_next: Cell::new(false),
            auto_exit_on_stop: Cell::new(true),
        });
        let smb = Rc::new(MockSmb {
            journal: Rc::clone(&journal),
            options: RefCell::new(Vec::new()),
            fail_mount: Cell::new(false),
        });
        let gadget = Rc::new(MockGadget {
            journal: Rc::clone(&journal),
            stats_value: RefCell::new(Some("0 0 0 0".into())),
            fail_teardown: Cell::new(false),
        });

        let system = System {
            spawner: Rc::<MockSpawner>::clone(&spawner),
            smb: Rc::<MockSmb>::clone(&smb),
            gadget: Rc::<MockGadget>::clone(&gadget),
            temp_root: temp.path().to_path_buf(),
        };

        let (machine, rx) = MountPointStateMachine::new(config, system);
        let pump = tokio::task::spawn_local(MountPointStateMachine::run(
            Rc::clone(&machine),
            rx,
        ));

        let (server, completions) = ObjectServer::new();
        let server = Rc::new(RefCell::new(server));
        let rpc = MountPointRpc::new(Rc::clone(&machine));
        machine
            .borrow_mut()
            .emit(Event::RegisterDbus(RegisterDbusEvent {
                server: Rc::clone(&server),
                object: rpc.clone(),
            }))
            .unwrap();

        TestRig {
            machine,
            rpc,
            server,
            completions,
            procs: MockProcs { inner: procs },
            spawner,
            smb,
            gadget,
            journal,
            temp,
            pump,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.machine.borrow().state_name()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.borrow().clone()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.machine.borrow().config().unix_socket.clone()
    }

    pub fn insert_device(&self) {
        let device = self.machine.borrow().config().nbd_device.clone();
        self.machine
            .borrow_mut()
            .emit_udev_state_change(&device, StateChange::Inserted);
    }

    pub fn remove_device(&self) {
        let device = self.machine.borrow().config().nbd_device.clone();
        self.machine
            .borrow_mut()
            .emit_udev_state_change(&device, StateChange::Removed);
    }

    /// Let the pump drain whatever has been posted.
    pub async fn settle(&self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    /// Tear everything down so the machine itself is dropped, and return the
    /// journal for release-order assertions.
    pub async fn shutdown(self) -> (Journal, MockProcs) {
        let TestRig {
            machine,
            rpc,
            server,
            completions,
            procs,
            spawner,
            smb,
            gadget,
            journal,
            temp,
            pump,
        } = self;
        pump.abort();
        let _ = pump.await;
        drop(rpc);
        drop(server);
        drop(completions);
        drop(machine);
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        drop(spawner);
        drop(smb);
        drop(gadget);
        drop(temp);
        (journal, procs)
    }
}
