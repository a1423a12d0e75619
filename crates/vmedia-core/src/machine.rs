//! Per-mount-point state machine: event dispatch and owned resources.

use crate::{
    bus::SignalSender,
    config::{MountPoint, NbdDevice, TIMEOUT_GRACE_SECS},
    credentials::CredentialsProvider,
    error::Error,
    resources,
    state::{Handled, State},
    system::{StateChange, System},
};
use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Bus registration payload: the object server to register with and the
/// prepared RPC object for this mount point.
pub struct RegisterDbusEvent {
    pub server: Rc<RefCell<crate::bus::ObjectServer>>,
    pub object: crate::rpc::MountPointRpc,
}

/// Events dispatched into the state machine.
pub enum Event {
    RegisterDbus(RegisterDbusEvent),
    Mount(Option<Target>),
    Unmount,
    UdevStateChange(StateChange),
    SubprocessStopped,
}

impl Event {
    /// Diagnostic name carried in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::RegisterDbus(_) => "RegisterDbusEvent",
            Event::Mount(_) => "MountEvent",
            Event::Unmount => "UnmountEvent",
            Event::UdevStateChange(_) => "UdevStateChangeEvent",
            Event::SubprocessStopped => "SubprocessStoppedEvent",
        }
    }
}

/// A requested image to be served through a mount point.
///
/// Exists from the moment a Mount RPC is accepted until the machine returns
/// to Ready, which clears it. `mount_point` is declared before `credentials`
/// so the CIFS mount is released first.
pub struct Target {
    pub img_url: String,
    pub rw: bool,
    pub mount_point: Option<resources::Mount>,
    pub credentials: Option<CredentialsProvider>,
}

impl Target {
    pub fn new(img_url: String, rw: bool, credentials: Option<CredentialsProvider>) -> Self {
        Target {
            img_url,
            rw,
            mount_point: None,
            credentials,
        }
    }
}

/// Non-owning back-reference to a machine, safe to hold from resources and
/// timer tasks. Events posted through it are processed in a later loop turn.
#[derive(Clone)]
pub struct MachineHandle {
    name: Rc<str>,
    tx: UnboundedSender<Event>,
    exit_code: Rc<Cell<i32>>,
}

impl MachineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!(name = %self.name, "machine gone; dropping posted event");
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.set(code);
    }
}

/// Completion-signal gate: armed with a deadline, fires `EBUSY` when it
/// expires, suppressed entirely while unarmed.
pub(crate) struct NotificationWrapper {
    inner: Rc<RefCell<NotificationInner>>,
}

struct NotificationInner {
    sender: SignalSender,
    started: bool,
    timer: Option<JoinHandle<()>>,
}

impl NotificationWrapper {
    fn new(sender: SignalSender) -> Self {
        NotificationWrapper {
            inner: Rc::new(RefCell::new(NotificationInner {
                sender,
                started: false,
                timer: None,
            })),
        }
    }

    fn start(&self, duration: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.started = true;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let weak: Weak<RefCell<NotificationInner>> = Rc::downgrade(&self.inner);
        inner.timer = Some(tokio::task::spawn_local(async move {
            sleep(duration).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.borrow_mut();
            if inner.started {
                error!("timed out when waiting for target state");
                inner.sender.send(libc::EBUSY);
                inner.started = false;
            }
        }));
    }

    fn notify(&self, errno: i32) {
        let mut inner = self.inner.borrow_mut();
        if !inner.started {
            debug!("completion notification suppressed (not armed)");
            return;
        }
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.sender.send(errno);
        inner.started = false;
    }
}

impl Drop for NotificationWrapper {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.borrow_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Holder of the current state and the strongly-typed event dispatch.
pub struct MountPointStateMachine {
    pub(crate) name: Rc<str>,
    pub(crate) config: MountPoint,
    pub(crate) sys: System,
    // `state` precedes `target`: resources owned by the state must be
    // released before the target's CIFS mount.
    pub(crate) state: Option<State>,
    pub(crate) target: Option<Target>,
    pub(crate) exit_code: Rc<Cell<i32>>,
    pub(crate) remaining_timeout: Rc<Cell<u64>>,
    tx: UnboundedSender<Event>,
    pub(crate) notification: Option<NotificationWrapper>,
}

impl MountPointStateMachine {
    pub fn new(
        config: MountPoint,
        sys: System,
    ) -> (Rc<RefCell<Self>>, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = MountPointStateMachine {
            name: Rc::from(config.name.as_str()),
            config,
            sys,
            state: Some(State::initial()),
            target: None,
            exit_code: Rc::new(Cell::new(-1)),
            remaining_timeout: Rc::new(Cell::new(0)),
            tx,
            notification: None,
        };
        (Rc::new(RefCell::new(machine)), rx)
    }

    /// Pump posted events into the machine. Runs until every sender is gone.
    pub async fn run(machine: Rc<RefCell<Self>>, mut rx: UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            let mut machine = machine.borrow_mut();
            if let Err(err) = machine.emit(event) {
                warn!(name = %machine.name, %err, "posted event rejected");
            }
        }
    }

    /// Dispatch one event. This is the only place states change.
    pub fn emit(&mut self, event: Event) -> Result<(), Error> {
        info!(
            name = %self.name,
            event = event.name(),
            state = self.state_name(),
            "event received"
        );
        let state = self.state.take().expect("machine always holds a state");
        match state.handle_event(self, event) {
            Ok(Handled::Stay(state)) => {
                self.state = Some(state);
                Ok(())
            }
            Ok(Handled::Transition(next)) => {
                self.change_state(next);
                Ok(())
            }
            Err((state, err)) => {
                self.state = Some(state);
                error!(name = %self.name, %err, "invalid event");
                Err(err)
            }
        }
    }

    fn change_state(&mut self, mut next: State) {
        loop {
            info!(name = %self.name, state = next.name(), "state changed");
            match next.on_enter(self) {
                Some(following) => next = following,
                None => {
                    self.state = Some(next);
                    return;
                }
            }
        }
    }

    /// Fan-in from the device monitor; foreign devices are ignored.
    pub fn emit_udev_state_change(&mut self, dev: &NbdDevice, dev_state: StateChange) {
        if self.config.nbd_device == *dev {
            if let Err(err) = self.emit(Event::UdevStateChange(dev_state)) {
                warn!(name = %self.name, %err, "udev state change rejected");
            }
        } else {
            debug!(name = %self.name, device = %dev, "ignoring state change for foreign device");
        }
    }

    pub fn handle(&self) -> MachineHandle {
        MachineHandle {
            name: Rc::clone(&self.name),
            tx: self.tx.clone(),
            exit_code: Rc::clone(&self.exit_code),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MountPoint {
        &self.config
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.get()
    }

    /// Seconds of idle time left before auto-unmount while Active; zero
    /// otherwise.
    pub fn remaining_inactivity_timeout(&self) -> u64 {
        self.remaining_timeout.get()
    }

    pub fn state_name(&self) -> &'static str {
        self.state.as_ref().map_or("<dispatching>", State::name)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, Some(State::Active(_)))
    }

    /// `Some` while the machine sits in Ready, carrying any captured
    /// activation error.
    pub fn ready_error(&self) -> Option<Option<Error>> {
        match &self.state {
            Some(State::Ready(ready)) => Some(ready.error.clone()),
            _ => None,
        }
    }

    /// Wipe credentials from the live target, if any.
    pub fn clear_credentials(&mut self) {
        if let Some(target) = self.target.as_mut() {
            target.credentials = None;
        }
    }

    pub(crate) fn notification_initialize(&mut self, sender: SignalSender) {
        self.notification = Some(NotificationWrapper::new(sender));
    }

    /// Arm the completion deadline: configured timeout plus grace.
    pub(crate) fn notification_start(&mut self) {
        let duration = Duration::from_secs(self.config.timeout_secs() + TIMEOUT_GRACE_SECS);
        if let Some(notification) = &self.notification {
            notification.start(duration);
        }
    }

    /// Publish a completion signal if one is armed.
    pub(crate) fn notify(&mut self, errno: i32) {
        if let Some(notification) = &self.notification {
            notification.notify(errno);
        }
    }
}
