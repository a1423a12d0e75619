use super::{DeactivatingState, Handled, HandleResult, State};
use crate::{
    config::INACTIVITY_TIMEOUT,
    error::Error,
    machine::{Event, MountPointStateMachine},
    resources::{Gadget, Process},
};
use std::rc::Rc;
use tokio::{
    task::JoinHandle,
    time::{sleep, Duration, Instant},
};
use tracing::{error, info};

/// Aborts the idle task when the owning state is replaced.
struct IdleTimer {
    task: JoinHandle<()>,
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The virtual device is attached. Owns the subprocess and the gadget.
pub struct ActiveState {
    // Declared gadget-first: teardown precedes the process stop on drop.
    gadget: Option<Gadget>,
    process: Option<Process>,
    idle: Option<IdleTimer>,
}

impl ActiveState {
    pub(crate) fn new(
        machine: &mut MountPointStateMachine,
        process: Option<Process>,
        gadget: Option<Gadget>,
    ) -> Self {
        machine.notify(0);
        ActiveState {
            gadget,
            process,
            idle: None,
        }
    }

    pub(crate) fn on_enter(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        let handle = machine.handle();
        let gadget = Rc::clone(&machine.sys.gadget);
        let nbd = machine.config.nbd_device.clone();
        let remaining = Rc::clone(&machine.remaining_timeout);

        let task = tokio::task::spawn_local(async move {
            let mut last_stats = String::new();
            let mut last_access = Instant::now();
            loop {
                sleep(Duration::from_secs(1)).await;
                let now = Instant::now();
                if let Some(stats) = gadget.stats(&nbd) {
                    if stats != last_stats {
                        last_stats = stats;
                        last_access = now;
                    }
                }
                let idle_for = now.duration_since(last_access);
                if idle_for >= INACTIVITY_TIMEOUT {
                    info!(
                        name = %handle.name(),
                        timeout_secs = INACTIVITY_TIMEOUT.as_secs(),
                        "inactivity timer expired, unmounting"
                    );
                    handle.post(Event::Unmount);
                    return;
                }
                remaining.set((INACTIVITY_TIMEOUT - idle_for).as_secs());
            }
        });
        self.idle = Some(IdleTimer { task });
        None
    }

    pub(crate) fn handle_event(
        mut self,
        machine: &mut MountPointStateMachine,
        event: Event,
    ) -> HandleResult {
        match event {
            Event::Unmount => {
                machine.notification_start();
                Ok(Handled::Transition(State::Deactivating(
                    DeactivatingState::new(self.process.take(), self.gadget.take()),
                )))
            }
            Event::UdevStateChange(dev_state) => Ok(Handled::Transition(State::Deactivating(
                DeactivatingState::from_udev(
                    machine,
                    self.process.take(),
                    self.gadget.take(),
                    dev_state,
                ),
            ))),
            Event::SubprocessStopped => Ok(Handled::Transition(State::Deactivating(
                DeactivatingState::from_subprocess_stopped(
                    self.process.take(),
                    self.gadget.take(),
                ),
            ))),
            Event::Mount(_) => {
                error!(name = %machine.name(), "invalid event: MountEvent");
                Err((
                    State::Active(self),
                    Error::NotPermitted("Operation not permitted in active state".into()),
                ))
            }
            other => {
                error!(name = %machine.name(), event = other.name(), "invalid event");
                Err((
                    State::Active(self),
                    Error::NotSupported("Operation not supported in active state".into()),
                ))
            }
        }
    }
}
