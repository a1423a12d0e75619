use super::{Handled, HandleResult, ReadyState, State};
use crate::{
    machine::{Event, MountPointStateMachine},
    resources::{Gadget, Process},
    system::StateChange,
};
use tracing::{info, warn};

/// Resource teardown in strict reverse-acquisition order: gadget, process,
/// CIFS mount. Waits for the subprocess to actually exit unless it already
/// has.
pub struct DeactivatingState {
    gadget: Option<Gadget>,
    process: Option<Process>,
    skip_process_wait: bool,
}

impl DeactivatingState {
    pub(crate) fn new(process: Option<Process>, gadget: Option<Gadget>) -> Self {
        DeactivatingState {
            gadget,
            process,
            skip_process_wait: false,
        }
    }

    pub(crate) fn from_udev(
        machine: &MountPointStateMachine,
        process: Option<Process>,
        gadget: Option<Gadget>,
        dev_state: StateChange,
    ) -> Self {
        info!(
            name = %machine.name(),
            dev_state = dev_state.as_str(),
            "deactivating after device state change"
        );
        Self::new(process, gadget)
    }

    pub(crate) fn from_subprocess_stopped(
        process: Option<Process>,
        gadget: Option<Gadget>,
    ) -> Self {
        DeactivatingState {
            gadget,
            process,
            skip_process_wait: true,
        }
    }

    pub(crate) fn on_enter(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        // Gadget teardown comes first; dropping the process then schedules
        // its asynchronous stop.
        drop(self.gadget.take());
        let had_process = self.process.take().is_some();

        if self.skip_process_wait || !had_process {
            return Some(self.finish(machine));
        }
        None
    }

    pub(crate) fn handle_event(
        self,
        machine: &mut MountPointStateMachine,
        event: Event,
    ) -> HandleResult {
        match event {
            Event::SubprocessStopped => Ok(Handled::Transition(self.finish(machine))),
            other => {
                warn!(name = %machine.name(), event = other.name(), "invalid event");
                Ok(Handled::Stay(State::Deactivating(self)))
            }
        }
    }

    fn finish(&self, machine: &mut MountPointStateMachine) -> State {
        if let Some(target) = machine.target.as_mut() {
            target.mount_point = None;
        }
        machine.notify(0);
        State::Ready(ReadyState::idle())
    }
}
