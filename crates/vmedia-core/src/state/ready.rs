use super::{ActivatingState, Handled, HandleResult, State};
use crate::{
    error::Error,
    machine::{Event, MountPointStateMachine},
};
use tracing::{debug, error, warn};

/// Idle state between activations. Carries the error of the last failed
/// activation for the RPC adapter to surface.
pub struct ReadyState {
    pub(crate) error: Option<Error>,
}

impl ReadyState {
    pub(crate) fn idle() -> Self {
        ReadyState { error: None }
    }

    pub(crate) fn failed(machine_name: &str, error: Error) -> Self {
        error!(name = machine_name, errno = error.errno(), %error, "activation failed");
        ReadyState { error: Some(error) }
    }

    pub(crate) fn on_enter(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        // Cleanup after the previously mounted device.
        debug!(name = %machine.name(), exit_code = machine.exit_code.get(), "entering ready");
        machine.target = None;
        machine.remaining_timeout.set(0);
        None
    }

    pub(crate) fn handle_event(
        self,
        machine: &mut MountPointStateMachine,
        event: Event,
    ) -> HandleResult {
        match event {
            Event::Mount(target) => {
                if let Some(target) = target {
                    machine.target = Some(target);
                }
                Ok(Handled::Transition(State::Activating(ActivatingState::new())))
            }
            Event::Unmount => Err((
                State::Ready(self),
                Error::NotPermitted("Operation not permitted in ready state".into()),
            )),
            other => {
                warn!(name = %machine.name(), event = other.name(), "invalid event");
                Ok(Handled::Stay(State::Ready(self)))
            }
        }
    }
}
