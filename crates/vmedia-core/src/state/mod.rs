//! Mount-point states. Transitions replace the enum variant; the outgoing
//! variant's drop performs its resource release.

mod activating;
mod active;
mod deactivating;
mod initial;
mod ready;

pub use activating::ActivatingState;
pub use active::ActiveState;
pub use deactivating::DeactivatingState;
pub use initial::InitialState;
pub use ready::ReadyState;

use crate::{
    error::Error,
    machine::{Event, MountPointStateMachine},
};

/// Outcome of dispatching one event.
pub enum Handled {
    Stay(State),
    Transition(State),
}

/// Illegal events surface an error but never lose the state.
pub(crate) type HandleResult = Result<Handled, (State, Error)>;

pub enum State {
    Initial(InitialState),
    Ready(ReadyState),
    Activating(ActivatingState),
    Active(ActiveState),
    Deactivating(DeactivatingState),
}

impl State {
    pub(crate) fn initial() -> Self {
        State::Initial(InitialState)
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Initial(_) => "InitialState",
            State::Ready(_) => "ReadyState",
            State::Activating(_) => "ActivatingState",
            State::Active(_) => "ActiveState",
            State::Deactivating(_) => "DeactivatingState",
        }
    }

    pub(crate) fn on_enter(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        match self {
            State::Initial(_) => None,
            State::Ready(state) => state.on_enter(machine),
            State::Activating(state) => state.on_enter(machine),
            State::Active(state) => state.on_enter(machine),
            State::Deactivating(state) => state.on_enter(machine),
        }
    }

    pub(crate) fn handle_event(
        self,
        machine: &mut MountPointStateMachine,
        event: Event,
    ) -> HandleResult {
        match self {
            State::Initial(state) => state.handle_event(machine, event),
            State::Ready(state) => state.handle_event(machine, event),
            State::Activating(state) => state.handle_event(machine, event),
            State::Active(state) => state.handle_event(machine, event),
            State::Deactivating(state) => state.handle_event(machine, event),
        }
    }
}
