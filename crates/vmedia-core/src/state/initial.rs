use super::{Handled, HandleResult, ReadyState, State};
use crate::{
    bus,
    config::Mode,
    machine::{Event, MountPointStateMachine, RegisterDbusEvent},
    system::StateChange,
};
use std::fs;
use tracing::{debug, warn};

/// Start state: waits for bus registration.
pub struct InitialState;

impl InitialState {
    pub(crate) fn handle_event(
        self,
        machine: &mut MountPointStateMachine,
        event: Event,
    ) -> HandleResult {
        match event {
            Event::RegisterDbus(event) => {
                Ok(Handled::Transition(Self::register(machine, event)))
            }
            other => {
                warn!(name = %machine.name(), event = other.name(), "invalid event");
                Ok(Handled::Stay(State::Initial(self)))
            }
        }
    }

    fn register(machine: &mut MountPointStateMachine, event: RegisterDbusEvent) -> State {
        let is_legacy = machine.config.mode == Mode::Legacy;
        if is_legacy {
            Self::cleanup_stale(machine);
        }

        let path = bus::object_path(machine.config.mode, machine.name());
        let interface = bus::service_interface(machine.config.mode);
        let mut server = event.server.borrow_mut();
        server.add_object(path.clone(), event.object);
        machine.notification_initialize(server.signal_sender(
            path,
            interface,
            bus::COMPLETION_SIGNAL.into(),
        ));

        State::Ready(ReadyState::idle())
    }

    /// Reclaim whatever a previous instance left behind: gadget
    /// configuration and a possibly still-mounted temp directory. Every step
    /// is idempotent.
    fn cleanup_stale(machine: &MountPointStateMachine) {
        let status = machine.sys.gadget.configure(
            machine.name(),
            &machine.config.nbd_device,
            StateChange::Removed,
            false,
        );
        if status != 0 {
            debug!(name = %machine.name(), status, "no stale gadget configuration to remove");
        }

        let stale = machine.sys.temp_root.join(&machine.config.name);
        if stale.exists() {
            if let Err(err) = machine.sys.smb.force_unmount(&stale) {
                debug!(path = %stale.display(), %err, "stale directory was not mounted");
            }
            if let Err(err) = fs::remove_dir(&stale) {
                warn!(path = %stale.display(), %err, "unable to remove stale mount directory");
            }
        }
    }
}
