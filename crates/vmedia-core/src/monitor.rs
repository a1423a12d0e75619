//! Process-wide NBD device monitor.
//!
//! Fans `(device, state)` notifications out to every registered machine;
//! each machine filters by its own configured device. The shipped backend
//! watches `/sys/block/<dev>/pid`, which exists exactly while an nbd-client
//! holds the device.

use crate::{
    config::NbdDevice,
    machine::MountPointStateMachine,
    system::StateChange,
};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
    time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Default)]
pub struct DeviceMonitor {
    machines: Vec<Rc<RefCell<MountPointStateMachine>>>,
    devices: HashSet<NbdDevice>,
}

impl DeviceMonitor {
    pub fn new() -> Self {
        DeviceMonitor::default()
    }

    /// Watch the machine's device and include it in future fan-outs.
    pub fn add_machine(&mut self, machine: Rc<RefCell<MountPointStateMachine>>) {
        let device = machine.borrow().config().nbd_device.clone();
        debug!(device = %device, "monitoring NBD device");
        self.devices.insert(device);
        self.machines.push(machine);
    }

    pub fn devices(&self) -> impl Iterator<Item = &NbdDevice> {
        self.devices.iter()
    }

    /// Deliver one state change to every machine.
    pub fn notify(&self, device: &NbdDevice, state: StateChange) {
        info!(device = %device, state = state.as_str(), "device state change");
        for machine in &self.machines {
            machine.borrow_mut().emit_udev_state_change(device, state);
        }
    }
}

/// Poll sysfs for attach/detach edges on every watched device.
pub async fn run_sysfs_monitor(monitor: Rc<RefCell<DeviceMonitor>>, period: Duration) {
    let mut connected: HashMap<NbdDevice, bool> = HashMap::new();
    loop {
        sleep(period).await;
        let devices: Vec<NbdDevice> = monitor.borrow().devices().cloned().collect();
        for device in devices {
            let now = device.sys_pid_path().exists();
            let before = connected.insert(device.clone(), now).unwrap_or(false);
            if now != before {
                let state = if now {
                    StateChange::Inserted
                } else {
                    StateChange::Removed
                };
                monitor.borrow().notify(&device, state);
            }
        }
    }
}
