//! In-process stand-in for the management bus: registered mount-point
//! objects plus a channel carrying `Completion` signals. A transport bridge
//! would sit on top of this surface.

use crate::{config::Mode, rpc::MountPointRpc};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

pub const MOUNT_POINT_IFACE: &str = "xyz.openbmc_project.VirtualMedia.MountPoint";
pub const PROCESS_IFACE: &str = "xyz.openbmc_project.VirtualMedia.Process";
pub const COMPLETION_SIGNAL: &str = "Completion";

/// Object path for a mount point, `/xyz/openbmc_project/VirtualMedia/{Proxy|Legacy}/<name>`.
pub fn object_path(mode: Mode, name: &str) -> String {
    let flavor = match mode {
        Mode::Proxy => "Proxy",
        Mode::Legacy => "Legacy",
    };
    format!("/xyz/openbmc_project/VirtualMedia/{flavor}/{name}")
}

/// Service interface name for a mount point's Mount/Unmount methods.
pub fn service_interface(mode: Mode) -> String {
    let flavor = match mode {
        Mode::Proxy => "Proxy",
        Mode::Legacy => "Legacy",
    };
    format!("xyz.openbmc_project.VirtualMedia.{flavor}")
}

/// `Completion` signal payload: the errno of the finished operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionSignal {
    pub path: String,
    pub interface: String,
    pub errno: i32,
}

/// Emits `Completion` signals for one object path.
pub struct SignalSender {
    tx: UnboundedSender<CompletionSignal>,
    path: String,
    interface: String,
    name: String,
}

impl SignalSender {
    pub fn send(&self, errno: i32) {
        debug!(
            path = %self.path,
            interface = %self.interface,
            signal = %self.name,
            errno,
            "sending completion signal"
        );
        let _ = self.tx.send(CompletionSignal {
            path: self.path.clone(),
            interface: self.interface.clone(),
            errno,
        });
    }
}

/// Holds every registered mount-point object.
pub struct ObjectServer {
    objects: HashMap<String, MountPointRpc>,
    completion_tx: UnboundedSender<CompletionSignal>,
}

impl ObjectServer {
    pub fn new() -> (Self, UnboundedReceiver<CompletionSignal>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        (
            ObjectServer {
                objects: HashMap::new(),
                completion_tx,
            },
            completion_rx,
        )
    }

    pub fn add_object(&mut self, path: String, object: MountPointRpc) {
        debug!(%path, "registering mount point object");
        self.objects.insert(path, object);
    }

    pub fn object(&self, path: &str) -> Option<MountPointRpc> {
        self.objects.get(path).cloned()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn signal_sender(&self, path: String, interface: String, name: String) -> SignalSender {
        SignalSender {
            tx: self.completion_tx.clone(),
            path,
            interface,
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_by_mode() {
        assert_eq!(
            object_path(Mode::Proxy, "usb0"),
            "/xyz/openbmc_project/VirtualMedia/Proxy/usb0"
        );
        assert_eq!(
            object_path(Mode::Legacy, "usb1"),
            "/xyz/openbmc_project/VirtualMedia/Legacy/usb1"
        );
        assert_eq!(
            service_interface(Mode::Legacy),
            "xyz.openbmc_project.VirtualMedia.Legacy"
        );
    }

    #[test]
    fn completion_signals_reach_the_channel() {
        let (server, mut rx) = ObjectServer::new();
        let sender = server.signal_sender(
            object_path(Mode::Proxy, "usb0"),
            service_interface(Mode::Proxy),
            COMPLETION_SIGNAL.into(),
        );
        sender.send(0);
        sender.send(libc::EBUSY);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.errno, 0);
        assert_eq!(first.path, "/xyz/openbmc_project/VirtualMedia/Proxy/usb0");
        assert_eq!(rx.try_recv().unwrap().errno, libc::EBUSY);
    }
}
