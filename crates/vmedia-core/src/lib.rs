//! Virtual media mount points: remote storage images exposed as USB
//! mass-storage devices through an NBD server/client pair.
//!
//! The heart of the crate is the per-mount-point [`MountPointStateMachine`]
//! (Initial → Ready → Activating → Active → Deactivating) and its owned
//! resource graph (temp directory, CIFS mount, subprocess, USB gadget),
//! released deterministically in reverse-acquisition order. Everything runs
//! on one cooperative event loop (tokio current-thread + `LocalSet`);
//! blocking bus RPCs are layered on top as 100 ms polls.

pub mod bus;
pub mod config;
pub mod credentials;
pub mod error;
pub mod machine;
pub mod monitor;
pub mod resources;
pub mod rpc;
pub mod smb;
pub mod state;
pub mod system;

pub use config::{Configuration, Mode, MountPoint, NbdDevice};
pub use error::{Error, Result};
pub use machine::{Event, MachineHandle, MountPointStateMachine, Target};
pub use rpc::MountPointRpc;
pub use system::{StateChange, System};
