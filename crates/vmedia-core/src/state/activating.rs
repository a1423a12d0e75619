use super::{ActiveState, DeactivatingState, Handled, HandleResult, ReadyState, State};
use crate::{
    config::Mode,
    credentials::VolatileFile,
    error::Error,
    machine::{Event, MachineHandle, MountPointStateMachine},
    resources::{Directory, Gadget, Mount, Process},
    system::{ExitHandler, StateChange, NBDKIT, NBD_CLIENT},
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    rc::Rc,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Image acquisition in flight: the serving subprocess has been spawned and
/// the state waits for the kernel device to appear.
pub struct ActivatingState {
    process: Option<Process>,
}

impl ActivatingState {
    pub(crate) fn new() -> Self {
        ActivatingState { process: None }
    }

    pub(crate) fn on_enter(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        // Reset previous exit code.
        machine.exit_code.set(-1);

        match machine.config.mode {
            Mode::Proxy => self.activate_proxy_mode(machine),
            Mode::Legacy => self.activate_legacy_mode(machine),
        }
    }

    pub(crate) fn handle_event(
        mut self,
        machine: &mut MountPointStateMachine,
        event: Event,
    ) -> HandleResult {
        match event {
            Event::UdevStateChange(StateChange::Inserted) => {
                let rw = machine.target.as_ref().map(|t| t.rw).unwrap_or(false);
                let gadget = Gadget::new(
                    machine.handle(),
                    Rc::clone(&machine.sys.gadget),
                    machine.config.nbd_device.clone(),
                    StateChange::Inserted,
                    rw,
                );
                Ok(Handled::Transition(State::Active(ActiveState::new(
                    machine,
                    self.process.take(),
                    Some(gadget),
                ))))
            }
            Event::UdevStateChange(dev_state) => {
                Ok(Handled::Transition(State::Deactivating(
                    DeactivatingState::from_udev(machine, self.process.take(), None, dev_state),
                )))
            }
            Event::SubprocessStopped => {
                error!(name = %machine.name(), "process ended prematurely");
                Ok(Handled::Transition(State::Ready(ReadyState::failed(
                    machine.name(),
                    Error::ConnectionRefused("Process ended prematurely".into()),
                ))))
            }
            other => {
                warn!(name = %machine.name(), event = other.name(), "invalid event");
                Ok(Handled::Stay(State::Activating(self)))
            }
        }
    }

    fn activate_proxy_mode(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        let spawner = Rc::clone(&machine.sys.spawner);
        match Process::spawn(
            machine.handle(),
            &*spawner,
            Path::new(NBD_CLIENT),
            &machine.config.to_args(),
            exit_handler(machine.handle(), None),
        ) {
            Ok(process) => {
                self.process = Some(process);
                None
            }
            Err(_) => Some(State::Ready(ReadyState::failed(
                machine.name(),
                Error::OperationCanceled("Failed to spawn process".into()),
            ))),
        }
    }

    fn activate_legacy_mode(&mut self, machine: &mut MountPointStateMachine) -> Option<State> {
        let Some((img_url, rw)) = machine
            .target
            .as_ref()
            .map(|target| (target.img_url.clone(), target.rw))
        else {
            return Some(State::Ready(ReadyState::failed(
                machine.name(),
                Error::InvalidArgument("No image requested".into()),
            )));
        };
        info!(name = %machine.name(), url = %img_url, rw, "mount requested");

        if let Some(state) = ensure_socket_parent(machine) {
            return Some(state);
        }

        match Url::parse(&img_url) {
            Ok(url) if url.scheme() == "smb" => self.mount_smb_share(machine, &url, rw),
            Ok(url) if url.scheme() == "https" => self.mount_https_share(machine, &img_url, rw),
            _ => Some(State::Ready(ReadyState::failed(
                machine.name(),
                Error::InvalidArgument("URL not recognized".into()),
            ))),
        }
    }

    fn mount_smb_share(
        &mut self,
        machine: &mut MountPointStateMachine,
        url: &Url,
        rw: bool,
    ) -> Option<State> {
        let (remote, file_name) = match cifs_remote(url) {
            Ok(parts) => parts,
            Err(err) => return Some(State::Ready(ReadyState::failed(machine.name(), err))),
        };

        let mount_dir = match Directory::create(&machine.sys.temp_root, &machine.config.name) {
            Ok(dir) => dir,
            Err(err) => return Some(State::Ready(ReadyState::failed(machine.name(), err))),
        };
        let local_file = mount_dir.path().join(&file_name);
        info!(
            name = %machine.name(),
            remote = %remote.display(),
            local = %local_file.display(),
            "staging SMB image"
        );

        let smb = Rc::clone(&machine.sys.smb);
        let credentials = machine
            .target
            .as_mut()
            .and_then(|target| target.credentials.as_mut());
        let mount = match Mount::new(mount_dir, smb, &remote, rw, credentials) {
            Ok(mount) => mount,
            Err(err) => return Some(State::Ready(ReadyState::failed(machine.name(), err))),
        };
        if let Some(target) = machine.target.as_mut() {
            target.mount_point = Some(mount);
        }

        let params = vec!["file".into(), format!("file={}", local_file.display())];
        match spawn_nbdkit(machine, rw, params, None) {
            Ok(process) => {
                self.process = Some(process);
                None
            }
            Err(_) => Some(State::Ready(ReadyState::failed(
                machine.name(),
                Error::OperationCanceled("Unable to setup NbdKit".into()),
            ))),
        }
    }

    fn mount_https_share(
        &mut self,
        machine: &mut MountPointStateMachine,
        img_url: &str,
        rw: bool,
    ) -> Option<State> {
        let mut params = vec![
            "curl".to_string(),
            format!("url={img_url}"),
            "cainfo=".into(),
            "capath=/etc/ssl/certs/authority".into(),
            "ssl-version=tlsv1.2".into(),
            "followlocation=false".into(),
            "ssl-cipher-list=ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES256-GCM-SHA384".into(),
            "tls13-ciphers=TLS_AES_256_GCM_SHA384".into(),
        ];

        let mut secret = None;
        if let Some(credentials) = machine
            .target
            .as_ref()
            .and_then(|target| target.credentials.as_ref())
        {
            let packed = credentials.pack(|_, pass, dest| dest.extend_from_slice(pass.as_bytes()));
            let file = match VolatileFile::new(packed) {
                Ok(file) => file,
                Err(err) => return Some(State::Ready(ReadyState::failed(machine.name(), err))),
            };
            params.push(format!("user={}", credentials.user()));
            params.push(format!("password=+{}", file.path().display()));
            secret = Some(file);
        }

        match spawn_nbdkit(machine, rw, params, secret) {
            Ok(process) => {
                self.process = Some(process);
                None
            }
            Err(_) => Some(State::Ready(ReadyState::failed(
                machine.name(),
                Error::InvalidArgument("Failed to mount HTTPS share".into()),
            ))),
        }
    }
}

/// The socket's parent directory must exist with owner-only permissions
/// before nbdkit can listen there.
fn ensure_socket_parent(machine: &MountPointStateMachine) -> Option<State> {
    let socket = &machine.config.unix_socket;
    let Some(parent) = socket.parent() else {
        return None;
    };
    if parent.exists() {
        return None;
    }
    info!(name = %machine.name(), path = %parent.display(), "creating socket parent directory");
    if let Err(err) = fs::create_dir_all(parent) {
        return Some(State::Ready(ReadyState::failed(
            machine.name(),
            Error::from_io(&err, "Failed to create parent directory for socket"),
        )));
    }
    if let Err(err) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
        return Some(State::Ready(ReadyState::failed(
            machine.name(),
            Error::from_io(&err, "Failed to set parent directory permissions for socket"),
        )));
    }
    None
}

/// Derive the CIFS remote (`//host/<parent>`) and the image file name from
/// an `smb://` URL.
fn cifs_remote(url: &Url) -> Result<(PathBuf, String), Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidArgument("URL not recognized".into()))?;
    let path = Path::new(url.path());
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidArgument("URL does not name an image file".into()))?
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    Ok((
        PathBuf::from(format!("//{host}{}", parent.display())),
        file_name,
    ))
}

/// Spawn nbdkit serving over the configured unix socket, with nbd-client
/// attached through `--run`. Any stale socket is removed first.
fn spawn_nbdkit(
    machine: &mut MountPointStateMachine,
    rw: bool,
    params: Vec<String>,
    secret: Option<VolatileFile>,
) -> Result<Process, Error> {
    let socket = machine.config.unix_socket.clone();
    if socket.exists() {
        debug!(name = %machine.name(), socket = %socket.display(), "removing previously mounted socket");
        fs::remove_file(&socket).map_err(|err| {
            error!(name = %machine.name(), socket = %socket.display(), %err, "unable to remove pre-existing socket");
            Error::from_io(&err, "Unable to remove pre-existing socket")
        })?;
    }

    let nbd_client = format!("{NBD_CLIENT} {}", machine.config.to_args().join(" "));
    let mut args = vec![
        // Listen for a client on this unix socket, then connect nbd-client
        // to the served image.
        "--unix".to_string(),
        socket.display().to_string(),
        "--run".into(),
        nbd_client,
    ];
    if !rw {
        args.push("--readonly".into());
    }
    args.extend(params);

    let spawner = Rc::clone(&machine.sys.spawner);
    Process::spawn(
        machine.handle(),
        &*spawner,
        Path::new(NBDKIT),
        &args,
        exit_handler(machine.handle(), secret),
    )
}

/// Records the exit code and informs the machine. The secret file, when
/// present, is co-owned by the callback so it outlives the subprocess.
fn exit_handler(handle: MachineHandle, secret: Option<VolatileFile>) -> ExitHandler {
    Box::new(move |exit_code| {
        let _secret = secret;
        info!(name = %handle.name(), exit_code, "process ended");
        handle.set_exit_code(exit_code);
        handle.post(Event::SubprocessStopped);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cifs_remote_splits_share_and_file() {
        let url = Url::parse("smb://host/share/images/disk.iso").unwrap();
        let (remote, file) = cifs_remote(&url).unwrap();
        assert_eq!(remote, PathBuf::from("//host/share/images"));
        assert_eq!(file, "disk.iso");
    }

    #[test]
    fn cifs_remote_rejects_bare_host() {
        let url = Url::parse("smb://host").unwrap();
        assert!(cifs_remote(&url).is_err());
        let url = Url::parse("smb://host/").unwrap();
        assert!(cifs_remote(&url).is_err());
    }
}
