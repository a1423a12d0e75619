//! CIFS mount-option assembly and version fallback.

use crate::{
    credentials::{wipe_string, CredentialsProvider},
    error::Error,
    system::SmbMounter,
};
use std::path::Path;
use tracing::{debug, info};

/// One CIFS share mounted onto a local directory.
pub struct SmbShare<'a> {
    mount_dir: &'a Path,
}

impl<'a> SmbShare<'a> {
    pub fn new(mount_dir: &'a Path) -> Self {
        SmbShare { mount_dir }
    }

    /// Mount `remote` onto the share's directory, negotiating SMB 3.1.1
    /// first and falling back to the 3.x family.
    pub fn mount(
        &self,
        mounter: &dyn SmbMounter,
        remote: &Path,
        rw: bool,
        credentials: Option<&mut CredentialsProvider>,
    ) -> Result<(), Error> {
        debug!(remote = %remote.display(), "trying to mount remote share");

        let mut options = String::from("nolock,sec=ntlmsspi,seal");
        options.push(',');
        options.push_str(if rw { "rw" } else { "ro" });
        options.push(',');
        match credentials {
            None => {
                info!("mounting as guest");
                options.push_str("guest,username=OpenBmc");
            }
            Some(credentials) => {
                if credentials.user().contains(',') {
                    wipe_string(&mut options);
                    return Err(Error::InvalidArgument(
                        "Username must not contain commas".into(),
                    ));
                }
                credentials.escape_commas();
                options.push_str("username=");
                options.push_str(credentials.user());
                options.push_str(",password=");
                options.push_str(credentials.password());
            }
        }

        // vers=3 negotiates the highest of 3.02 and 3.0.
        let mut result = self.mount_with_vers(mounter, remote, &options, "3.1.1");
        if result.is_err() {
            result = self.mount_with_vers(mounter, remote, &options, "3");
        }
        wipe_string(&mut options);

        result.map_err(|err| {
            info!(remote = %remote.display(), %err, "CIFS mount failed");
            Error::from_io(&err, "Failed to mount CIFS share")
        })
    }

    fn mount_with_vers(
        &self,
        mounter: &dyn SmbMounter,
        remote: &Path,
        options: &str,
        version: &str,
    ) -> std::io::Result<()> {
        let mut full = format!("{options},vers={version}");
        let result = mounter.mount(remote, self.mount_dir, &full);
        wipe_string(&mut full);
        if let Err(err) = &result {
            info!(version, %err, "mount attempt failed");
        }
        result
    }
}
