//! Secret-bearing containers wiped before release.

use crate::error::Error;
use std::{
    env, fs,
    io::Write,
    ops::Deref,
    path::{Path, PathBuf},
    sync::atomic::{compiler_fence, Ordering},
};
use tracing::error;

/// Upper bound on the secret-pipe payload, delimiters included.
pub const SECRET_LIMIT: usize = 1024;

/// Overwrite `buf` in a way the optimizer cannot elide.
pub fn secure_cleanup(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        // write_volatile keeps the store alive even though the buffer is
        // about to be released.
        unsafe { std::ptr::write_volatile(b, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

pub(crate) fn wipe_string(s: &mut String) {
    secure_cleanup(unsafe { s.as_mut_str().as_bytes_mut() });
}

/// Heap buffer zeroed on drop.
pub struct SecureBuffer {
    data: Vec<u8>,
}

impl SecureBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        SecureBuffer { data }
    }
}

impl Deref for SecureBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        secure_cleanup(&mut self.data);
    }
}

/// Username/password pair held in buffers zeroed on drop.
pub struct CredentialsProvider {
    user: String,
    password: String,
    commas_escaped: bool,
}

impl CredentialsProvider {
    pub fn new(user: String, password: String) -> Self {
        CredentialsProvider {
            user,
            password,
            commas_escaped: false,
        }
    }

    /// Split a `user\0pass\0` secret-pipe payload.
    ///
    /// Exactly two NUL delimiters are required and the payload must fit in
    /// [`SECRET_LIMIT`] bytes; anything else is rejected before the buffer
    /// is interpreted.
    pub fn from_secret_pipe(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() > SECRET_LIMIT {
            return Err(Error::InvalidArgument("Secret payload too large".into()));
        }
        let mut nuls = payload.iter().enumerate().filter(|(_, b)| **b == 0);
        let first = nuls.next().map(|(i, _)| i);
        let second = nuls.next().map(|(i, _)| i);
        let (first, second) = match (first, second, nuls.next()) {
            (Some(first), Some(second), None) => (first, second),
            _ => return Err(Error::InvalidArgument("Malformed extra data".into())),
        };

        let user = std::str::from_utf8(&payload[..first])
            .map_err(|_| Error::InvalidArgument("Malformed extra data".into()))?;
        let pass = std::str::from_utf8(&payload[first + 1..second])
            .map_err(|_| Error::InvalidArgument("Malformed extra data".into()))?;
        Ok(CredentialsProvider::new(user.into(), pass.into()))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Double every `,` in the password so it survives CIFS option parsing.
    /// Safe to call more than once.
    pub fn escape_commas(&mut self) {
        if self.commas_escaped {
            return;
        }
        let mut escaped = String::with_capacity(self.password.len() * 2);
        for c in self.password.chars() {
            escaped.push(c);
            if c == ',' {
                escaped.push(',');
            }
        }
        let mut old = std::mem::replace(&mut self.password, escaped);
        wipe_string(&mut old);
        self.commas_escaped = true;
    }

    /// Project the secret into a buffer that is zeroed on drop.
    pub fn pack<F>(&self, formatter: F) -> SecureBuffer
    where
        F: FnOnce(&str, &str, &mut Vec<u8>),
    {
        let mut buf = Vec::new();
        formatter(&self.user, &self.password, &mut buf);
        SecureBuffer::new(buf)
    }
}

impl Drop for CredentialsProvider {
    fn drop(&mut self) {
        wipe_string(&mut self.user);
        wipe_string(&mut self.password);
    }
}

/// Uniquely-named temporary file holding a secret.
///
/// On drop the contents are overwritten with filler bytes up to the original
/// size, then the file is unlinked.
pub struct VolatileFile {
    path: PathBuf,
    size: usize,
}

impl VolatileFile {
    pub fn new(contents: SecureBuffer) -> Result<Self, Error> {
        let mut file = tempfile::Builder::new()
            .prefix("vm-secret-")
            .tempfile_in(env::temp_dir())
            .map_err(|err| Error::from_io(&err, "create secret file"))?;
        file.write_all(&contents)
            .and_then(|()| file.flush())
            .map_err(|err| Error::from_io(&err, "write secret file"))?;
        let (_, path) = file
            .keep()
            .map_err(|err| Error::from_io(&err.error, "persist secret file"))?;
        Ok(VolatileFile {
            path,
            size: contents.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn purge_contents(&self) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new().write(true).open(&self.path)?;
        let filler = [b'*'; SECRET_LIMIT];
        let mut written = 0;
        while written < self.size {
            let chunk = (self.size - written).min(SECRET_LIMIT);
            file.write_all(&filler[..chunk])?;
            written += chunk;
        }
        file.flush()
    }
}

impl Drop for VolatileFile {
    fn drop(&mut self) {
        if let Err(err) = self.purge_contents() {
            error!(path = %self.path.display(), %err, "failed to purge secret file");
        }
        if let Err(err) = fs::remove_file(&self.path) {
            error!(path = %self.path.display(), %err, "failed to remove secret file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn escape_commas_doubles_each_comma_once() {
        let mut creds = CredentialsProvider::new("alice".into(), "pa,ss,".into());
        creds.escape_commas();
        assert_eq!(creds.password(), "pa,,ss,,");
        creds.escape_commas();
        assert_eq!(creds.password(), "pa,,ss,,");
    }

    #[test]
    fn pack_projects_through_formatter() {
        let creds = CredentialsProvider::new("u".into(), "p".into());
        let buf = creds.pack(|_, pass, dest| dest.extend_from_slice(pass.as_bytes()));
        assert_eq!(&*buf, b"p");
    }

    #[test]
    fn secret_pipe_accepts_two_delimiters() {
        let creds = CredentialsProvider::from_secret_pipe(b"alice\0pa,ss\0").unwrap();
        assert_eq!(creds.user(), "alice");
        assert_eq!(creds.password(), "pa,ss");
    }

    #[test]
    fn secret_pipe_rejects_bad_framing() {
        assert!(CredentialsProvider::from_secret_pipe(b"").is_err());
        assert!(CredentialsProvider::from_secret_pipe(b"alicepass").is_err());
        assert!(CredentialsProvider::from_secret_pipe(b"alice\0pass").is_err());
        assert!(CredentialsProvider::from_secret_pipe(b"a\0b\0c\0").is_err());

        let oversized = vec![b'x'; SECRET_LIMIT + 1];
        assert!(CredentialsProvider::from_secret_pipe(&oversized).is_err());

        let mut at_limit = vec![b'x'; SECRET_LIMIT - 2];
        at_limit.push(0);
        at_limit.insert(3, 0);
        assert!(CredentialsProvider::from_secret_pipe(&at_limit).is_ok());
    }

    #[test]
    fn secure_cleanup_zeroes() {
        let mut buf = *b"secret";
        secure_cleanup(&mut buf);
        assert_eq!(buf, [0u8; 6]);
    }

    #[test]
    fn volatile_file_overwrites_and_unlinks() {
        let file = VolatileFile::new(SecureBuffer::new(b"hunter2".to_vec())).unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(fs::read(&path).unwrap(), b"hunter2");

        // Keep a descriptor across the unlink to observe the overwrite.
        let mut held = fs::File::open(&path).unwrap();
        drop(file);

        assert!(!path.exists());
        held.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = Vec::new();
        held.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"*******");
    }
}
