//! Named-pipe helpers shared by the server, Teller, and client binaries:
//! defensive creation (stale FIFOs from a prior run are unlinked first),
//! and a small `poll`-based readability check used by the server's main
//! loop.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to remove stale fifo at {path}: {source}")]
    Unlink { path: String, #[source] source: io::Error },
    #[error("mkfifo failed for {path}: {source}")]
    Mkfifo { path: String, #[source] source: io::Error },
    #[error("failed to open fifo {path}: {source}")]
    Open { path: String, #[source] source: io::Error },
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

fn path_cstring(path: &Path) -> std::ffi::CString {
    std::ffi::CString::new(path.as_os_str().as_bytes()).expect("path must not contain NUL bytes")
}

/// Creates a FIFO at `path` with mode `0600`, removing anything already
/// there first (a stale FIFO left by a prior unclean exit).
pub fn create(path: &Path) -> Result<(), Error> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| Error::Unlink {
            path: path.display().to_string(),
            source,
        })?;
    }
    let cpath = path_cstring(path);
    // SAFETY: cpath is a valid, NUL-terminated path string.
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(Error::Mkfifo {
            path: path.display().to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Opens a FIFO for reading without blocking until a writer connects.
pub fn open_read_nonblocking(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| Error::Open { path: path.display().to_string(), source })
}

pub fn open_read_blocking(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|source| Error::Open { path: path.display().to_string(), source })
}

pub fn open_write(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| Error::Open { path: path.display().to_string(), source })
}

/// A write-only handle opened non-blocking then kept open for the life of
/// the server, purely to guarantee there is always at least one writer on
/// the server FIFO.
pub fn open_sentinel_writer(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| Error::Open { path: path.display().to_string(), source })
}

/// Waits up to `timeout` for `file` to become readable. Used by the
/// server's main loop instead of a busy-wait; the same no-busy-wait
/// discipline applied to the queue semaphores applies to the FIFO.
pub fn wait_readable(file: &File, timeout: Duration) -> Result<bool, Error> {
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a single, valid pollfd on the stack.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Poll(err));
    }
    Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn create_then_roundtrip_a_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fifo");
        create(&path).unwrap();

        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            let mut f = open_read_blocking(&reader_path).unwrap();
            let mut buf = String::new();
            f.read_to_string(&mut buf).unwrap();
            buf
        });

        let mut writer = open_write(&path).unwrap();
        writer.write_all(b"hello\n").unwrap();
        drop(writer);

        assert_eq!(reader.join().unwrap(), "hello\n");
    }

    #[test]
    fn create_removes_stale_fifo_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fifo");
        create(&path).unwrap();
        create(&path).unwrap(); // must not fail the second time
        assert!(path.exists());
    }
}
