//! Shared-memory region (C3): the single named segment carrying the request
//! queue, the account table, and every synchronization primitive used by
//! the server and its Tellers.
//!
//! Built on raw `libc` calls the way other crates reach for them where the
//! safe ecosystem doesn't cover POSIX shared memory or unnamed
//! process-shared semaphores.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use thiserror::Error;

use crate::account::AccountTable;
use crate::queue::{RequestSlot, REQ_QUEUE_LEN};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid shared-memory segment name {0:?}")]
    InvalidName(String),
    #[error("shm_open failed: {0}")]
    ShmOpen(#[source] io::Error),
    #[error("ftruncate failed: {0}")]
    Ftruncate(#[source] io::Error),
    #[error("mmap failed: {0}")]
    Mmap(#[source] io::Error),
    #[error("semaphore init failed: {0}")]
    SemInit(#[source] io::Error),
    #[error("timed out acquiring the database mutex on an existing region")]
    AttachTimeout,
    #[error("semaphore wait failed: {0}")]
    SemWait(#[source] io::Error),
    #[error("shm_unlink failed: {0}")]
    ShmUnlink(#[source] io::Error),
}

/// An unnamed, process-shared POSIX semaphore, stored inline so it lives at
/// a fixed offset inside the mapped region (both server and Teller map the
/// same bytes, so the `sem_t` itself, not a pointer to one, must live in
/// shared memory).
#[repr(transparent)]
pub struct Semaphore(libc::sem_t);

impl Semaphore {
    /// # Safety
    /// `self` must be at its final address in shared memory and not yet
    /// initialized; callers must not move it afterwards.
    unsafe fn init(&mut self, value: u32) -> Result<(), Error> {
        let rc = libc::sem_init(&mut self.0, 1 /* pshared */, value);
        if rc != 0 {
            return Err(Error::SemInit(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn wait(&self) -> Result<(), Error> {
        let sem = &self.0 as *const libc::sem_t as *mut libc::sem_t;
        loop {
            // SAFETY: `sem` points at an initialized, process-shared sem_t.
            let rc = unsafe { libc::sem_wait(sem) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::SemWait(err));
        }
    }

    pub fn post(&self) -> Result<(), Error> {
        let sem = &self.0 as *const libc::sem_t as *mut libc::sem_t;
        // SAFETY: see `wait`.
        let rc = unsafe { libc::sem_post(sem) };
        if rc != 0 {
            return Err(Error::SemWait(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Waits up to `timeout`, used only to detect a stuck `db_mutex` on
    /// attach, when a previous unclean exit may have left it locked.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool, Error> {
        let deadline = now_plus(timeout);
        let sem = &self.0 as *const libc::sem_t as *mut libc::sem_t;
        loop {
            // SAFETY: see `wait`.
            let rc = unsafe { libc::sem_timedwait(sem, &deadline) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(Error::SemWait(err)),
            }
        }
    }

    unsafe fn destroy(&mut self) {
        libc::sem_destroy(&mut self.0);
    }
}

fn now_plus(d: Duration) -> libc::timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: CLOCK_REALTIME is always available; `ts` is a valid out-param.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec += d.as_secs() as libc::time_t;
    ts.tv_nsec += d.subsec_nanos() as i64;
    if ts.tv_nsec >= 1_000_000_000 {
        ts.tv_sec += 1;
        ts.tv_nsec -= 1_000_000_000;
    }
    ts
}

/// Everything visible to every process attached to the segment. `repr(C)`
/// so its layout is stable across the server and Teller binaries (same
/// compilation unit layout, different address spaces).
#[repr(C)]
pub struct SharedRegion {
    pub head: u32,
    pub tail: u32,
    pub slots: [RequestSlot; REQ_QUEUE_LEN],
    pub accounts: AccountTable,
    pub free_slots: Semaphore,
    pub filled_slots: Semaphore,
    pub queue_mutex: Semaphore,
    pub db_mutex: Semaphore,
    pub response_ready: [Semaphore; REQ_QUEUE_LEN],
}

/// Bounded wait when attaching to a pre-existing region, to detect a stuck
/// or stale `db_mutex` left by an ungraceful prior exit.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// An owned mapping of the shared segment. Only the server sets `owner =
/// true` and is the only process allowed to call `destroy`.
pub struct ShmHandle {
    ptr: *mut SharedRegion,
    fd: RawFd,
    name: String,
    owner: bool,
}

// SAFETY: the pointee lives in a POSIX shared-memory segment explicitly
// designed to be accessed from multiple processes/threads under the
// semaphores it contains; the handle itself carries no thread-local state.
unsafe impl Send for ShmHandle {}
unsafe impl Sync for ShmHandle {}

fn shm_name_cstring(name: &str) -> Result<CString, Error> {
    if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
        return Err(Error::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))
}

impl ShmHandle {
    /// Implements the creation policy: try exclusive-create; on EEXIST,
    /// attach and bound-wait on `db_mutex` to detect a stale region.
    pub fn create_or_attach(name: &str) -> Result<(Self, bool), Error> {
        let cname = shm_name_cstring(name)?;
        let size = std::mem::size_of::<SharedRegion>();

        // SAFETY: cname is a valid, NUL-terminated C string.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };

        if fd >= 0 {
            let handle = Self::map_and_init(fd, name, size, true)?;
            return Ok((handle, true));
        }

        let create_err = io::Error::last_os_error();
        if create_err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::ShmOpen(create_err));
        }

        // SAFETY: cname is a valid, NUL-terminated C string.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(Error::ShmOpen(io::Error::last_os_error()));
        }
        let handle = Self::map_existing(fd, name, size)?;
        if !handle.region().db_mutex.timed_wait(ATTACH_TIMEOUT)? {
            return Err(Error::AttachTimeout);
        }
        handle.region().db_mutex.post()?;
        Ok((handle, false))
    }

    fn map_and_init(fd: RawFd, name: &str, size: usize, fresh: bool) -> Result<Self, Error> {
        // SAFETY: fd was just opened with O_CREAT and is ours alone until
        // sized; ftruncate on a freshly created object is always valid.
        if fresh && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Ftruncate(err));
        }
        let handle = Self::map_existing(fd, name, size)?;
        if fresh {
            // SAFETY: we hold the only reference to a freshly sized, zeroed
            // mapping; no other process can have attached yet.
            unsafe { handle.init_fresh() };
        }
        Ok(handle)
    }

    fn map_existing(fd: RawFd, name: &str, size: usize) -> Result<Self, Error> {
        // SAFETY: fd is a valid, open shared-memory descriptor sized to at
        // least `size` bytes (guaranteed by the creator before any peer
        // attaches).
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Mmap(err));
        }
        Ok(Self {
            ptr: ptr as *mut SharedRegion,
            fd,
            name: name.to_string(),
            owner: false,
        })
    }

    /// # Safety
    /// Must only be called once, by the process that created the segment,
    /// before any other process has attached to it.
    unsafe fn init_fresh(&self) {
        let region = &mut *self.ptr;
        region.head = 0;
        region.tail = 0;
        region.accounts.init();
        region.free_slots.init(REQ_QUEUE_LEN as u32).expect("sem_init free_slots");
        region.filled_slots.init(0).expect("sem_init filled_slots");
        region.queue_mutex.init(1).expect("sem_init queue_mutex");
        region.db_mutex.init(1).expect("sem_init db_mutex");
        for sem in region.response_ready.iter_mut() {
            sem.init(0).expect("sem_init response_ready");
        }
    }

    pub fn mark_owner(&mut self) {
        self.owner = true;
    }

    pub fn region(&self) -> &SharedRegion {
        // SAFETY: `ptr` is a valid mapping for the lifetime of `self`.
        unsafe { &*self.ptr }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn region_mut(&self) -> &mut SharedRegion {
        // SAFETY: the caller is responsible for holding the semaphore that
        // guards whichever field it touches (`db_mutex` for accounts and
        // next_id, `queue_mutex` for head/tail, per-slot exclusivity for
        // request fields). Interior mutability through a shared reference
        // stands in for a process-shared mutex, which `&mut` cannot express
        // across process boundaries.
        unsafe { &mut *self.ptr }
    }

    /// Only the server calls this, as the sole destroyer.
    pub fn destroy(self) -> Result<(), Error> {
        let name = self.name.clone();
        // SAFETY: called only after shutdown has stopped all Tellers from
        // touching the region (server-only invariant documented above).
        unsafe {
            let region = &mut *self.ptr;
            region.free_slots.destroy();
            region.filled_slots.destroy();
            region.queue_mutex.destroy();
            region.db_mutex.destroy();
            for sem in region.response_ready.iter_mut() {
                sem.destroy();
            }
        }
        let cname = shm_name_cstring(&name)?;
        // SAFETY: cname was validated on construction.
        let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if rc != 0 {
            return Err(Error::ShmUnlink(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for ShmHandle {
    fn drop(&mut self) {
        let size = std::mem::size_of::<SharedRegion>();
        // SAFETY: `ptr`/`fd` were produced by a successful mmap/shm_open in
        // this same struct and are only ever dropped once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, size);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_without_leading_slash() {
        assert!(matches!(shm_name_cstring("adabank"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn rejects_names_with_interior_slashes() {
        assert!(matches!(shm_name_cstring("/a/b"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn accepts_well_formed_names() {
        assert!(shm_name_cstring("/adabank-test").is_ok());
    }

    #[test]
    fn create_then_attach_round_trips_state() {
        let name = format!("/adabank-test-{}", std::process::id());
        let (mut creator, created) = ShmHandle::create_or_attach(&name).unwrap();
        assert!(created);
        creator.mark_owner();
        creator.region_mut().accounts.create(0, 500).unwrap();

        let (attacher, created_again) = ShmHandle::create_or_attach(&name).unwrap();
        assert!(!created_again);
        assert_eq!(attacher.region().accounts.balance(0).unwrap(), 500);

        drop(attacher);
        creator.destroy().unwrap();
    }
}
