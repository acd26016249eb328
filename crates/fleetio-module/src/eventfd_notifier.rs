//! `EventFdNotifier` — wakes a thread blocked in `epoll_wait`.
//!
//! Created in semaphore mode: every `notify()` adds one token and every
//! `consume()` takes exactly one back, so N synthetic completions wake up
//! to N waiters instead of being coalesced into a single wakeup.

use fleetio_core::error::{QueueError, Result};

use nix::errno::Errno;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking, close-on-exec, semaphore eventfd.
    pub fn create() -> Result<Self> {
        // Safety: plain syscall, result checked below.
        let fd = unsafe {
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE)
        };
        if fd < 0 {
            return Err(QueueError::Setup(io::Error::last_os_error()));
        }
        // Safety: fd was just returned by eventfd and is owned by nobody else.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Add one wakeup token. Never blocks.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        // Safety: writes 8 bytes from a live u64.
        let ret = unsafe {
            libc::write(
                self.fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            Ok(_) => Ok(()),
            // Counter saturated: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(QueueError::Post {
                kind: "notify",
                source: io::Error::from_raw_os_error(e as i32),
            }),
        }
    }

    /// Take one token. `false` when none was pending.
    pub fn consume(&self) -> bool {
        let mut val: u64 = 0;
        // Safety: reads 8 bytes into a live u64.
        let ret = unsafe {
            libc::read(
                self.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        ret == std::mem::size_of::<u64>() as isize
    }
}
