//! Thin binding over the kernel readiness multiplexer.
//!
//! Every watch carries an opaque `u64` tag that comes back attached to the
//! readiness events for that descriptor. All syscalls retry transparently on
//! `EINTR`; add/modify failures are unrecoverable and abort with the OS error.

use std::io;
use std::os::unix::io::RawFd;

/// Owned epoll instance.
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> Epoll {
        let fd = retry_on_eintr(|| unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) });
        assert!(
            fd != -1,
            "could not create epoll fd: {}",
            io::Error::last_os_error()
        );
        Epoll { fd }
    }

    /// Start watching `fd` for `events`, delivering `tag` with its readiness.
    pub(crate) fn add(&self, fd: RawFd, events: u32, tag: u64) {
        let mut event = libc::epoll_event { events, u64: tag };
        let result =
            retry_on_eintr(|| unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) });
        assert!(
            result != -1,
            "could not add fd {} to epoll: {}",
            fd,
            io::Error::last_os_error()
        );
    }

    /// Replace the interest set and tag of an existing watch.
    pub(crate) fn modify(&self, fd: RawFd, events: u32, tag: u64) {
        let mut event = libc::epoll_event { events, u64: tag };
        let result =
            retry_on_eintr(|| unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) });
        assert!(
            result != -1,
            "could not modify epoll registration of fd {}: {}",
            fd,
            io::Error::last_os_error()
        );
    }

    /// Stop watching `fd`. Returns `false` if the descriptor was already gone
    /// from the watch set; any other failure aborts.
    pub(crate) fn remove(&self, fd: RawFd) -> bool {
        let result = retry_on_eintr(|| unsafe {
            libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        });
        if result == -1 {
            let error = io::Error::last_os_error();
            assert_eq!(
                error.raw_os_error(),
                Some(libc::ENOENT),
                "could not unregister epoll fd {}: {}",
                fd,
                error
            );
            return false;
        }
        true
    }

    /// Block until at least one watched descriptor is ready or `timeout_ms`
    /// elapses (-1 blocks indefinitely). Fills `events` and returns the count.
    pub(crate) fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> usize {
        let count = retry_on_eintr(|| unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        });
        assert!(
            count != -1,
            "epoll_wait failed: fd={}, err={}",
            self.fd,
            io::Error::last_os_error()
        );
        count as usize
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let result = retry_on_eintr(|| unsafe { libc::close(self.fd) });
        assert!(
            result != -1,
            "could not close epoll fd {}: {}",
            self.fd,
            io::Error::last_os_error()
        );
    }
}

/// Re-issue `op` for as long as it reports `EINTR`.
pub(crate) fn retry_on_eintr<F: FnMut() -> i32>(mut op: F) -> i32 {
    loop {
        let result = op();
        if result != -1 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return result;
        }
    }
}
