//! Counted wake-up primitive backed by an eventfd semaphore.

use std::io;
use std::os::unix::io::RawFd;

use crate::epoll::retry_on_eintr;

/// Inter-thread notifier with semaphore semantics: every [`notify`] deposits
/// one token, every successful [`read`] consumes exactly one.
///
/// The event is not tied to any reactor. Callers that want dispatch-thread
/// delivery register [`id`] with a reactor and consume tokens from the read
/// callback.
///
/// [`notify`]: Event::notify
/// [`read`]: Event::read
/// [`id`]: Event::id
pub struct Event {
    fd: RawFd,
}

impl Event {
    /// Create a new non-blocking counted notifier.
    ///
    /// # Panics
    /// Panics if the kernel refuses to allocate the descriptor.
    pub fn new() -> Event {
        let fd = unsafe { libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK) };
        assert!(
            fd != -1,
            "unable to create the eventfd semaphore: {}",
            io::Error::last_os_error()
        );
        Event { fd }
    }

    /// The pollable descriptor behind this event.
    pub fn id(&self) -> RawFd {
        self.fd
    }

    /// Deposit one token. Safe from any thread, never blocks.
    pub fn notify(&self) {
        let token: u64 = 1;
        let written =
            unsafe { libc::write(self.fd, &token as *const u64 as *const libc::c_void, 8) };
        assert!(
            written == 8,
            "could not notify event fd {}: {}",
            self.fd,
            io::Error::last_os_error()
        );
    }

    /// Consume at most one token; returns whether one was consumed.
    pub fn read(&self) -> bool {
        let mut token: u64 = 0;
        let count = unsafe { libc::read(self.fd, &mut token as *mut u64 as *mut libc::c_void, 8) };
        count == 8
    }

    /// Drain every pending token without blocking.
    pub fn clear(&self) {
        while self.read() {}
    }

    /// Release the underlying descriptor.
    ///
    /// # Panics
    /// Panics if called twice or if the close itself fails.
    pub fn close(&mut self) {
        assert!(self.fd != -1, "event fd closed twice");
        let result = retry_on_eintr(|| unsafe { libc::close(self.fd) });
        assert!(
            result != -1,
            "could not close event fd {}: {}",
            self.fd,
            io::Error::last_os_error()
        );
        self.fd = -1;
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if self.fd != -1 {
            let _ = retry_on_eintr(|| unsafe { libc::close(self.fd) });
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_then_read_consumes_one_token() {
        let event = Event::new();
        assert!(!event.read());
        event.notify();
        assert!(event.read());
        assert!(!event.read());
    }

    #[test]
    fn each_read_consumes_exactly_one_token() {
        let event = Event::new();
        event.notify();
        event.notify();
        assert!(event.read());
        assert!(event.read());
        assert!(!event.read());
    }

    #[test]
    fn clear_drains_every_pending_token() {
        let event = Event::new();
        for _ in 0..5 {
            event.notify();
        }
        event.clear();
        assert!(!event.read());
    }

    #[test]
    fn notify_is_safe_from_other_threads() {
        let event = Arc::new(Event::new());
        let notifiers: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || event.notify())
            })
            .collect();
        for notifier in notifiers {
            notifier.join().unwrap();
        }

        let mut tokens = 0;
        while event.read() {
            tokens += 1;
        }
        assert_eq!(tokens, 4);
    }

    #[test]
    fn close_releases_the_descriptor() {
        let mut event = Event::new();
        event.close();
        // Drop must not attempt a second close.
    }
}
