//! Builder for [`Reactor`] instances.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Mutex;
use std::time::Duration;

use crate::epoll::Epoll;
use crate::reactor::{Reactor, ReactorState, CONTROL_TAG};

/// Tuning knobs for a [`Reactor`].
pub struct ReactorBuilder {
    max_events: usize,
    idle_timeout: Duration,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        ReactorBuilder {
            max_events: 64,
            idle_timeout: Duration::from_millis(30),
        }
    }
}

impl ReactorBuilder {
    pub fn new() -> Self {
        ReactorBuilder::default()
    }

    /// Cap on readiness events collected per multiplexer wake-up.
    pub fn max_events(mut self, max_events: usize) -> Self {
        assert!(max_events > 0, "batch size cap must be positive");
        self.max_events = max_events;
        self
    }

    /// Shortened block timeout used while a wait-for-idle command is armed.
    /// A wake-up with zero events within this window declares the reactor
    /// idle.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Allocate the multiplexer, create the control channel, and pre-register
    /// it under the sentinel tag the dispatch loop recognizes.
    ///
    /// # Panics
    /// Panics if the kernel refuses either descriptor.
    pub fn build(self) -> Reactor {
        let epoll = Epoll::new();
        let control_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        assert!(
            control_fd != -1,
            "could not create the control eventfd: {}",
            io::Error::last_os_error()
        );
        epoll.add(control_fd, libc::EPOLLIN as u32, CONTROL_TAG);
        tracing::trace!(
            max_events = self.max_events,
            idle_timeout_ms = self.idle_timeout.as_millis() as u64,
            "reactor created"
        );

        Reactor {
            epoll,
            control_fd,
            running: AtomicBool::new(false),
            next_tag: AtomicU64::new(CONTROL_TAG + 1),
            max_events: self.max_events,
            idle_timeout_ms: self.idle_timeout.as_millis() as i32,
            state: Mutex::new(ReactorState::default()),
        }
    }
}
