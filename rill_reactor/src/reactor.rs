//! Single-threaded readiness reactor.
//!
//! One dispatch thread calls [`Reactor::run`] and executes every callback;
//! any other thread may register, modify, or unregister descriptors and
//! synchronize with the loop through [`Reactor::stop`],
//! [`Reactor::wait_for_idle`], and
//! [`Reactor::wait_for_unregistered_reactable`], including from inside a
//! running callback.
//!
//! # Design
//!
//! Each registration is tracked by a reactable record keyed by a `u64` tag
//! that is also the opaque per-watch tag handed to the multiplexer. Tags
//! are never reused, so a tag still sitting in an already-collected batch
//! after its watch was removed can always be recognized as stale: the
//! dispatch loop consults a per-batch invalidation list and the registration
//! table before touching the record. A reactable unregistered while its own
//! callback is running is deleted by the dispatch thread once the callback
//! returns, and a one-shot finish signal lets the unregistering thread wait
//! for that moment.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::builder::ReactorBuilder;
use crate::completion::Completion;
use crate::epoll::{retry_on_eintr, Epoll};
use crate::event::Event;

/// Tag the control channel is watched under; real registrations start at 1.
pub(crate) const CONTROL_TAG: u64 = 0;

const STOP_REACTOR: u64 = 1 << 0;
const WAIT_FOR_IDLE: u64 = 1 << 1;

/// Interest bits for a populated read callback. Peer close is folded into
/// read-readiness, matching how it is reported back.
const READ_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const WRITE_INTEREST: u32 = libc::EPOLLOUT as u32;

/// Readiness bits that fire the read callback: errors and hang-ups surface
/// as read-readiness so the owner observes them through a failing read.
const READ_READY: u32 =
    (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;
const WRITE_READY: u32 = libc::EPOLLOUT as u32;

/// Zero-argument callback executed on the dispatch thread.
pub type Callback = Box<dyn Fn() + Send + Sync + 'static>;

/// Which readiness a registration reacts to after
/// [`Reactor::modify_registration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactOn {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Handle to an active registration, returned by [`Reactor::register`].
///
/// The caller keeps it for later modification or unregistration; copies are
/// cheap and refer to the same registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactableHandle {
    tag: u64,
}

/// Bookkeeping record for one registered descriptor.
struct Reactable {
    fd: RawFd,
    on_read_ready: Option<Callback>,
    on_write_ready: Option<Callback>,
    state: Mutex<ReactableState>,
}

#[derive(Default)]
struct ReactableState {
    /// True only while the dispatch thread is inside one of the callbacks.
    is_executing: bool,
    /// Set when an unregister arrived during this reactable's own callback.
    removed: bool,
    /// Fired by the dispatch thread once the running callback has returned.
    finished: Option<Arc<Completion>>,
}

/// Shared reactor state. Lock order: this lock before any reactable lock.
#[derive(Default)]
pub(crate) struct ReactorState {
    registrations: HashMap<u64, Arc<Reactable>>,
    /// Tags unregistered while the current batch is being processed.
    invalidation_list: Vec<u64>,
    idle: Option<Arc<Completion>>,
    last_unregistered: Option<Arc<Completion>>,
}

/// The event-loop core: owns the multiplexer and the registration table and
/// dispatches callbacks from a single thread.
pub struct Reactor {
    pub(crate) epoll: Epoll,
    pub(crate) control_fd: RawFd,
    pub(crate) running: AtomicBool,
    pub(crate) next_tag: AtomicU64,
    pub(crate) max_events: usize,
    pub(crate) idle_timeout_ms: i32,
    pub(crate) state: Mutex<ReactorState>,
}

impl Reactor {
    /// Create a reactor with the default tuning.
    pub fn new() -> Reactor {
        ReactorBuilder::default().build()
    }

    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::new()
    }

    /// Convenience constructor for an [`Event`] to pair with a registration.
    pub fn new_event(&self) -> Event {
        Event::new()
    }

    /// Run the dispatch loop on the calling thread until [`stop`] is
    /// observed. All callbacks execute here.
    ///
    /// # Panics
    /// Panics if the reactor is already running.
    ///
    /// [`stop`]: Reactor::stop
    pub fn run(&self) {
        let already_running = self.running.swap(true, Ordering::SeqCst);
        assert!(!already_running, "reactor is already running");

        let mut timeout_ms: i32 = -1;
        let mut waiting_for_idle = false;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        loop {
            // Delimits the batch: anything unregistered from here on must be
            // skipped if its readiness is part of this batch.
            self.state.lock().unwrap().invalidation_list.clear();

            let count = self.epoll.wait(&mut events, timeout_ms);
            if waiting_for_idle && count == 0 {
                timeout_ms = -1;
                waiting_for_idle = false;
                let idle = self.state.lock().unwrap().idle.take();
                if let Some(idle) = idle {
                    idle.fire();
                }
            }

            for event in &events[..count] {
                let ready = event.events;
                let tag = event.u64;
                assert!(ready != 0);

                if tag == CONTROL_TAG {
                    let mut command: u64 = 0;
                    let _ = unsafe {
                        libc::read(
                            self.control_fd,
                            &mut command as *mut u64 as *mut libc::c_void,
                            8,
                        )
                    };
                    if command & STOP_REACTOR != 0 {
                        self.running.store(false, Ordering::SeqCst);
                        return;
                    } else if command & WAIT_FOR_IDLE != 0 {
                        timeout_ms = self.idle_timeout_ms;
                        waiting_for_idle = true;
                        continue;
                    } else {
                        tracing::error!("unknown control command {:#x}", command);
                        continue;
                    }
                }

                let reactable = {
                    let mut state = self.state.lock().unwrap();
                    state.last_unregistered = None;
                    // The tag may be stale: its watch can be gone while the
                    // readiness it produced still sits in this batch.
                    if state.invalidation_list.contains(&tag) {
                        continue;
                    }
                    let Some(reactable) = state.registrations.get(&tag) else {
                        continue;
                    };
                    let reactable = reactable.clone();
                    reactable.state.lock().unwrap().is_executing = true;
                    reactable
                };

                if ready & READ_READY != 0 {
                    if let Some(on_read_ready) = &reactable.on_read_ready {
                        on_read_ready();
                    }
                }
                if ready & WRITE_READY != 0 {
                    if let Some(on_write_ready) = &reactable.on_write_ready {
                        on_write_ready();
                    }
                }

                let mut reactable_state = reactable.state.lock().unwrap();
                reactable_state.is_executing = false;
                if reactable_state.removed {
                    let finished = reactable_state.finished.take();
                    drop(reactable_state);
                    if let Some(finished) = finished {
                        finished.fire();
                    }
                    // Dropping `reactable` releases the last reference; the
                    // registration table entry is already gone.
                }
            }
        }
    }

    /// Terminate the dispatch loop at its next wake-up.
    ///
    /// Asynchronous: the loop may still be executing a callback when this
    /// returns, and joining the dispatch thread is the caller's job. Safe to
    /// call before [`run`]; the command is latched.
    ///
    /// [`run`]: Reactor::run
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            tracing::warn!("reactor is not running, it will stop once started");
        }
        self.send_control(STOP_REACTOR);
    }

    /// Watch `fd` and invoke the populated callbacks on the dispatch thread
    /// when it becomes ready. The descriptor stays owned by the caller.
    ///
    /// # Panics
    /// Panics if both callback slots are empty or the multiplexer refuses
    /// the descriptor.
    #[tracing::instrument(level = "trace", skip(self, on_read_ready, on_write_ready))]
    pub fn register(
        &self,
        fd: RawFd,
        on_read_ready: Option<Callback>,
        on_write_ready: Option<Callback>,
    ) -> ReactableHandle {
        assert!(
            on_read_ready.is_some() || on_write_ready.is_some(),
            "registering fd {} with no callbacks",
            fd
        );
        let mut poll_event_type = 0;
        if on_read_ready.is_some() {
            poll_event_type |= READ_INTEREST;
        }
        if on_write_ready.is_some() {
            poll_event_type |= WRITE_INTEREST;
        }

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let reactable = Arc::new(Reactable {
            fd,
            on_read_ready,
            on_write_ready,
            state: Mutex::new(ReactableState::default()),
        });
        {
            // Insert before the watch goes live so the dispatch thread can
            // resolve the tag as soon as the kernel may deliver it.
            let mut state = self.state.lock().unwrap();
            state.registrations.insert(tag, reactable);
            self.epoll.add(fd, poll_event_type, tag);
        }
        ReactableHandle { tag }
    }

    /// Change which readiness the registration reacts to. The caller is
    /// trusted to have populated the callbacks the new mode requires.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn modify_registration(&self, handle: ReactableHandle, react_on: ReactOn) {
        let mut poll_event_type = 0;
        if matches!(react_on, ReactOn::ReadOnly | ReactOn::ReadWrite) {
            poll_event_type |= READ_INTEREST;
        }
        if matches!(react_on, ReactOn::WriteOnly | ReactOn::ReadWrite) {
            poll_event_type |= WRITE_INTEREST;
        }

        let state = self.state.lock().unwrap();
        let reactable = state
            .registrations
            .get(&handle.tag)
            .expect("modifying a reactable that is not registered");
        self.epoll.modify(reactable.fd, poll_event_type, handle.tag);
    }

    /// Remove a registration.
    ///
    /// If the dispatch thread is currently inside this reactable's callback,
    /// deletion is deferred to the end of that callback and a finish signal
    /// is published for [`wait_for_unregistered_reactable`]; otherwise the
    /// record is deleted before this returns. Either way no event later in
    /// the current batch will fire for it.
    ///
    /// [`wait_for_unregistered_reactable`]: Reactor::wait_for_unregistered_reactable
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn unregister(&self, handle: ReactableHandle) {
        let mut immediate_delete = None;
        {
            let mut state = self.state.lock().unwrap();
            state.invalidation_list.push(handle.tag);
            let reactable = state
                .registrations
                .remove(&handle.tag)
                .expect("unregistering a reactable that is not registered");

            let deferred = {
                let mut reactable_state = reactable.state.lock().unwrap();
                if !self.epoll.remove(reactable.fd) {
                    tracing::info!(fd = reactable.fd, "reactable already absent from the multiplexer");
                }
                // Unregistering from inside this reactable's own callback:
                // the dispatch thread deletes it once the callback returns.
                if reactable_state.is_executing {
                    reactable_state.removed = true;
                    let finished = Arc::new(Completion::new());
                    reactable_state.finished = Some(finished.clone());
                    state.last_unregistered = Some(finished);
                    true
                } else {
                    false
                }
            };
            if !deferred {
                immediate_delete = Some(reactable);
            }
        }
        // Deleted here, after every lock is released.
        drop(immediate_delete);
    }

    /// Block the calling thread until the dispatch loop drains, or `timeout`
    /// elapses. Returns whether the reactor went idle in time.
    ///
    /// # Panics
    /// Panics if another wait-for-idle is still outstanding.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let idle = Arc::new(Completion::new());
        {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.idle.is_none(),
                "a wait-for-idle is already outstanding"
            );
            state.idle = Some(idle.clone());
        }
        self.send_control(WAIT_FOR_IDLE);
        idle.wait_for(timeout)
    }

    /// Block until the most recently deferred unregistration has finished its
    /// callback, or `timeout` elapses. Returns `true` immediately when no
    /// deferred deletion is pending.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn wait_for_unregistered_reactable(&self, timeout: Duration) -> bool {
        let finished = self.state.lock().unwrap().last_unregistered.clone();
        let Some(finished) = finished else {
            return true;
        };
        let finished_in_time = finished.wait_for(timeout);
        if !finished_in_time {
            tracing::error!("timed out waiting for the unregistered reactable to finish");
        }
        finished_in_time
    }

    fn send_control(&self, command: u64) {
        let written = unsafe {
            libc::write(
                self.control_fd,
                &command as *const u64 as *const libc::c_void,
                8,
            )
        };
        assert!(
            written == 8,
            "could not write control command {:#x}: {}",
            command,
            io::Error::last_os_error()
        );
    }
}

impl Default for Reactor {
    fn default() -> Reactor {
        Reactor::new()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        assert!(
            !self.running.load(Ordering::SeqCst),
            "reactor dropped while its dispatch loop is running"
        );
        self.epoll.remove(self.control_fd);
        let result = retry_on_eintr(|| unsafe { libc::close(self.control_fd) });
        assert!(
            result != -1,
            "could not close control fd {}: {}",
            self.control_fd,
            io::Error::last_os_error()
        );
    }
}
