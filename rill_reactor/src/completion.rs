//! One-shot completion latch shared between the dispatch thread and waiters.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Sticky one-shot signal. `fire` is called exactly once; waits that arrive
/// after the fact succeed immediately, so a shared handle can be waited on by
/// more than one thread and more than one time.
pub(crate) struct Completion {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Completion {
        Completion {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn fire(&self) {
        let mut fired = self.fired.lock().unwrap();
        *fired = true;
        self.cond.notify_all();
    }

    /// Returns `true` if the latch fired within `timeout`.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let fired = self.fired.lock().unwrap();
        let (fired, _) = self
            .cond
            .wait_timeout_while(fired, timeout, |fired| !*fired)
            .unwrap();
        *fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_after_fire_succeeds_immediately() {
        let completion = Completion::new();
        completion.fire();
        assert!(completion.wait_for(Duration::from_millis(0)));
        assert!(completion.wait_for(Duration::from_millis(0)));
    }

    #[test]
    fn wait_times_out_when_never_fired() {
        let completion = Completion::new();
        assert!(!completion.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn fire_from_another_thread_wakes_the_waiter() {
        let completion = Arc::new(Completion::new());
        let firing = thread::spawn({
            let completion = completion.clone();
            move || {
                thread::sleep(Duration::from_millis(20));
                completion.fire();
            }
        });
        assert!(completion.wait_for(Duration::from_secs(5)));
        firing.join().unwrap();
    }
}
