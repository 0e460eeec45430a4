//! Demo: echo bytes through a reactor running on its own thread.

use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rill::Reactor;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(true))
        .init();

    let (read_fd, write_fd) = pipe();
    let reactor = Arc::new(Reactor::new());
    let received = Arc::new(Mutex::new(Vec::new()));

    let handle = reactor.register(
        read_fd,
        Some(Box::new({
            let received = received.clone();
            move || {
                let mut byte = [0u8; 1];
                let count =
                    unsafe { libc::read(read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
                if count == 1 {
                    tracing::info!(byte = byte[0], "dispatch thread received a byte");
                    received.lock().unwrap().push(byte[0]);
                }
            }
        })),
        None,
    );

    let dispatch = thread::spawn({
        let reactor = reactor.clone();
        move || reactor.run()
    });

    let mut sender = unsafe { std::fs::File::from_raw_fd(write_fd) };
    sender.write_all(b"ping").expect("write to the demo pipe");

    assert!(reactor.wait_for_idle(Duration::from_secs(1)));
    tracing::info!(received = ?received.lock().unwrap(), "reactor drained");

    reactor.unregister(handle);
    reactor.stop();
    dispatch.join().expect("join the dispatch thread");

    unsafe { libc::close(read_fd) };
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert!(result != -1, "could not create the demo pipe");
    (fds[0], fds[1])
}
