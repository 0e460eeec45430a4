//! Single-threaded fd readiness reactor.
//!
//! This crate provides the synchronization substrate for subsystems that
//! own a dispatch thread: a [`Reactor`] multiplexes readiness of registered
//! descriptors and runs the owner's callbacks on that one thread, while the
//! registration API stays safe to call from anywhere, including from inside
//! a callback. The standalone [`Event`] primitive is a counted notifier
//! whose descriptor can be registered like any other.
//!
//! Subsystems that need parallelism run distinct reactors on distinct
//! threads; one reactor never dispatches from more than one thread.

mod completion;
mod epoll;

pub mod builder;
pub mod event;
pub mod reactor;

pub use builder::ReactorBuilder;
pub use event::Event;
pub use reactor::{Callback, ReactOn, ReactableHandle, Reactor};
