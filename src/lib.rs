//! Facade over the `rill_reactor` crate.
//!
//! Re-exports the reactor surface so hosts depend on one crate: build a
//! [`Reactor`], hand its [`Reactor::run`] loop a thread, and register
//! descriptors (or an [`Event`]'s descriptor) from anywhere.

pub use rill_reactor::builder::ReactorBuilder;
pub use rill_reactor::event::Event;
pub use rill_reactor::reactor::{Callback, ReactOn, ReactableHandle, Reactor};
