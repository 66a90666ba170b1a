//! A framework for asynchronous message-passing agents.
//!
//! An [`Agent`] is a named unit of concurrent work that runs as an
//! [`agent::Task`] on its own tokio task, exchanging typed messages with the
//! rest of the process over a [`Port`]. Agents never reach into each
//! other's state directly: every cross-component interaction in this crate
//! goes through a `Port::Input`/`Port::Output` pair, so an agent can be
//! tested in isolation by feeding it inputs and inspecting what it emits.

pub mod agent;
pub mod port;

pub use agent::{spawn, Agent, Handle};
pub use port::Port;
