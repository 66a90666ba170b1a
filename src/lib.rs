//! The OpenSync gateway agent suite: latency observation, MAP-T/MAP-E
//! derivation, thermal control, and the surrounding netfilter/ipset/
//! config-store plumbing that wires those three loops to the host OS.
//!
//! # Guidelines
//!
//! The code should be formatted with Rustfmt using the project-level
//! `rustfmt.toml`. It should pass Clippy in pedantic mode; it's fine to
//! suppress an individual lint locally with `#[allow(clippy::<lint>)]`.

#![warn(missing_docs, unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::module_name_repetitions)]

pub mod agents;
pub mod ble;
pub mod clock;
pub mod config_store;
pub mod consts;
pub mod firewall;
pub mod ipset;
pub mod logger;
pub mod lop;
pub mod map;
pub mod netif;
pub mod report_bus;
pub mod sampler;
pub mod watchdog;
