//! # tilecast-host
//!
//! The runnable side of tilecast: a TCP [`hub::TcpReceiverHub`] that
//! receivers connect to, the [`engine::HostEngine`] frame sources, and
//! the TOML [`config::HostConfig`] that wires them into a
//! `SessionManager`.

pub mod config;
pub mod engine;
pub mod hub;
pub mod logging;

pub use config::HostConfig;
pub use engine::{HostEngine, SourceSpec};
pub use hub::TcpReceiverHub;
