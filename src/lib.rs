//! Burrow - client library for the burrow background networking agent.
//!
//! A burrow CLI invocation needs to reach private IPv6 addresses on
//! per-organization networks. Establishing a WireGuard endpoint per
//! invocation would be expensive and would defeat connection reuse, so a
//! long-lived local daemon (`burrowd`) owns one WireGuard tunnel per
//! organization and exposes them over a Unix socket. This crate is the
//! client half of that arrangement: the wire framing, the typed
//! request/response operations, the daemon bootstrap, and the long-lived
//! resolver and pinger sessions.

pub mod agent;
pub mod config;
pub mod error;

pub use error::{BurrowError, Result};
