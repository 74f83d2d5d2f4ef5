//! Floodgate - Distributed API Admission Control
//!
//! This crate decides whether an incoming API request may proceed. Each
//! request is attributed to an organization, a user or a client address,
//! counted against a fixed-window quota and, when the endpoint declares one,
//! a bound on simultaneous in-flight requests. Counters live in a shared
//! store so every server process enforces the same limits, and the
//! decision is applied by a tower middleware that fails open when the store
//! is unavailable.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
