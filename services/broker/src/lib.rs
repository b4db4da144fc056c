//! Broker service library crate.
//!
//! # Purpose
//! Exposes the service's configuration loading, observability setup, and the
//! application loop that answers relayed requests, for use by the broker binary
//! and its tests.
pub mod app;
pub mod config;
pub mod observability;
