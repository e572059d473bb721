//! Stabilizer - a reverse proxy that keeps an unreliable HTTP backend
//! usable by running it as a pool of disposable worker subprocesses.
//!
//! - Spawns N copies of the wrapped command, each bound to a loopback port
//! - Multiplexes inbound requests onto workers through a bounded permit
//!   pool, so at most N x C requests are in flight at once
//! - Enforces a per-request deadline, overridable per request via header
//! - Kills and respawns workers whose requests time out, even when they are
//!   wedged in a non-cooperative compute loop
//! - Publishes a worker-restart counter for Prometheus

pub mod config;
pub mod demo;
pub mod error;
pub mod metrics;
pub mod port;
pub mod proxy;
pub mod supervisor;
pub mod worker;
