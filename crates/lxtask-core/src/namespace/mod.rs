//! Namespace-facing primitives.
//!
//! The network namespace is configured through LXC directives; the PID
//! namespace is observed from the outside through liveness probes.

pub mod network;
pub mod pid;
