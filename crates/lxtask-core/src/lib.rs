//! # lxtask-core
//!
//! Low-level primitives of the lxtask supervision engine.
//!
//! This crate turns an abstract task specification into the native
//! directives a container runtime understands, without talking to the
//! runtime itself:
//! - **Filesystem**: ordered bind mount plan, user volumes, and the
//!   sandbox-escape guard.
//! - **Cgroups**: device access rules, the unified/legacy key generations,
//!   and CPU/memory accounting parsers.
//! - **Namespaces**: network attachment directives and liveness probing of
//!   processes in a foreign PID namespace.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
