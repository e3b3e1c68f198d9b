//! Container filesystem view: bind mounts, devices and user volumes.

pub mod mount;
pub mod volume;
