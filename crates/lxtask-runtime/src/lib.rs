//! Task supervision on top of LXC: container setup, monitoring, and recovery.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod driver;
pub mod event;
pub mod handle;
pub mod limits;
pub mod logs;
pub mod metrics;
pub mod state;
pub mod store;

pub use driver::Driver;
