//! Local job tracking around a Slurm-like batch scheduler.
//!
//! Submissions and accounting polls are merged into a small comma-delimited job table
//! (`table`, `registry`). The scheduler itself is only reached through its command line
//! tools (`bridge`), and every invocation that touches the table holds `lock::TableLock`.

pub mod batch;
pub mod bridge;
pub mod config;
pub mod error;
pub mod lock;
pub mod process;
pub mod registry;
pub mod table;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
