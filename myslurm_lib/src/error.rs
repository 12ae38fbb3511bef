use std::{io, path::PathBuf};

use thiserror::Error;

pub use crate::table::TableError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("log file unavailable for job {jobid}: {reason}")]
    LogUnavailable { jobid: String, reason: String },

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("`{command}` failed: {stderr}")]
    SchedulerFailed { command: String, stderr: String },

    #[error("could not parse scheduler output: {0}")]
    SchedulerParse(String),

    #[error("`{command}` did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("job table {0} is locked by another process")]
    Locked(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
