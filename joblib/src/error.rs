use std::io;
use std::path::PathBuf;
use std::result;

use crate::types::JobState;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The job id is not present in the registry for the requesting tenant.
    #[error("no such job")]
    NotFound,

    /// The operation is inconsistent with the job's current lifecycle state,
    /// e.g. signalling a job that is no longer running or reading the exit
    /// code before the child has been reaped.
    #[error("invalid job state: {current}")]
    InvalidState { current: JobState },

    /// The job's control inbox cannot accept a new attach event.
    #[error("subscriber control queue is full")]
    CapacityExhausted,

    /// A mount, cgroup write, directory creation, or process-level syscall
    /// failed on the host.
    #[error("{op} {path}: {source}")]
    HostResource {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// The requested root directory does not lie under the permitted prefix.
    #[error("root directory {0} must be under the user home area")]
    PolicyViolation(PathBuf),

    /// The job could not be constructed or spawned at all.
    #[error("failed to start job: {0}")]
    Startup(String),
}

impl Error {
    pub(crate) fn host(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::HostResource {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn host_errno(
        op: &'static str,
        path: impl Into<PathBuf>,
        errno: nix::errno::Errno,
    ) -> Self {
        Self::host(op, path, io::Error::from_raw_os_error(errno as i32))
    }

    pub(crate) fn invalid_state(current: JobState) -> Self {
        Error::InvalidState { current }
    }
}

pub type Result<T> = result::Result<T, Error>;
