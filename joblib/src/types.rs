use std::fmt;
use std::time::SystemTime;

use uuid::Uuid;

pub type JobId = Uuid;
pub type Tenant = String;
pub type Program = String;
pub type Args = Vec<String>;

/// Per-job monotonically increasing subscriber identity.
pub type SubscriberId = u64;

/// Lifecycle states of a job. Transitions form a strict DAG:
/// `Init -> Running -> Terminated -> Finished`, plus the fast-fail edge
/// `Init -> Finished` when startup itself fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Init,
    Running,
    Terminated,
    Finished,
}

impl JobState {
    /// Exit code and exit error are only readable once the child has been
    /// reaped.
    pub fn has_exit_info(self) -> bool {
        matches!(self, JobState::Terminated | JobState::Finished)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Init => "init",
            JobState::Running => "running",
            JobState::Terminated => "terminated",
            JobState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// A consistent point-in-time view of one job, taken under the job's state
/// lock. `end_ts` is unset while the job is running.
#[derive(Clone, Debug)]
pub struct JobSnapshot {
    pub id: JobId,
    pub command: Program,
    pub args: Args,
    pub state: JobState,
    pub start_ts: SystemTime,
    pub end_ts: Option<SystemTime>,
    pub exit_code: i32,
    pub exit_error: String,
}
