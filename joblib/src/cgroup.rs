//! Per-job cgroup v2 directory management. One directory per job is
//! created directly under the host's cgroup2 mount, populated with the
//! configured controller limits, and handed to the launcher as an open
//! descriptor so the child is placed into the cgroup at clone time.

use std::fs::{self, DirBuilder, File};
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::config::{IoLimit, ResourceLimits};
use crate::error::{Error, Result};
use crate::hostprobe::unescape_mount_path;

const PROC_MOUNTS: &str = "/proc/mounts";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// One configurable controller. Each variant knows its controller name
/// (checked against the parent's `cgroup.subtree_control`) and how to
/// render its limit files.
#[derive(Clone, Copy, Debug)]
enum Controller {
    Cpu { quota_ms: u64, period_ms: u64 },
    Memory { kib: u64 },
    Io(IoLimit),
}

impl Controller {
    fn name(&self) -> &'static str {
        match self {
            Controller::Cpu { .. } => "cpu",
            Controller::Memory { .. } => "memory",
            Controller::Io(_) => "io",
        }
    }

    /// The `(file, value)` writes this controller performs. `io.max` takes
    /// one line per configured direction.
    fn render(&self) -> Vec<(&'static str, String)> {
        match *self {
            Controller::Cpu { quota_ms, period_ms } => {
                vec![("cpu.max", format!("{} {}", quota_ms * 1000, period_ms * 1000))]
            }
            Controller::Memory { kib } => vec![("memory.max", (kib * 1024).to_string())],
            Controller::Io(io) => {
                let mut writes = Vec::new();
                if io.rbps != 0 {
                    writes.push(("io.max", format!("{}:{} rbps={}", io.major, io.minor, io.rbps)));
                }
                if io.wbps != 0 {
                    writes.push(("io.max", format!("{}:{} wbps={}", io.major, io.minor, io.wbps)));
                }
                writes
            }
        }
    }
}

/// Owns one job's cgroup directory from creation to removal.
pub struct CgroupController {
    dir: PathBuf,
    enabled: Vec<String>,
    controllers: Vec<Controller>,
    dir_handle: Option<File>,
    applied: bool,
    created: bool,
}

impl CgroupController {
    /// Locates the host cgroup2 mount and the set of controllers the parent
    /// group delegates. The job's directory is `<cgroup2 mount>/<job_id>`;
    /// nothing is created yet.
    pub fn new(job_id: &str) -> Result<Self> {
        let mounts =
            fs::read_to_string(PROC_MOUNTS).map_err(|e| Error::host("read", PROC_MOUNTS, e))?;
        let mount = cgroup2_mount_point(&mounts).ok_or_else(|| {
            Error::host(
                "locate cgroup2 mount in",
                PROC_MOUNTS,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })?;
        let subtree = mount.join(SUBTREE_CONTROL);
        let enabled = fs::read_to_string(&subtree)
            .map_err(|e| Error::host("read", &subtree, e))?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(CgroupController {
            dir: mount.join(job_id),
            enabled,
            controllers: Vec::new(),
            dir_handle: None,
            applied: false,
            created: false,
        })
    }

    /// Enqueues the limits for `apply`. Zero-valued knobs are left unset.
    pub fn configure(&mut self, limits: &ResourceLimits) {
        if limits.cpu_quota_ms != 0 && limits.cpu_period_ms != 0 {
            self.controllers.push(Controller::Cpu {
                quota_ms: limits.cpu_quota_ms,
                period_ms: limits.cpu_period_ms,
            });
        }
        if limits.memory_kib != 0 {
            self.controllers.push(Controller::Memory {
                kib: limits.memory_kib,
            });
        }
        if let Some(io) = limits.io {
            if io.rbps != 0 || io.wbps != 0 {
                self.controllers.push(Controller::Io(io));
            }
        }
    }

    /// Creates the directory and writes every enqueued controller that the
    /// parent delegates. Controllers missing from `cgroup.subtree_control`
    /// are skipped with a warning; a failed write on a delegated controller
    /// rolls the directory back and is fatal. A second call is a no-op.
    pub fn apply(&mut self) -> Result<()> {
        if self.applied {
            return Ok(());
        }
        DirBuilder::new()
            .mode(0o755)
            .create(&self.dir)
            .map_err(|e| Error::host("create cgroup directory", &self.dir, e))?;
        self.created = true;
        for controller in std::mem::take(&mut self.controllers) {
            if !self.enabled.iter().any(|name| name == controller.name()) {
                warn!(
                    controller = controller.name(),
                    cgroup = %self.dir.display(),
                    "controller is not enabled in cgroup.subtree_control, skipping"
                );
                continue;
            }
            for (file, value) in controller.render() {
                let path = self.dir.join(file);
                if let Err(e) = fs::write(&path, &value) {
                    self.destroy();
                    return Err(Error::host("write cgroup limit", path, e));
                }
                debug!(file = %path.display(), value = %value, "cgroup limit set");
            }
        }
        self.applied = true;
        Ok(())
    }

    /// An O_RDONLY descriptor on the job's cgroup directory, for handing to
    /// `clone3` as the spawn-into cgroup. Repeat calls return the same
    /// descriptor.
    pub fn directory_fd(&mut self) -> Result<RawFd> {
        if self.dir_handle.is_none() {
            let handle =
                File::open(&self.dir).map_err(|e| Error::host("open cgroup directory", &self.dir, e))?;
            self.dir_handle = Some(handle);
        }
        Ok(self.dir_handle.as_ref().expect("descriptor just stored").as_raw_fd())
    }

    /// Closes the descriptor and removes the directory. Errors are logged
    /// and swallowed; the call is idempotent.
    pub fn destroy(&mut self) {
        self.dir_handle = None;
        if !self.created {
            return;
        }
        // cgroupfs refuses recursive removal; an empty-of-children group
        // is removed with a plain rmdir.
        if let Err(e) = fs::remove_dir(&self.dir) {
            error!(cgroup = %self.dir.display(), error = %e, "failed to remove cgroup directory");
        }
        self.created = false;
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn cgroup2_mount_point(mounts: &str) -> Option<PathBuf> {
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[2] == "cgroup2" {
            return Some(PathBuf::from(unescape_mount_path(fields[1])));
        }
    }
    None
}
