//! Per-job chroot construction: a fixed, ordered plan of read-only bind
//! mounts plus /proc and cgroup2, created under one root directory per
//! job and torn down in reverse.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use tracing::error;

use crate::error::{Error, Result};

/// Only roots under a home-like prefix are accepted, as a guard against
/// rooting the host.
const PERMITTED_PREFIX: &str = "/home";

struct PlanEntry {
    source: Option<&'static str>,
    target: &'static str,
    fstype: Option<&'static str>,
    flags: MsFlags,
}

const RDONLY_BIND: MsFlags = MsFlags::MS_BIND.union(MsFlags::MS_RDONLY);

/// The mount plan, in mount order. Teardown unmounts the recorded
/// successful prefix of this list, in reverse.
const MOUNT_PLAN: &[PlanEntry] = &[
    PlanEntry { source: Some("/usr/bin"), target: "usr/bin", fstype: None, flags: RDONLY_BIND },
    PlanEntry { source: Some("/usr/lib"), target: "usr/lib", fstype: None, flags: RDONLY_BIND },
    PlanEntry { source: Some("/usr/sbin"), target: "usr/sbin", fstype: None, flags: RDONLY_BIND },
    PlanEntry { source: Some("/lib"), target: "lib", fstype: None, flags: RDONLY_BIND },
    PlanEntry { source: Some("/bin"), target: "bin", fstype: None, flags: RDONLY_BIND },
    PlanEntry { source: Some("/lib64"), target: "lib64", fstype: None, flags: RDONLY_BIND },
    PlanEntry { source: Some("proc"), target: "proc", fstype: Some("proc"), flags: MsFlags::empty() },
    PlanEntry { source: None, target: "sys/fs/cgroup", fstype: Some("cgroup2"), flags: MsFlags::empty() },
];

/// Builds and owns one job's chroot directory.
pub struct RootfsBuilder {
    root: PathBuf,
    root_already_existed: bool,
    /// Target suffixes that mounted successfully, in mount order.
    mounted: Vec<&'static str>,
}

impl RootfsBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RootfsBuilder {
            root: root.into(),
            // Conservative until mount() has checked: never delete a root
            // this builder did not create.
            root_already_existed: true,
            mounted: Vec::new(),
        }
    }

    /// Resolves the root to an absolute path, enforces the prefix policy,
    /// and performs the mount plan in order. Stops at the first failure;
    /// teardown will only touch the rows that completed.
    pub fn mount(&mut self) -> Result<()> {
        let abs = std::path::absolute(&self.root).map_err(|e| Error::host("resolve", &self.root, e))?;
        if !abs.starts_with(PERMITTED_PREFIX) {
            return Err(Error::PolicyViolation(abs));
        }
        // Remember whether we created the root so teardown knows whether
        // to delete it.
        self.root_already_existed = abs.exists();
        self.root = abs;

        for entry in MOUNT_PLAN {
            let target = self.root.join(entry.target);
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&target)
                .map_err(|e| Error::host("create mount target", &target, e))?;
            mount(entry.source, &target, entry.fstype, entry.flags, None::<&str>)
                .map_err(|e| Error::host_errno("mount", &target, e))?;
            self.mounted.push(entry.target);
        }
        Ok(())
    }

    /// Absolute root for handing to the launcher. Only meaningful after a
    /// successful `mount`.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Unmounts the successful rows in reverse order, then removes the
    /// root directory if this builder created it. Errors are logged and
    /// swallowed; the call is idempotent.
    pub fn destroy(&mut self) {
        for suffix in std::mem::take(&mut self.mounted).iter().rev() {
            let target = self.root.join(suffix);
            if let Err(e) = umount(&target) {
                error!(target = %target.display(), error = %e, "failed to unmount");
            }
        }
        if !self.root_already_existed && self.root.exists() {
            if let Err(e) = fs::remove_dir_all(&self.root) {
                error!(root = %self.root.display(), error = %e, "failed to remove root directory");
            }
            // Do not retry removal on a second destroy.
            self.root_already_existed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_roots_outside_home() {
        let mut b = RootfsBuilder::new("/tmp/definitely-not-home");
        match b.mount() {
            Err(Error::PolicyViolation(path)) => {
                assert_eq!(path, PathBuf::from("/tmp/definitely-not-home"));
            }
            other => panic!("expected policy violation, got {:?}", other.err()),
        }
    }

    #[test]
    fn plan_mounts_binds_before_kernel_filesystems() {
        // The bind rows must all precede proc and cgroup2 so teardown
        // unwinds the kernel mounts first.
        let first_kernel = MOUNT_PLAN
            .iter()
            .position(|e| e.fstype.is_some())
            .unwrap();
        assert!(MOUNT_PLAN[..first_kernel]
            .iter()
            .all(|e| e.flags.contains(MsFlags::MS_BIND)));
        assert_eq!(MOUNT_PLAN.len(), 8);
        assert_eq!(MOUNT_PLAN.last().unwrap().target, "sys/fs/cgroup");
    }

    // Requires CAP_SYS_ADMIN and a writable /home; run as root with
    // `cargo test -- --ignored`.
    #[test]
    #[ignore = "requires root to perform mounts"]
    fn mounts_and_tears_down() {
        let root = PathBuf::from(format!("/home/{}", uuid::Uuid::new_v4()));
        let mut b = RootfsBuilder::new(&root);
        b.mount().unwrap();
        assert!(root.join("usr/bin").exists());
        assert!(root.join("proc/self").exists());
        b.destroy();
        assert!(!root.exists());
    }
}
