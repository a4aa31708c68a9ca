//! Job isolation and multiplexing engine: launch commands in lightly
//! isolated environments (private PID/network/mount namespaces, a per-job
//! chroot, cgroup v2 limits), fan their output out to any number of
//! subscribers, and keep a per-tenant record of every launch.
//!
//! The gRPC façade lives in the `server` crate; this library has no
//! transport knowledge.

pub mod cgroup;
pub mod config;
pub mod error;
pub mod hostprobe;
pub mod job;
pub mod launcher;
pub mod multiplexer;
pub mod registry;
pub mod rootfs;
pub mod types;

pub use config::{defaults, IoLimit, JobOptions, ResourceLimits};
pub use error::{Error, Result};
pub use job::Job;
pub use multiplexer::{OutputFrame, StreamOrigin};
pub use registry::JobRegistry;
pub use types::{JobId, JobSnapshot, JobState, SubscriberId, Tenant};

#[cfg(test)]
mod joblib_tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn job(command: &str, args: &[&str], options: &JobOptions) -> Arc<Job> {
        let args = args.iter().map(|s| s.to_string()).collect();
        Arc::new(Job::new(command, args, options).unwrap())
    }

    fn channels() -> (
        mpsc::Sender<OutputFrame>,
        mpsc::Sender<OutputFrame>,
        mpsc::Receiver<OutputFrame>,
        mpsc::Receiver<OutputFrame>,
    ) {
        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        (stdout_tx, stderr_tx, stdout_rx, stderr_rx)
    }

    async fn collect(mut rx: mpsc::Receiver<OutputFrame>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(frame) = rx.recv().await {
            out.extend_from_slice(&frame.data);
        }
        out
    }

    /// Scenario: echo with a subscriber attached before start sees the
    /// whole stream, and the job records a clean exit.
    #[tokio::test]
    async fn echo_roundtrip() {
        let job = job("sh", &["-c", "echo hello"], &JobOptions::default());
        let (stdout_tx, stderr_tx, stdout_rx, stderr_rx) = channels();
        job.subscribe(stdout_tx, stderr_tx).unwrap();

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        job.start(cancel_rx).await.unwrap();
        job.finish().await;

        assert_eq!(collect(stdout_rx).await, b"hello\n");
        assert_eq!(collect(stderr_rx).await, b"");
        assert_eq!(job.exit_code().unwrap(), 0);
        assert_eq!(job.exit_error().unwrap(), "");
        assert_eq!(job.state(), JobState::Finished);
    }

    /// Scenario: three subscribers at different attach points each see a
    /// suffix of the stream, in order, from their attach point onward.
    #[tokio::test]
    async fn late_subscribers_see_a_suffix() {
        let job = job(
            "sh",
            &["-c", "echo one; sleep 1; echo two; sleep 1; echo three"],
            &JobOptions::default(),
        );
        let (a_out_tx, a_err_tx, a_out, _a_err) = channels();
        job.subscribe(a_out_tx, a_err_tx).unwrap();

        let runner = {
            let job = job.clone();
            tokio::spawn(async move {
                let (_cancel_tx, cancel_rx) = oneshot::channel();
                job.start(cancel_rx).await
            })
        };

        // B attaches once the first line is through, C after the second.
        let mut a_out = a_out;
        let mut a_bytes = Vec::new();
        while !a_bytes.ends_with(b"one\n") {
            let frame = a_out.recv().await.unwrap();
            a_bytes.extend_from_slice(&frame.data);
        }
        let (b_out_tx, b_err_tx, b_out, _b_err) = channels();
        job.subscribe(b_out_tx, b_err_tx).unwrap();

        while !a_bytes.ends_with(b"two\n") {
            let frame = a_out.recv().await.unwrap();
            a_bytes.extend_from_slice(&frame.data);
        }
        let (c_out_tx, c_err_tx, c_out, _c_err) = channels();
        job.subscribe(c_out_tx, c_err_tx).unwrap();

        runner.await.unwrap().unwrap();
        job.finish().await;

        a_bytes.extend(collect(a_out).await);
        let b_bytes = collect(b_out).await;
        let c_bytes = collect(c_out).await;

        assert_eq!(a_bytes, b"one\ntwo\nthree\n");
        assert!(a_bytes.ends_with(&b_bytes), "B must see a suffix");
        assert!(b_bytes.ends_with(&c_bytes), "C must see a suffix of B");
        assert!(b_bytes.ends_with(b"three\n"));
    }

    /// Scenario: terminating `yes` reports death by signal and closes all
    /// subscriber channels.
    #[tokio::test]
    async fn terminate_closes_subscribers() {
        let reg = Arc::new(JobRegistry::new(JobOptions::default()));
        let id = reg.launch("alice", "yes", vec![]);

        // Attach while the job is still Init or barely Running; either way
        // the subscriber sees the stream from its attach point onward.
        let (stdout_tx, stderr_tx, stdout_rx, stderr_rx) = channels();
        reg.attach("alice", id, stdout_tx, stderr_tx).unwrap();

        // Keep draining so subscriber backpressure never stalls the kill.
        let drain = tokio::spawn(collect(stdout_rx));
        while reg.status("alice", id).unwrap().state != JobState::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        reg.terminate("alice", id).unwrap();

        loop {
            let snap = reg.status("alice", id).unwrap();
            if snap.state == JobState::Finished {
                assert_eq!(snap.exit_code, -1);
                assert!(snap.exit_error.contains("SIGKILL"));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Channels are closed by the multiplexer, exactly once.
        let seen = drain.await.unwrap();
        assert!(seen.starts_with(b"y\n"));
        assert_eq!(collect(stderr_rx).await, b"");
    }

    /// Scenario: PID isolation gives the child PID 1 in its namespace.
    /// Requires CAP_SYS_ADMIN; run as root with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires root for namespace creation"]
    async fn pid_namespace_isolation() {
        let options = JobOptions {
            isolate_pid: true,
            ..Default::default()
        };
        let job = job("sh", &["-c", "echo $$"], &options);
        let (stdout_tx, stderr_tx, stdout_rx, _stderr_rx) = channels();
        job.subscribe(stdout_tx, stderr_tx).unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        job.start(cancel_rx).await.unwrap();
        job.finish().await;
        assert_eq!(collect(stdout_rx).await, b"1\n");
        assert_eq!(job.exit_code().unwrap(), 0);
    }

    /// Scenario: a private network namespace in which the job may
    /// configure the loopback interface.
    /// Requires CAP_SYS_ADMIN; run as root with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires root for namespace creation"]
    async fn network_namespace_allows_loopback_setup() {
        let options = JobOptions {
            isolate_net: true,
            ..Default::default()
        };
        let args = ["addr", "add", "127.0.0.1/8", "dev", "lo"];
        let job = job("ip", &args, &options);
        let (stdout_tx, stderr_tx, _stdout_rx, stderr_rx) = channels();
        job.subscribe(stdout_tx, stderr_tx).unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        job.start(cancel_rx).await.unwrap();
        job.finish().await;
        assert_eq!(collect(stderr_rx).await, b"");
        assert_eq!(job.exit_code().unwrap(), 0);
    }

    /// Scenario: the full default stack, chroot and cgroup included, and
    /// both directories are gone after finish.
    /// Requires root, a cgroup2 delegation, and a writable /home.
    #[tokio::test]
    #[ignore = "requires root, cgroup delegation, and /home"]
    async fn full_isolation_roundtrip_releases_resources() {
        let (major, minor) = {
            let mount = hostprobe::filesystem_mount(std::path::Path::new("/home")).unwrap();
            hostprobe::device_numbers(&mount).unwrap()
        };
        let options = JobOptions {
            limits: ResourceLimits {
                cpu_quota_ms: defaults::CPU_QUOTA_MS,
                cpu_period_ms: defaults::CPU_PERIOD_MS,
                memory_kib: defaults::MEMORY_KIB,
                io: Some(IoLimit {
                    major,
                    minor,
                    rbps: defaults::IO_RBPS,
                    wbps: defaults::IO_WBPS,
                }),
            },
            root_base: Some("/home".into()),
            isolate_pid: true,
            isolate_net: true,
        };
        let job = job("sh", &["-c", "ls /"], &options);
        let root = std::path::PathBuf::from("/home").join(job.id().to_string());
        let (stdout_tx, stderr_tx, stdout_rx, _stderr_rx) = channels();
        job.subscribe(stdout_tx, stderr_tx).unwrap();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        job.start(cancel_rx).await.unwrap();
        assert_eq!(job.exit_code().unwrap(), 0);
        job.finish().await;

        let listing = String::from_utf8(collect(stdout_rx).await).unwrap();
        for dir in ["bin", "lib", "proc", "sys", "usr"] {
            assert!(listing.contains(dir), "missing {dir} in: {listing}");
        }
        assert!(!root.exists(), "chroot root must be removed");
    }
}
