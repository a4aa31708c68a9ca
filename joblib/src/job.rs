//! The per-job state machine. A `Job` owns its cgroup, its chroot, the
//! child handle, and the output multiplexer, and drives the lifecycle
//! `Init -> Running -> Terminated -> Finished` with every acquired host
//! resource released on every exit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use nix::sys::signal::Signal;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cgroup::CgroupController;
use crate::config::JobOptions;
use crate::error::{Error, Result};
use crate::launcher::{self, ChildHandle, SpawnSpec};
use crate::multiplexer::{
    ControlEvent, OutputFrame, OutputMultiplexer, CONTROL_INBOX_CAPACITY,
};
use crate::rootfs::RootfsBuilder;
use crate::types::{Args, JobId, JobSnapshot, JobState, Program, SubscriberId};

/// The fields guarded by the per-job state lock. Exit code and exit error
/// are published under the same lock as the `Running -> Terminated`
/// transition, so observers always see a consistent view.
struct StateCell {
    state: JobState,
    start_ts: SystemTime,
    end_ts: Option<SystemTime>,
    exit_code: i32,
    exit_error: String,
}

pub struct Job {
    id: JobId,
    command: Program,
    args: Args,
    isolate_pid: bool,
    isolate_net: bool,
    state: Mutex<StateCell>,
    /// Mirrors the lifecycle state so `finish` can await the reaper.
    state_watch: watch::Sender<JobState>,
    cgroup: Mutex<Option<CgroupController>>,
    rootfs: Mutex<Option<RootfsBuilder>>,
    control_tx: Mutex<Option<mpsc::Sender<ControlEvent>>>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlEvent>>>,
    mux_task: Mutex<Option<JoinHandle<()>>>,
    handle: Mutex<Option<ChildHandle>>,
    subscriber_seq: AtomicU64,
    /// Serializes concurrent `finish` callers; the loser returns quietly.
    finish_lock: tokio::sync::Mutex<()>,
}

impl Job {
    /// Acquires the job's host resources: its cgroup (when any limit is
    /// set) and its chroot (when a root base is configured). Any failure
    /// tears down what was already built and propagates.
    pub fn new(command: impl Into<Program>, args: Args, options: &JobOptions) -> Result<Job> {
        let id = Uuid::new_v4();
        let command = command.into();

        let mut cgroup = None;
        if !options.limits.is_unlimited() {
            let mut ctl = CgroupController::new(&id.to_string())?;
            ctl.configure(&options.limits);
            // A failed apply rolls its own directory back.
            ctl.apply()?;
            cgroup = Some(ctl);
        }

        let mut rootfs = None;
        if let Some(base) = &options.root_base {
            let mut builder = RootfsBuilder::new(base.join(id.to_string()));
            if let Err(e) = builder.mount() {
                builder.destroy();
                if let Some(ctl) = cgroup.as_mut() {
                    ctl.destroy();
                }
                return Err(e);
            }
            rootfs = Some(builder);
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_INBOX_CAPACITY);
        let (state_watch, _) = watch::channel(JobState::Init);
        Ok(Job {
            id,
            command,
            args,
            isolate_pid: options.isolate_pid,
            isolate_net: options.isolate_net,
            state: Mutex::new(StateCell {
                state: JobState::Init,
                start_ts: SystemTime::now(),
                end_ts: None,
                exit_code: 0,
                exit_error: String::new(),
            }),
            state_watch,
            cgroup: Mutex::new(cgroup),
            rootfs: Mutex::new(rootfs),
            control_tx: Mutex::new(Some(control_tx)),
            control_rx: Mutex::new(Some(control_rx)),
            mux_task: Mutex::new(None),
            handle: Mutex::new(None),
            subscriber_seq: AtomicU64::new(0),
            finish_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// A record for a launch whose construction failed: a synthetic id in
    /// state `Finished`, so the failure stays observable through `status`
    /// and `list` for the life of the registry.
    pub fn failed(command: impl Into<Program>, args: Args, err: &Error) -> Job {
        let now = SystemTime::now();
        let (state_watch, _) = watch::channel(JobState::Finished);
        Job {
            id: Uuid::new_v4(),
            command: command.into(),
            args,
            isolate_pid: false,
            isolate_net: false,
            state: Mutex::new(StateCell {
                state: JobState::Finished,
                start_ts: now,
                end_ts: Some(now),
                exit_code: 1,
                exit_error: err.to_string(),
            }),
            state_watch,
            cgroup: Mutex::new(None),
            rootfs: Mutex::new(None),
            control_tx: Mutex::new(None),
            control_rx: Mutex::new(None),
            mux_task: Mutex::new(None),
            handle: Mutex::new(None),
            subscriber_seq: AtomicU64::new(0),
            finish_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state.lock().unwrap().state
    }

    /// Readable only once the child has been reaped.
    pub fn exit_code(&self) -> Result<i32> {
        let st = self.state.lock().unwrap();
        if !st.state.has_exit_info() {
            return Err(Error::invalid_state(st.state));
        }
        Ok(st.exit_code)
    }

    /// Readable only once the child has been reaped; empty for a clean
    /// zero exit.
    pub fn exit_error(&self) -> Result<String> {
        let st = self.state.lock().unwrap();
        if !st.state.has_exit_info() {
            return Err(Error::invalid_state(st.state));
        }
        Ok(st.exit_error.clone())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let st = self.state.lock().unwrap();
        JobSnapshot {
            id: self.id,
            command: self.command.clone(),
            args: self.args.clone(),
            state: st.state,
            start_ts: st.start_ts,
            end_ts: st.end_ts,
            exit_code: st.exit_code,
            exit_error: st.exit_error.clone(),
        }
    }

    /// Spawns the child with the accumulated isolation attributes and
    /// blocks until it has been reaped. Cancelling `cancel` sends SIGKILL
    /// to the child's process group; the call still waits for the reap.
    pub async fn start(&self, cancel: oneshot::Receiver<()>) -> Result<()> {
        {
            let st = self.state.lock().unwrap();
            if st.state != JobState::Init {
                return Err(Error::invalid_state(st.state));
            }
        }
        let control_rx = self
            .control_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::invalid_state(self.state()))?;

        let cgroup_fd = {
            let mut guard = self.cgroup.lock().unwrap();
            match guard.as_mut() {
                Some(ctl) => Some(ctl.directory_fd()?),
                None => None,
            }
        };
        let chroot = {
            self.rootfs
                .lock()
                .unwrap()
                .as_ref()
                .map(|r| r.root_path().to_path_buf())
        };

        let spawned = launcher::spawn(&SpawnSpec {
            program: &self.command,
            args: &self.args,
            new_pid_ns: self.isolate_pid,
            new_net_ns: self.isolate_net,
            chroot: chroot.as_deref(),
            cgroup_fd,
        })?;
        let handle = spawned.handle.clone();

        if let Err(e) = self.transition(&[JobState::Init], JobState::Running) {
            // A concurrent finish won the race; don't leak the child.
            let _ = handle.signal_group(Signal::SIGKILL);
            let _ = spawned.handle.wait().await;
            return Err(e);
        }
        *self.handle.lock().unwrap() = Some(handle.clone());

        match OutputMultiplexer::new(self.id, spawned.stdout, spawned.stderr, control_rx) {
            Ok(mux) => {
                *self.mux_task.lock().unwrap() = Some(tokio::spawn(mux.run()));
            }
            Err(e) => {
                let _ = handle.signal_group(Signal::SIGKILL);
                let outcome = spawned.handle.wait().await;
                self.publish_exit(outcome.map(|o| (o.code, o.error)).unwrap_or((
                    -1,
                    "output pipes unusable".to_string(),
                )));
                return Err(Error::host("register pipes", format!("job {}", self.id), e));
            }
        }
        info!(job = %self.id, command = %self.command, pgid = handle.pgid(), "job is running");

        let wait = spawned.handle.wait();
        tokio::pin!(wait);
        let outcome = tokio::select! {
            res = &mut wait => res,
            fired = cancel => {
                if fired.is_ok() {
                    let _ = handle.signal_group(Signal::SIGKILL);
                }
                wait.await
            }
        };
        match outcome {
            Ok(o) => self.publish_exit((o.code, o.error)),
            Err(e) => self.publish_exit((-1, format!("wait failed: {e}"))),
        }
        info!(job = %self.id, "job has terminated");
        Ok(())
    }

    /// Polite termination: SIGTERM to the child's process group. Valid
    /// only while running.
    pub fn send_term(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Uncatchable termination: SIGKILL to the child's process group.
    /// Valid only while running. Does not block on the reap; the
    /// `Running -> Terminated` transition still flows through `start`.
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let st = self.state.lock().unwrap();
        if st.state != JobState::Running {
            return Err(Error::invalid_state(st.state));
        }
        let handle = self.handle.lock().unwrap();
        let handle = handle.as_ref().expect("running job has a child handle");
        handle.signal_group(signal)
    }

    /// Registers a subscriber with the multiplexer. Allowed before the
    /// child starts (the subscriber then sees the stream from its first
    /// byte) and while it runs; delivery begins with the first chunk
    /// produced after the attach event is processed.
    pub fn subscribe(
        &self,
        stdout: mpsc::Sender<OutputFrame>,
        stderr: mpsc::Sender<OutputFrame>,
    ) -> Result<SubscriberId> {
        let st = self.state.lock().unwrap();
        if !matches!(st.state, JobState::Init | JobState::Running) {
            return Err(Error::invalid_state(st.state));
        }
        let guard = self.control_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or_else(|| Error::invalid_state(st.state))?;
        let id = self.subscriber_seq.fetch_add(1, Ordering::Relaxed) + 1;
        match tx.try_send(ControlEvent::Attach { id, stdout, stderr }) {
            Ok(()) => Ok(id),
            Err(TrySendError::Full(_)) => Err(Error::CapacityExhausted),
            Err(TrySendError::Closed(_)) => Err(Error::invalid_state(st.state)),
        }
    }

    /// Withdraws a subscriber. A detach that cannot be enqueued is logged
    /// and dropped; the multiplexer closes the channels at termination
    /// anyway.
    pub fn detach(&self, subscriber: SubscriberId) -> Result<()> {
        let st = self.state.lock().unwrap();
        if !matches!(st.state, JobState::Init | JobState::Running) {
            return Err(Error::invalid_state(st.state));
        }
        let guard = self.control_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or_else(|| Error::invalid_state(st.state))?;
        match tx.try_send(ControlEvent::Detach { id: subscriber }) {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(job = %self.id, subscriber, "control inbox full, detach dropped");
                Ok(())
            }
        }
    }

    /// Releases everything the job acquired, in order: kill and reap a
    /// still-running child, retire the multiplexer (which closes all
    /// subscriber channels), unmount and remove the chroot, remove the
    /// cgroup. Each step runs regardless of earlier failures; a repeat
    /// call returns quietly.
    pub async fn finish(&self) {
        let _guard = self.finish_lock.lock().await;
        if self.state() == JobState::Finished {
            return;
        }

        if self.state() == JobState::Running {
            if let Err(e) = self.kill() {
                // The reaper may have beaten us to it.
                warn!(job = %self.id, error = %e, "kill during finish");
            }
            let mut watched = self.state_watch.subscribe();
            loop {
                if *watched.borrow() >= JobState::Terminated {
                    break;
                }
                if watched.changed().await.is_err() {
                    break;
                }
            }
        }

        // Closing the inbox lets the multiplexer drain and exit; awaiting
        // it guarantees every subscriber channel is closed exactly once.
        self.control_tx.lock().unwrap().take();
        self.control_rx.lock().unwrap().take();
        let mux_task = self.mux_task.lock().unwrap().take();
        if let Some(task) = mux_task {
            if let Err(e) = task.await {
                error!(job = %self.id, error = %e, "multiplexer task failed");
            }
        }

        let rootfs = self.rootfs.lock().unwrap().take();
        if let Some(mut rootfs) = rootfs {
            rootfs.destroy();
        }
        let cgroup = self.cgroup.lock().unwrap().take();
        if let Some(mut cgroup) = cgroup {
            cgroup.destroy();
        }

        {
            let mut st = self.state.lock().unwrap();
            if st.end_ts.is_none() {
                st.end_ts = Some(SystemTime::now());
            }
            st.state = JobState::Finished;
            let _ = self.state_watch.send(JobState::Finished);
        }
        info!(job = %self.id, "job finished");
    }

    /// Records the error of a spawn that failed after construction, while
    /// the job is still `Init`; `finish` then takes the fast-fail edge to
    /// `Finished`.
    pub fn record_startup_failure(&self, err: &Error) {
        let mut st = self.state.lock().unwrap();
        if st.state == JobState::Init {
            st.exit_code = 1;
            st.exit_error = err.to_string();
            st.end_ts = Some(SystemTime::now());
        }
    }

    fn transition(&self, from: &[JobState], to: JobState) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if !from.contains(&st.state) {
            return Err(Error::invalid_state(st.state));
        }
        st.state = to;
        let _ = self.state_watch.send(to);
        Ok(())
    }

    fn publish_exit(&self, (code, error): (i32, String)) {
        let mut st = self.state.lock().unwrap();
        if st.state != JobState::Running {
            return;
        }
        st.exit_code = code;
        st.exit_error = error;
        st.end_ts = Some(SystemTime::now());
        st.state = JobState::Terminated;
        let _ = self.state_watch.send(JobState::Terminated);
    }
}
