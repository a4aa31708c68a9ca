//! Fan-out of one child's stdout/stderr to a dynamic set of subscribers.
//! A single task owns the two pipe ends and the subscriber tables and
//! multiplexes three event sources: stdout bytes, stderr bytes, and the
//! control inbox carrying attach/detach events.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{JobId, SubscriberId};

/// Pipe reads use a fixed buffer of this size; frames carry the actual
/// bytes read, never padding.
pub const CHUNK_SIZE: usize = 128;

/// Capacity of the control inbox. Attaches that cannot be enqueued fail
/// fast with a backpressure error.
pub const CONTROL_INBOX_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

/// One chunk of child output, tagged with the stream it came from.
#[derive(Clone, Debug)]
pub struct OutputFrame {
    pub origin: StreamOrigin,
    pub data: Bytes,
}

/// Attach/detach events published by the job controller.
pub enum ControlEvent {
    Attach {
        id: SubscriberId,
        stdout: mpsc::Sender<OutputFrame>,
        stderr: mpsc::Sender<OutputFrame>,
    },
    Detach {
        id: SubscriberId,
    },
}

pub struct OutputMultiplexer {
    job_id: JobId,
    stdout: pipe::Receiver,
    stderr: pipe::Receiver,
    control: mpsc::Receiver<ControlEvent>,
}

impl OutputMultiplexer {
    /// Takes ownership of the pipe read ends and the control inbox. The
    /// pipes are switched to non-blocking and registered with the reactor.
    pub fn new(
        job_id: JobId,
        stdout: OwnedFd,
        stderr: OwnedFd,
        control: mpsc::Receiver<ControlEvent>,
    ) -> io::Result<Self> {
        Ok(OutputMultiplexer {
            job_id,
            stdout: reader_from(stdout)?,
            stderr: reader_from(stderr)?,
            control,
        })
    }

    /// Runs to completion: exits once both pipes hit end-of-stream and the
    /// control inbox has been closed, then closes every remaining
    /// subscriber channel exactly once by dropping the tables.
    pub async fn run(mut self) {
        let mut stdout_subs: HashMap<SubscriberId, mpsc::Sender<OutputFrame>> = HashMap::new();
        let mut stderr_subs: HashMap<SubscriberId, mpsc::Sender<OutputFrame>> = HashMap::new();
        let mut stdout_buf = [0u8; CHUNK_SIZE];
        let mut stderr_buf = [0u8; CHUNK_SIZE];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut control_open = true;

        // The pipes are tracked independently so the loop keeps serving
        // the stream that has not closed yet.
        while stdout_open || stderr_open || control_open {
            tokio::select! {
                read = self.stdout.read(&mut stdout_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => {
                        let frame = OutputFrame {
                            origin: StreamOrigin::Stdout,
                            data: Bytes::copy_from_slice(&stdout_buf[..n]),
                        };
                        broadcast(&mut stdout_subs, frame).await;
                    }
                },
                read = self.stderr.read(&mut stderr_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => {
                        let frame = OutputFrame {
                            origin: StreamOrigin::Stderr,
                            data: Bytes::copy_from_slice(&stderr_buf[..n]),
                        };
                        broadcast(&mut stderr_subs, frame).await;
                    }
                },
                event = self.control.recv(), if control_open => match event {
                    None => control_open = false,
                    Some(ControlEvent::Attach { id, stdout, stderr }) => {
                        stdout_subs.insert(id, stdout);
                        stderr_subs.insert(id, stderr);
                        debug!(job = %self.job_id, subscriber = id, "subscriber attached");
                    }
                    // A detach of an unknown id is a no-op.
                    Some(ControlEvent::Detach { id }) => {
                        let known = stdout_subs.remove(&id).is_some();
                        stderr_subs.remove(&id);
                        if known {
                            debug!(job = %self.job_id, subscriber = id, "subscriber detached");
                        }
                    }
                },
            }
        }
    }
}

/// Delivers one frame to every subscriber of its stream. Sends block when
/// a subscriber is slow; the whole multiplexer stalls, and the child with
/// it through pipe backpressure. That trade-off is the contract: frames
/// are never dropped for a live subscriber.
async fn broadcast(
    subs: &mut HashMap<SubscriberId, mpsc::Sender<OutputFrame>>,
    frame: OutputFrame,
) {
    let mut gone = Vec::new();
    for (id, tx) in subs.iter() {
        if tx.send(frame.clone()).await.is_err() {
            gone.push(*id);
        }
    }
    for id in gone {
        subs.remove(&id);
    }
}

fn reader_from(fd: OwnedFd) -> io::Result<pipe::Receiver> {
    set_nonblocking(&fd)?;
    pipe::Receiver::from_owned_fd(fd)
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::fs::File;
    use std::io::Write;
    use uuid::Uuid;

    struct Harness {
        stdout_w: File,
        stderr_w: File,
        control: mpsc::Sender<ControlEvent>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (stderr_r, stderr_w) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (control, control_rx) = mpsc::channel(CONTROL_INBOX_CAPACITY);
        let mux =
            OutputMultiplexer::new(Uuid::new_v4(), stdout_r, stderr_r, control_rx).unwrap();
        let task = tokio::spawn(mux.run());
        Harness {
            stdout_w: File::from(stdout_w),
            stderr_w: File::from(stderr_w),
            control,
            task,
        }
    }

    fn subscriber() -> (
        ControlEvent,
        mpsc::Receiver<OutputFrame>,
        mpsc::Receiver<OutputFrame>,
    ) {
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        (
            ControlEvent::Attach {
                id,
                stdout: stdout_tx,
                stderr: stderr_tx,
            },
            stdout_rx,
            stderr_rx,
        )
    }

    /// Attach events are not ordered with respect to pipe data, so tests
    /// give the multiplexer a moment to drain the control inbox before
    /// writing.
    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn frames_reach_attached_subscribers_in_order() {
        let mut h = start();
        let (attach, mut stdout_rx, mut stderr_rx) = subscriber();
        h.control.send(attach).await.unwrap();
        settle().await;

        h.stdout_w.write_all(b"hello").unwrap();
        let frame = stdout_rx.recv().await.unwrap();
        assert_eq!(frame.origin, StreamOrigin::Stdout);
        assert_eq!(&frame.data[..], b"hello");

        h.stderr_w.write_all(b"oops").unwrap();
        let frame = stderr_rx.recv().await.unwrap();
        assert_eq!(frame.origin, StreamOrigin::Stderr);
        assert_eq!(&frame.data[..], b"oops");

        // A chunk larger than the read buffer arrives as multiple frames
        // whose concatenation preserves byte order.
        let big: Vec<u8> = (0..=255u8).cycle().take(3 * CHUNK_SIZE + 7).collect();
        h.stdout_w.write_all(&big).unwrap();
        let mut got = Vec::new();
        while got.len() < big.len() {
            let frame = stdout_rx.recv().await.unwrap();
            assert!(frame.data.len() <= CHUNK_SIZE);
            got.extend_from_slice(&frame.data);
        }
        assert_eq!(got, big);

        drop(h.stdout_w);
        drop(h.stderr_w);
        drop(h.control);
        h.task.await.unwrap();
        // Channels were closed exactly once by the exiting multiplexer.
        assert!(stdout_rx.recv().await.is_none());
        assert!(stderr_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let mut h = start();
        let (attach_a, mut a_out, _a_err) = subscriber();
        let (attach_b, mut b_out, _b_err) = subscriber();
        h.control.send(attach_a).await.unwrap();
        h.control.send(attach_b).await.unwrap();
        settle().await;
        h.stdout_w.write_all(b"broadcast").unwrap();
        assert_eq!(&a_out.recv().await.unwrap().data[..], b"broadcast");
        assert_eq!(&b_out.recv().await.unwrap().data[..], b"broadcast");
    }

    #[tokio::test]
    async fn detach_closes_both_channels_and_is_idempotent() {
        let h = start();
        let (attach, mut stdout_rx, mut stderr_rx) = subscriber();
        let id = match &attach {
            ControlEvent::Attach { id, .. } => *id,
            _ => unreachable!(),
        };
        h.control.send(attach).await.unwrap();
        h.control.send(ControlEvent::Detach { id }).await.unwrap();
        assert!(stdout_rx.recv().await.is_none());
        assert!(stderr_rx.recv().await.is_none());
        // Second detach of the same id is a no-op.
        h.control.send(ControlEvent::Detach { id }).await.unwrap();
        drop(h.stdout_w);
        drop(h.stderr_w);
        drop(h.control);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_frames() {
        let mut h = start();
        let (attach_a, mut a_out, _a_err) = subscriber();
        h.control.send(attach_a).await.unwrap();
        settle().await;
        h.stdout_w.write_all(b"early").unwrap();
        assert_eq!(&a_out.recv().await.unwrap().data[..], b"early");

        // B attaches after "early" was already broadcast: future-only, no
        // replay.
        let (attach_b, mut b_out, _b_err) = subscriber();
        h.control.send(attach_b).await.unwrap();
        settle().await;
        h.stdout_w.write_all(b"late").unwrap();
        assert_eq!(&a_out.recv().await.unwrap().data[..], b"late");
        assert_eq!(&b_out.recv().await.unwrap().data[..], b"late");
    }
}
