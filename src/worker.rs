//! Worker subprocess lifecycle.
//!
//! A worker owns one subprocess pinned to a loopback port. Its stdout and
//! stderr are piped into the proxy's log stream, its death is observable
//! through a done signal that fires exactly once, and [`Worker::cancel`]
//! forcibly terminates it even when it is wedged in a non-yielding compute
//! loop. The subprocess runs in its own process group so any descendants it
//! spawns can be signalled collectively.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One subprocess instance of the wrapped backend, bound to one loopback port.
pub struct Worker {
    /// Loopback port the subprocess serves on.
    pub port: u16,
    /// OS pid, set iff the subprocess started successfully.
    pub pid: Option<u32>,
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

impl Worker {
    /// Spawns a subprocess expected to serve on `port`.
    ///
    /// On spawn failure the error is logged and the returned worker is
    /// already done, with no pid. Callers retry from port allocation.
    pub fn spawn(port: u16, command: &str, args: &[String]) -> Arc<Worker> {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(port, command, error = %e, "spawn error");
                let _ = done_tx.send(true);
                return Arc::new(Worker {
                    port,
                    pid: None,
                    cancel,
                    done_rx,
                });
            }
        };

        let pid = child.id();
        info!(port, pid, "worker started");

        tokio::spawn(watch_worker(child, port, pid, cancel.clone(), done_tx));

        Arc::new(Worker {
            port,
            pid,
            cancel,
            done_rx,
        })
    }

    /// Signals forced termination: SIGKILL to the direct child plus SIGTERM
    /// to its process group. Safe to call any number of times; a no-op once
    /// the worker is done.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has fired. A cancelled worker is not a valid
    /// dispatch target.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the done signal has fired.
    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolves once the subprocess has been reaped and log ingestion has
    /// ended. Late callers resolve immediately.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Pid as stamped into the `X-Worker` header; 0 when the subprocess
    /// never started.
    pub fn pid_or_zero(&self) -> u32 {
        self.pid.unwrap_or(0)
    }
}

/// Monitors the subprocess until it dies: relays its output into the log
/// stream, performs forced termination when cancellation fires, reaps the
/// process and finally fires the done signal.
async fn watch_worker(
    mut child: Child,
    port: u16,
    pid: Option<u32>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let reader = tokio::spawn(read_output(stdout, stderr, port, pid));

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    match exited {
        Some(Ok(status)) => info!(port, pid, %status, "worker exited"),
        Some(Err(e)) => error!(port, pid, error = %e, "waiting for worker"),
        None => {
            if let Err(e) = child.start_kill() {
                error!(port, pid, error = %e, "killing process");
            }
            // The worker runs in its own process group; a negative pid
            // addresses the whole group so descendants die with it. Not
            // available off Unix, where grandchildren may leak.
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGTERM);
                }
            }
            match child.wait().await {
                Ok(status) => info!(port, pid, %status, "worker killed"),
                Err(e) => error!(port, pid, error = %e, "reaping killed worker"),
            }
        }
    }

    // The stdio pipes hit EOF once the process is gone; let log ingestion
    // drain before declaring the worker fully dead.
    let _ = reader.await;
    debug!(port, pid, "worker done");
    let _ = done_tx.send(true);
}

/// Relays the worker's merged stdout and stderr, line by line, into the
/// proxy's log stream. Read errors end ingestion but never kill the process;
/// termination is driven solely by cancellation or natural exit.
async fn read_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    port: u16,
    pid: Option<u32>,
) {
    let out = async {
        if let Some(stdout) = stdout {
            relay_lines(BufReader::new(stdout), port, pid).await;
        }
    };
    let err = async {
        if let Some(stderr) = stderr {
            relay_lines(BufReader::new(stderr), port, pid).await;
        }
    };
    tokio::join!(out, err);
}

async fn relay_lines<R>(reader: BufReader<R>, port: u16, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(port, pid, "{line}"),
            Ok(None) => return,
            Err(e) => {
                error!(port, pid, error = %e, "read error");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    #[tokio::test]
    async fn spawn_failure_is_immediately_done() {
        let w = Worker::spawn(1234, "definitely-not-a-real-command", &[]);
        assert!(w.pid.is_none());
        assert_eq!(w.pid_or_zero(), 0);
        timeout(Duration::from_secs(1), w.done())
            .await
            .expect("done fires for failed spawn");
        assert!(w.is_done());
        assert!(!w.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_kills_process_and_fires_done() {
        let w = Worker::spawn(1234, "sleep", &["60".to_string()]);
        assert!(w.pid.is_some());
        assert!(!w.is_cancelled());

        // Still running: the done signal must not have fired yet.
        assert!(timeout(Duration::from_millis(200), w.done()).await.is_err());
        assert!(!w.is_done());

        w.cancel();
        timeout(Duration::from_secs(5), w.done())
            .await
            .expect("done fires after cancel");
        assert!(w.is_cancelled());
        assert!(w.is_done());

        // Cancel after death stays a no-op.
        w.cancel();
    }

    #[tokio::test]
    async fn natural_exit_fires_done_without_cancel() {
        let w = Worker::spawn(1234, "true", &[]);
        timeout(Duration::from_secs(5), w.done())
            .await
            .expect("done fires on natural exit");
        assert!(!w.is_cancelled());
    }

    #[tokio::test]
    async fn done_resolves_for_late_subscribers() {
        let w = Worker::spawn(1234, "true", &[]);
        timeout(Duration::from_secs(5), w.done()).await.unwrap();
        // A second wait after the signal has fired resolves immediately.
        timeout(Duration::from_millis(100), w.done())
            .await
            .expect("late done() resolves");
    }
}
