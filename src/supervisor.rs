// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Launches and supervises one external solver process: output draining
//! into capturable buffers, polling wait that stays responsive to the
//! caller's cancel token, wall-clock timeout, and whole-process-group
//! termination on abort.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus,
                   Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backend::SolverCommand;
use crate::error::SolverError;

/// Level-triggered cancellation signal, shared between the caller and any
/// number of supervised waits. Setting it is always safe and idempotent.
pub type CancelToken = Arc<AtomicBool>;

pub fn new_cancel_token() -> CancelToken {
    Arc::new(AtomicBool::new(false))
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(500);

/// What one finished process run looked like.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// A launched external process. Created by `launch`, consumed by `wait`.
pub struct Supervised {
    child: Child,
    label: &'static str,
    started: Instant,
    stdout_worker: Option<JoinHandle<String>>,
    stderr_worker: Option<JoinHandle<String>>,
}

impl Supervised {
    pub fn launch(cmd: &SolverCommand) -> Result<Self, SolverError> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so abort can terminate the whole tree.
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|e| {
            SolverError::ProcessLaunch {
                program: cmd.program.display().to_string(),
                source: e,
            }
        })?;
        info!("{} started (pid {})", cmd.label, child.id());

        let stdout_worker =
            Self::make_stdout_worker(cmd.label, child.stdout.take().unwrap());
        let stderr_worker =
            Self::make_stderr_worker(cmd.label, child.stderr.take().unwrap());
        Ok(Supervised {
            child,
            label: cmd.label,
            started: Instant::now(),
            stdout_worker: Some(stdout_worker),
            stderr_worker: Some(stderr_worker),
        })
    }

    fn make_stdout_worker(label: &'static str, stdout: ChildStdout)
                          -> JoinHandle<String> {
        thread::spawn(move || {
            let mut captured = String::new();
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,  // Reached EOF.
                    Ok(_) => {
                        debug!("{}: {}", label, line.trim_end());
                        captured.push_str(&line);
                    }
                }
            }
            captured
        })
    }

    fn make_stderr_worker(label: &'static str, stderr: ChildStderr)
                          -> JoinHandle<String> {
        thread::spawn(move || {
            let mut captured = String::new();
            let mut reader = BufReader::new(stderr);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,  // Reached EOF.
                    Ok(_) => {
                        warn!("{}: {}", label, line.trim_end());
                        captured.push_str(&line);
                    }
                }
            }
            captured
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the process exits, the cancel token fires, or the
    /// timeout elapses. Polls so that cancellation is honored promptly at
    /// any point after launch.
    pub fn wait(mut self, cancel: Option<&CancelToken>,
                timeout: Option<Duration>)
                -> Result<ProcessOutcome, SolverError> {
        loop {
            let maybe_status = self.child.try_wait().map_err(|e| {
                SolverError::ProcessFailure(format!(
                    "waiting for {}: {}", self.label, e))
            })?;
            if let Some(status) = maybe_status {
                let (stdout, stderr) = self.join_drains();
                let elapsed = self.started.elapsed();
                debug!("{} exited with {} after {:.1}s", self.label, status,
                       elapsed.as_secs_f64());
                return Ok(ProcessOutcome { status, stdout, stderr, elapsed });
            }
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                info!("aborting {} (pid {})", self.label, self.child.id());
                self.terminate();
                self.join_drains();
                return Err(SolverError::Aborted);
            }
            if let Some(limit) = timeout {
                if self.started.elapsed() >= limit {
                    warn!("{} exceeded {:.1}s; terminating", self.label,
                          limit.as_secs_f64());
                    self.terminate();
                    self.join_drains();
                    return Err(SolverError::Timeout(limit));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn join_drains(&mut self) -> (String, String) {
        let stdout = self
            .stdout_worker
            .take()
            .and_then(|w| w.join().ok())
            .unwrap_or_default();
        let stderr = self
            .stderr_worker
            .take()
            .and_then(|w| w.join().ok())
            .unwrap_or_default();
        (stdout, stderr)
    }

    /// Terminates the process tree and reaps the child. No-op if the child
    /// already exited.
    fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let pid = self.child.id();
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            kill_group(pid, Signal::SIGTERM);
            let deadline = Instant::now() + TERM_GRACE;
            while Instant::now() < deadline {
                if matches!(self.child.try_wait(), Ok(Some(_))) {
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            kill_group(pid, Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.kill() {
                warn!("kill({}) failed: {}", pid, e);
            }
        }
        if let Err(e) = self.child.wait() {
            warn!("reaping {} (pid {}) failed: {}", self.label, pid, e);
        }
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        self.terminate();
        self.join_drains();
    }
}

#[cfg(unix)]
fn kill_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    // The child was launched as its own process group leader.
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => (),
        Err(e) => warn!("killpg({}, {:?}) failed: {}", pid, signal, e),
    }
}

/// Maps a nonzero exit to the failure the caller sees, carrying the tail of
/// the captured stderr.
pub fn require_success(outcome: &ProcessOutcome, label: &str)
                       -> Result<(), SolverError> {
    if outcome.status.success() {
        return Ok(());
    }
    let lines: Vec<&str> = outcome.stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(3)..].join("; ");
    Err(SolverError::ProcessFailure(format!(
        "{} exited with {}{}", label, outcome.status,
        if tail.is_empty() { String::new() } else { format!(": {}", tail) })))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(label: &'static str, script: &str) -> SolverCommand {
        SolverCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            label,
        }
    }

    #[test]
    fn test_captures_output_streams() {
        let proc = Supervised::launch(
            &shell("echo", "echo out-line; echo err-line >&2")).unwrap();
        let outcome = proc.wait(None, None).unwrap();
        assert!(outcome.status.success());
        assert_eq!(outcome.stdout.trim(), "out-line");
        assert_eq!(outcome.stderr.trim(), "err-line");
        assert!(require_success(&outcome, "echo").is_ok());
    }

    #[test]
    fn test_nonzero_exit_is_process_failure() {
        let proc = Supervised::launch(
            &shell("fail", "echo oops >&2; exit 3")).unwrap();
        let outcome = proc.wait(None, None).unwrap();
        assert!(!outcome.status.success());
        match require_success(&outcome, "fail") {
            Err(SolverError::ProcessFailure(msg)) => {
                assert!(msg.contains("oops"));
            }
            other => panic!("expected ProcessFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_launch_failure() {
        let cmd = SolverCommand {
            program: PathBuf::from("/no/such/binary"),
            args: vec![],
            label: "missing",
        };
        match Supervised::launch(&cmd) {
            Err(SolverError::ProcessLaunch { program, .. }) => {
                assert!(program.contains("/no/such/binary"));
            }
            other => panic!("expected ProcessLaunch, got {:?}",
                            other.map(|_| ())),
        }
    }

    #[test]
    fn test_timeout() {
        let started = Instant::now();
        let proc = Supervised::launch(&shell("sleeper", "sleep 10")).unwrap();
        match proc.wait(None, Some(Duration::from_millis(200))) {
            Err(SolverError::Timeout(limit)) => {
                assert_eq!(limit, Duration::from_millis(200));
            }
            other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
        }
        // Termination must not wait out the child's sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_abort_immediately_after_launch() {
        let cancel = new_cancel_token();
        let proc = Supervised::launch(&shell("sleeper", "sleep 10")).unwrap();
        cancel.store(true, Ordering::Relaxed);
        let started = Instant::now();
        match proc.wait(Some(&cancel), None) {
            Err(SolverError::Aborted) => (),
            other => panic!("expected Aborted, got {:?}", other.map(|_| ())),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_abort_kills_process_tree() {
        // The child spawns its own child; both must die with the group.
        let proc = Supervised::launch(
            &shell("tree", "sleep 10 & wait")).unwrap();
        let pid = proc.pid();
        let cancel = new_cancel_token();
        cancel.store(true, Ordering::Relaxed);
        assert!(matches!(proc.wait(Some(&cancel), None),
                         Err(SolverError::Aborted)));
        // The group leader is gone.
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        assert_eq!(kill(Pid::from_raw(pid as i32), None),
                   Err(nix::errno::Errno::ESRCH));
    }
}  // mod tests.
