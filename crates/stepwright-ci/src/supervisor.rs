//! Process supervision for agents and toolchain commands.
//!
//! Every child runs in its own process group. The supervisor keeps the
//! pgid of every live child in a handle arena and only ever signals those
//! groups, never processes found by name.
//!
//! A run ends when the child exits, the sentinel line is seen, the hard
//! deadline passes or the child stays silent past the idle limit. In every
//! case except a natural exit the group gets SIGTERM, then SIGKILL after
//! the grace period.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use stepwright_core::SupervisorConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Limits applied to one supervised invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorLimits {
    pub timeout: Duration,
    pub idle: Option<Duration>,
    pub kill_grace: Duration,
    /// Line marker that ends the run successfully.
    pub sentinel: Option<String>,
    pub max_output_bytes: usize,
}

impl SupervisorLimits {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            idle: config.idle_secs.map(Duration::from_secs),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            sentinel: Some(config.sentinel.clone()),
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_sentinel(mut self) -> Self {
        self.sentinel = None;
        self
    }
}

impl Default for SupervisorLimits {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

/// A command to run under supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl CommandSpec {
    /// Build from an argv vector (program first).
    pub fn from_argv(argv: &[String], cwd: &Path) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .context("command is empty; expected program followed by arguments")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            stdin: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Why a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited,
    SentinelSeen,
    TimedOut,
    IdleTimeout,
}

/// Output from a supervised execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedOutput {
    /// `Some(0)` when the sentinel was seen; `None` when killed on a deadline.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub reason: ExitReason,
    pub duration: Duration,
}

impl SupervisedOutput {
    pub fn timed_out(&self) -> bool {
        matches!(self.reason, ExitReason::TimedOut | ExitReason::IdleTimeout)
    }

    pub fn sentinel_seen(&self) -> bool {
        self.reason == ExitReason::SentinelSeen
    }

    pub fn success(&self) -> bool {
        !self.timed_out() && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Line buffer that keeps only the most recent `max_bytes` of output.
#[derive(Debug, Clone, Default)]
pub struct BoundedBuffer {
    buf: String,
    max_bytes: usize,
    dropped: usize,
}

impl BoundedBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: String::new(),
            max_bytes,
            dropped: 0,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.max_bytes {
            let mut cut = self.buf.len() - self.max_bytes;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
            self.dropped += cut;
        }
    }

    /// Bytes discarded from the front so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

/// Supervisor owning the process groups of every live child.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    live_groups: Mutex<HashSet<i32>>,
}

/// Arena registration for one child's process group.
///
/// Dropping it without `release` (a cancelled or failed run) leaves the
/// pgid in the arena for `sweep`.
struct GroupHandle<'a> {
    supervisor: &'a ProcessSupervisor,
    pgid: i32,
}

impl GroupHandle<'_> {
    fn release(self) {
        self.supervisor.untrack(self.pgid);
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of process groups currently tracked.
    pub fn tracked(&self) -> usize {
        self.groups().len()
    }

    /// Force-kill every tracked process group. Returns how many were signalled.
    pub fn sweep(&self) -> usize {
        let pgids: Vec<i32> = self.groups().drain().collect();
        let mut signalled = 0;
        for pgid in pgids {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => {
                    signalled += 1;
                    debug!(pgid, "swept stale process group");
                }
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(pgid, error = %e, "failed to sweep process group"),
            }
        }
        signalled
    }

    fn groups(&self) -> std::sync::MutexGuard<'_, HashSet<i32>> {
        self.live_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, pgid: i32) -> GroupHandle<'_> {
        self.groups().insert(pgid);
        GroupHandle {
            supervisor: self,
            pgid,
        }
    }

    fn untrack(&self, pgid: i32) {
        self.groups().remove(&pgid);
    }

    /// Run `spec` until it exits, prints the sentinel, or hits a deadline.
    ///
    /// Spawn and wait failures are errors; deadlines are not.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        limits: &SupervisorLimits,
    ) -> Result<SupervisedOutput> {
        let start = Instant::now();
        debug!(
            cmd = %spec.display(),
            cwd = %spec.cwd.display(),
            timeout = ?limits.timeout,
            "spawning supervised process"
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn: {}", spec.display()))?;

        let pid = child.id().context("spawned process has no pid")?;
        let pgid = i32::try_from(pid).context("pid out of range")?;
        let handle = self.track(pgid);

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "child closed stdin early");
                }
            });
        }

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_buf = BoundedBuffer::new(limits.max_output_bytes);
        let mut err_buf = BoundedBuffer::new(limits.max_output_bytes);

        let hard_deadline = start + limits.timeout;
        let mut idle_deadline = limits.idle.map(|d| Instant::now() + d);
        let mut drain_deadline: Option<Instant> = None;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut status: Option<ExitStatus> = None;
        let sentinel = limits.sentinel.as_deref();

        let reason = loop {
            if !stdout_open && !stderr_open && status.is_some() {
                break ExitReason::Exited;
            }
            tokio::select! {
                line = out_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        idle_deadline = limits.idle.map(|d| Instant::now() + d);
                        let hit = sentinel.is_some_and(|s| line.contains(s));
                        out_buf.push_line(&line);
                        if hit {
                            break ExitReason::SentinelSeen;
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(error = %e, "error reading stdout");
                        stdout_open = false;
                    }
                },
                line = err_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        idle_deadline = limits.idle.map(|d| Instant::now() + d);
                        let hit = sentinel.is_some_and(|s| line.contains(s));
                        err_buf.push_line(&line);
                        if hit {
                            break ExitReason::SentinelSeen;
                        }
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!(error = %e, "error reading stderr");
                        stderr_open = false;
                    }
                },
                exited = child.wait(), if status.is_none() => {
                    let exited =
                        exited.with_context(|| format!("failed waiting on: {}", spec.display()))?;
                    status = Some(exited);
                    // Grandchildren may hold the pipes open; give them the grace period.
                    drain_deadline = Some(Instant::now() + limits.kill_grace);
                    idle_deadline = None;
                },
                _ = sleep_until(drain_deadline.unwrap_or(hard_deadline)),
                    if drain_deadline.is_some() =>
                {
                    break ExitReason::Exited;
                },
                _ = sleep_until(idle_deadline.unwrap_or(hard_deadline)),
                    if idle_deadline.is_some() =>
                {
                    break ExitReason::IdleTimeout;
                },
                // Once the leader has exited only the drain window applies.
                _ = sleep_until(hard_deadline), if status.is_none() => break ExitReason::TimedOut,
            }
        };

        match reason {
            ExitReason::Exited => {
                if stdout_open || stderr_open {
                    // Leader is gone but something in its group still holds the pipes.
                    signal_group(pgid, Signal::SIGKILL);
                }
            }
            ExitReason::TimedOut | ExitReason::IdleTimeout => {
                warn!(
                    cmd = %spec.display(),
                    ?reason,
                    elapsed = ?start.elapsed(),
                    "supervised process timed out"
                );
                terminate_group(pgid, &mut child, limits.kill_grace).await;
            }
            ExitReason::SentinelSeen => {
                debug!(cmd = %spec.display(), "sentinel seen; stopping process group");
                terminate_group(pgid, &mut child, limits.kill_grace).await;
            }
        }
        handle.release();

        let exit_code = match reason {
            ExitReason::SentinelSeen => Some(0),
            ExitReason::TimedOut | ExitReason::IdleTimeout => None,
            ExitReason::Exited => status.and_then(|s| s.code()),
        };
        let output = SupervisedOutput {
            exit_code,
            stdout: out_buf.into_string(),
            stderr: err_buf.into_string(),
            reason,
            duration: start.elapsed(),
        };
        debug!(
            exit_code = ?output.exit_code,
            ?reason,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "supervised process finished"
        );
        Ok(output)
    }
}

/// Signal a process group. A group that is already gone is not an error.
fn signal_group(pgid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => debug!(pgid, ?signal, error = %e, "failed to signal process group"),
    }
}

/// SIGTERM the group, wait `grace`, then SIGKILL and reap the leader.
async fn terminate_group(pgid: i32, child: &mut Child, grace: Duration) {
    let group = Pid::from_raw(pgid);
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            warn!(pgid, error = %e, "failed to send SIGTERM to process group");
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        // Leader is reaped; stragglers in the group still get the hard stop.
        signal_group(pgid, Signal::SIGKILL);
        return;
    }
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            warn!(pgid, error = %e, "failed to send SIGKILL to process group");
        }
    }
    if let Err(e) = child.wait().await {
        warn!(pgid, error = %e, "failed to reap killed process");
    }
}
