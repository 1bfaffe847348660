use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::ToolRunner;
use crate::attempt::ToolOutput;
use crate::cancel::CancelToken;
use crate::constants::{PROCESS_POLL_MS, TERMINATE_GRACE_MS};
use crate::error::{FlashError, FlashResult};
use crate::job::ToolInvocation;

/// Runs the flashing tool as a child process with piped output
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    terminate_grace: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        SubprocessRunner {
            terminate_grace: Duration::from_millis(TERMINATE_GRACE_MS),
        }
    }
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// SIGTERM to the tool's process group, then SIGKILL once the grace
    /// period runs out
    fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            if let Err(e) = signal_group(child, Signal::SIGTERM) {
                warn!("Could not send SIGTERM to tool: {}", e);
            }

            let deadline = Instant::now() + self.terminate_grace;
            while Instant::now() < deadline {
                if child.try_wait()?.is_some() {
                    break;
                }
                thread::sleep(Duration::from_millis(PROCESS_POLL_MS));
            }
            if child.try_wait()?.is_none() {
                warn!("Tool ignored SIGTERM, killing it");
            }
        }

        kill_and_reap(child)
    }
}

/// Signal every process in the child's group. Wrappers like `sudo` or a
/// shell script leave the real tool one level down.
#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(child.id() as i32), signal)
}

/// SIGKILL the whole group, then reap the child
fn kill_and_reap(child: &mut Child) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        // ESRCH once the group is empty
        if let Err(e) = signal_group(child, nix::sys::signal::Signal::SIGKILL) {
            debug!("killpg: {}", e);
        }
    }
    if let Err(e) = child.kill() {
        debug!("kill: {}", e);
    }
    child.wait()
}

/// Forward output to the channel line by line. Carriage returns end a
/// line too, since tools redraw progress with them.
fn forward_lines<R: Read + Send + 'static>(mut reader: R, sink: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        let mut line = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &b in &buf[..n] {
                if b == b'\n' || b == b'\r' {
                    if !line.is_empty() {
                        let text = String::from_utf8_lossy(&line).into_owned();
                        if sink.send(text).is_err() {
                            return;
                        }
                        line.clear();
                    }
                } else {
                    line.push(b);
                }
            }
        }
        if !line.is_empty() {
            let _ = sink.send(String::from_utf8_lossy(&line).into_owned());
        }
    });
}

impl ToolRunner for SubprocessRunner {
    fn run(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> FlashResult<ToolOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| {
                FlashError::ToolInvocation(format!("{}: {}", invocation.program, e))
            })?;
        debug!("Spawned {} (pid {})", invocation.command_line(), child.id());

        let (sink, source) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, sink.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, sink);
        }

        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(PROCESS_POLL_MS);
        let mut result = ToolOutput::default();

        let status = loop {
            match source.recv_timeout(poll) {
                Ok(line) => {
                    on_line(&line);
                    result.output.push_str(&line);
                    result.output.push('\n');
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if cancel.is_cancelled() {
                warn!("Interrupted, stopping {}", invocation.program);
                result.interrupted = true;
                break self.terminate(&mut child)?;
            }

            if Instant::now() >= deadline {
                warn!(
                    "{} exceeded {:?}, killing it",
                    invocation.program, timeout
                );
                result.timed_out = true;
                break kill_and_reap(&mut child)?;
            }
        };

        // Pick up whatever the readers still hold
        while let Ok(line) = source.recv_timeout(poll) {
            on_line(&line);
            result.output.push_str(&line);
            result.output.push('\n');
        }

        result.exit_code = status.code();
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            device_id: "test".to_string(),
        }
    }

    fn run(script: &str, timeout: Duration) -> FlashResult<ToolOutput> {
        SubprocessRunner::new()
            .terminate_grace(Duration::from_millis(200))
            .run(&sh(script), timeout, &CancelToken::new(), &mut |_: &str| {})
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = run("echo loader ok; echo oops >&2; exit 3", Duration::from_secs(10)).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(out.output.contains("loader ok"));
        assert!(out.output.contains("oops"));
        assert!(!out.timed_out);
    }

    #[test]
    fn carriage_returns_split_progress_lines() {
        let mut lines = Vec::new();
        SubprocessRunner::new()
            .run(
                &sh("printf 'Write (10%%)\\rWrite (50%%)\\rWrite (100%%)\\n'"),
                Duration::from_secs(10),
                &CancelToken::new(),
                &mut |line: &str| lines.push(line.to_string()),
            )
            .unwrap();
        assert_eq!(lines, vec!["Write (10%)", "Write (50%)", "Write (100%)"]);
    }

    #[test]
    fn timeout_kills_and_reaps_the_child() {
        let start = Instant::now();
        let out = run("echo started; exec sleep 30", Duration::from_millis(300)).unwrap();
        assert!(out.timed_out);
        assert!(out.output.contains("started"));
        // Killed by signal, so no exit code
        assert_eq!(out.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_processes_the_tool_started() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let script = format!("sh -c 'sleep 1; touch {}'; true", marker.display());

        let out = run(&script, Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);

        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn cancelled_wrapper_takes_its_tool_down() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let cancel = CancelToken::new();
        cancel.cancel();

        let out = SubprocessRunner::new()
            .terminate_grace(Duration::from_millis(200))
            .run(
                &sh(&format!("sh -c 'sleep 1; touch {}'; true", marker.display())),
                Duration::from_secs(30),
                &cancel,
                &mut |_: &str| {},
            )
            .unwrap();
        assert!(out.interrupted);

        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn cancellation_terminates_gracefully() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = SubprocessRunner::new()
            .terminate_grace(Duration::from_millis(500))
            .run(&sh("exec sleep 30"), Duration::from_secs(30), &cancel, &mut |_: &str| {})
            .unwrap();
        assert!(out.interrupted);
    }

    #[test]
    fn missing_program_is_an_invocation_error() {
        let inv = ToolInvocation {
            program: "/nonexistent/upgrade_tool".to_string(),
            args: vec![],
            device_id: "test".to_string(),
        };
        let err = SubprocessRunner::new()
            .run(&inv, Duration::from_secs(1), &CancelToken::new(), &mut |_: &str| {})
            .unwrap_err();
        assert!(matches!(err, FlashError::ToolInvocation(_)));
    }
}
