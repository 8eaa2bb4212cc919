//! Running one child process for one message.

use crate::codec::SeparatorCodec;
use crate::error::ProcessError;
use crate::signal::{InterceptedSignal, SignalRegistry};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::codec::FramedRead;

/// Spawns the command for a message and reports how it ended. While a child runs the intercepted
/// signals are forwarded to its process group.
#[derive(Clone)]
pub struct ProcessRunner {
    signals: SignalRegistry,
}

impl ProcessRunner {
    pub fn new(signals: SignalRegistry) -> Self {
        ProcessRunner { signals }
    }

    /// Run `command` with `args`, passing `input` on its standard input.
    ///
    /// Exit code zero is success, other exit codes and termination by signal are
    /// [`ProcessError`]s. The outcome is logged here, callers don't need to log a `ProcessError`.
    pub async fn run(&self, command: &str, args: &[String], input: Bytes) -> Result<()> {
        let id = format!("[process {}]", uuid::Uuid::new_v4());

        info!("{} Creating a child process for command: {} {}", id, command, args.join(" "));

        // Register before spawning so no signal is lost in between, dropping the listener at the
        // end of this function deregisters it.
        let mut listener = self.signals.subscribe();

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so the forwarded signals reach the grandchildren as well.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Cannot start child process {}", command))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            log_output(id.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            log_output(id.clone(), stderr);
        }

        let Some(mut stdin) = child.stdin.take() else {
            if let Some(pid) = pid {
                kill_group(pid, InterceptedSignal::Terminate);
            }
            let _ = child.start_kill();

            return Err(ProcessError::NoStdin.into());
        };

        let stdin_id = id.clone();
        tokio::spawn(async move {
            // The child can exit before reading all of its input.
            if let Err(e) = stdin.write_all(&input).await {
                debug!("{} Cannot write stdin {:?}", stdin_id, e);
            }
            // stdin is closed when dropped
        });

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.with_context(|| format!("Cannot wait for child process {}", command))?;
                }
                Some(signal) = listener.recv() => {
                    debug!("{} Forwarding signal {} to child process.", id, signal);

                    if let Some(pid) = pid {
                        kill_group(pid, signal);
                    }
                }
            }
        };

        check_status(&id, status)
    }
}

fn log_output<R>(id: String, output: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(output, SeparatorCodec::new("\n"));

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => info!("{} {}", id, String::from_utf8_lossy(&line)),
                Err(e) => {
                    debug!("{} Cannot read child output {:?}", id, e);
                    break;
                }
            }
        }
    });
}

fn check_status(id: &str, status: ExitStatus) -> Result<()> {
    match status.code() {
        Some(0) => {
            info!("{} Child process ended with code 0", id);

            Ok(())
        }
        Some(code) => {
            let err = ProcessError::ExitCode(code);
            error!("{} {}", id, err);

            Err(err.into())
        }
        None => {
            let err = ProcessError::Signalled(signal_name(&status));
            warn!("{} {}", id, err);

            Err(err.into())
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signo) => match nix::sys::signal::Signal::try_from(signo) {
            Ok(signal) => signal.as_str().to_owned(),
            Err(_) => signo.to_string(),
        },
        None => "unknown".to_owned(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> String {
    "unknown".to_owned()
}

#[cfg(unix)]
fn kill_group(pid: u32, signal: InterceptedSignal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal.as_nix()) {
        warn!("Failed to send {} to process group {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32, _signal: InterceptedSignal) {}
