//! Capture through an external tcpdump-compatible command

use super::{async_trait, count_packets, remove_stale, PacketCapture};
use crate::error::CaptureError;
use crate::models::CaptureBuffer;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Time the capture command gets to exit after SIGTERM before it is killed
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Runs `<program> [leading args] -i <iface> -w <path> -U -q` for the window
///
/// The command runs in its own process group, and the whole group is stopped
/// when the window elapses, so wrappers such as `sudo` cannot leave the real
/// capture process behind. `-U` makes tcpdump flush every packet, so the
/// savefile is complete up to the last whole record.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    leading_args: Vec<String>,
    path: PathBuf,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            path: path.into(),
        }
    }

    /// Split a whitespace separated command line such as `sudo tcpdump`
    pub fn from_command_line(line: &str, path: &Path) -> Result<Self, CaptureError> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| CaptureError::Device("capture command is empty".to_string()))?;
        Ok(Self::new(program, path).with_leading_args(parts))
    }

    /// Arguments placed before the capture arguments
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.leading_args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl PacketCapture for CommandCapture {
    async fn capture(
        &self,
        window: Duration,
        interface: &str,
    ) -> Result<CaptureBuffer, CaptureError> {
        if remove_stale(&self.path).await? {
            debug!(path = %self.path.display(), "Removed previous capture file");
        }

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg("-i")
            .arg(interface)
            .arg("-w")
            .arg(&self.path)
            .args(["-U", "-q"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                command: self.command_line(),
                source,
            })?;
        let group = child.id().map(|pid| Pid::from_raw(pid as i32));

        match tokio::time::timeout(window, child.wait()).await {
            // Exited on its own before the window closed
            Ok(status) => {
                let status = status?;
                // Forked children may still hold the stderr pipe
                signal_group(group, Signal::SIGKILL);
                if !status.success() {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        pipe.read_to_string(&mut stderr).await?;
                    }
                    let message = match stderr.trim() {
                        "" => format!("capture command exited with {}", status),
                        text => text.to_string(),
                    };
                    return Err(CaptureError::Device(message));
                }
                warn!(
                    interface,
                    "Capture command exited before the window elapsed"
                );
            }
            Err(_) => stop(&mut child, group).await?,
        }

        let packet_count = count_packets(&self.path).await?;
        debug!(interface, packet_count, "Capture window closed");

        if packet_count == 0 {
            return Err(CaptureError::Empty);
        }

        Ok(CaptureBuffer {
            path: self.path.clone(),
            packet_count,
        })
    }
}

/// Ask the capture's process group to terminate, then kill whatever is left
/// once the leader exits or [`STOP_GRACE`] runs out
async fn stop(child: &mut Child, group: Option<Pid>) -> io::Result<()> {
    signal_group(group, Signal::SIGTERM);

    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!("Capture command ignored SIGTERM, killing it");
        child.start_kill()?;
        child.wait().await?;
    }
    signal_group(group, Signal::SIGKILL);
    Ok(())
}

/// Signal every process in the group; a group that is already gone is fine
fn signal_group(group: Option<Pid>, signal: Signal) {
    let Some(group) = group else { return };
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(
            pgid = group.as_raw(),
            signal = signal.as_str(),
            error = %e,
            "Failed to signal capture process group"
        ),
    }
}
