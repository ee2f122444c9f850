//! Packet capture windows
//!
//! A capture window records raw traffic from one interface for a fixed
//! duration and persists it as a pcap file at a fixed path. The default
//! backend drives an external tcpdump-compatible command; the `libpcap`
//! feature adds an in-process backend.

mod command;
#[cfg(feature = "libpcap")]
mod live;
mod savefile;

pub use command::CommandCapture;
#[cfg(feature = "libpcap")]
pub use live::LiveCapture;
pub use savefile::count_packets;

use crate::error::CaptureError;
use crate::models::CaptureBuffer;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Trait for capture backends
#[async_trait]
pub trait PacketCapture: Send + Sync {
    /// Record `interface` for `window` and persist the packets
    ///
    /// Any file left at the capture path by a previous window is removed
    /// first. Observing zero packets is `CaptureError::Empty`.
    async fn capture(&self, window: Duration, interface: &str)
        -> Result<CaptureBuffer, CaptureError>;
}

/// Available capture backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// External tcpdump-compatible command
    Command,
    /// In-process libpcap
    Live,
}

/// Settings shared by all capture backends
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub backend: CaptureBackend,
    /// Command line of the capture tool, e.g. `tcpdump` or `sudo tcpdump`
    pub command: String,
    pub path: PathBuf,
}

/// Create the configured capture backend
pub fn create_capture(settings: &CaptureSettings) -> Result<Arc<dyn PacketCapture>, CaptureError> {
    match settings.backend {
        CaptureBackend::Command => {
            let capture = CommandCapture::from_command_line(&settings.command, &settings.path)?;
            tracing::info!(
                command = %settings.command,
                path = %settings.path.display(),
                "Using external capture command"
            );
            Ok(Arc::new(capture))
        }
        #[cfg(feature = "libpcap")]
        CaptureBackend::Live => {
            tracing::info!(path = %settings.path.display(), "Using libpcap capture");
            Ok(Arc::new(LiveCapture::new(&settings.path)))
        }
        #[cfg(not(feature = "libpcap"))]
        CaptureBackend::Live => Err(CaptureError::Device(
            "live capture requires the libpcap feature".to_string(),
        )),
    }
}

/// Remove a file left over from a previous cycle
///
/// Returns whether a file was removed. A missing file is not an error.
pub async fn remove_stale(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
