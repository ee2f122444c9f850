//! In-process capture through libpcap

use super::{async_trait, remove_stale, PacketCapture};
use crate::error::CaptureError;
use crate::models::CaptureBuffer;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Read timeout so the window deadline is checked on idle links
const READ_TIMEOUT_MS: i32 = 100;

const SNAPLEN: i32 = 65535;

/// Opens the interface in promiscuous mode and writes every packet to a savefile
#[derive(Debug, Clone)]
pub struct LiveCapture {
    path: PathBuf,
}

impl LiveCapture {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

fn device_error(e: pcap::Error) -> CaptureError {
    CaptureError::Device(e.to_string())
}

/// Blocking capture loop, run on the blocking pool
fn record(interface: &str, path: &Path, window: Duration) -> Result<u64, CaptureError> {
    let mut cap = pcap::Capture::from_device(interface)
        .map_err(device_error)?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .map_err(device_error)?;

    let mut savefile = cap.savefile(path).map_err(device_error)?;
    let deadline = Instant::now() + window;
    let mut count = 0u64;

    while Instant::now() < deadline {
        match cap.next_packet() {
            Ok(packet) => {
                savefile.write(&packet);
                count += 1;
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(device_error(e)),
        }
    }

    savefile.flush().map_err(device_error)?;
    Ok(count)
}

#[async_trait]
impl PacketCapture for LiveCapture {
    async fn capture(
        &self,
        window: Duration,
        interface: &str,
    ) -> Result<CaptureBuffer, CaptureError> {
        remove_stale(&self.path).await?;

        let path = self.path.clone();
        let interface_name = interface.to_string();

        let packet_count =
            tokio::task::spawn_blocking(move || record(&interface_name, &path, window))
                .await
                .map_err(|e| CaptureError::Device(format!("capture worker failed: {}", e)))??;

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
