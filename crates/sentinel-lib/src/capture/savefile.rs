//! Packet counting for pcap savefiles

use pcap_file::pcap::PcapReader;
use pcap_file::PcapError;
use std::io;
use std::path::Path;

/// Length of the savefile global header; shorter files hold no packets
const GLOBAL_HEADER_LEN: usize = 24;

/// Count complete packet records in the pcap file at `path`
///
/// A missing file and a file holding only the global header both count as
/// zero packets.
pub async fn count_packets(path: &Path) -> io::Result<u64> {
    match tokio::fs::read(path).await {
        Ok(bytes) => count_records(&bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// A trailing partial record (capture stopped mid-write) is ignored.
fn count_records(bytes: &[u8]) -> io::Result<u64> {
    if bytes.len() < GLOBAL_HEADER_LEN {
        return Ok(0);
    }

    let mut reader = PcapReader::new(bytes).map_err(invalid_savefile)?;
    let mut count = 0u64;

    while let Some(packet) = reader.next_packet() {
        match packet {
            Ok(_) => count += 1,
            Err(PcapError::IncompleteBuffer) => break,
            Err(PcapError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(invalid_savefile(e)),
        }
    }

    Ok(count)
}

fn invalid_savefile(e: PcapError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unreadable pcap savefile: {}", e),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
    use pcap_file::{Endianness, TsResolution};
    use std::time::Duration;

    fn write_packets(header: PcapHeader, packets: &[&[u8]]) -> Vec<u8> {
        let mut writer = PcapWriter::with_header(Vec::new(), header).unwrap();
        for (i, data) in packets.iter().enumerate() {
            let packet = PcapPacket::new(Duration::from_millis(i as u64), data.len() as u32, data);
            writer.write_packet(&packet).unwrap();
        }
        writer.into_writer()
    }

    /// Build a pcap file holding `packets` with the default header
    pub(crate) fn pcap_bytes(packets: &[&[u8]]) -> Vec<u8> {
        write_packets(PcapHeader::default(), packets)
    }

    #[test]
    fn test_count_little_endian() {
        let bytes = pcap_bytes(&[b"abc", b"", b"0123456789"]);
        assert_eq!(count_records(&bytes).unwrap(), 3);
    }

    #[test]
    fn test_count_big_endian_nanos() {
        let header = PcapHeader {
            endianness: Endianness::Big,
            ts_resolution: TsResolution::NanoSecond,
            ..PcapHeader::default()
        };
        let bytes = write_packets(header, &[b"\xff\xff\xff\xff", b"\xff\xff"]);
        assert_eq!(count_records(&bytes).unwrap(), 2);
    }

    #[test]
    fn test_header_only_and_short_files() {
        assert_eq!(count_records(&pcap_bytes(&[])).unwrap(), 0);
        assert_eq!(count_records(&[]).unwrap(), 0);
        assert_eq!(count_records(&[0xd4, 0xc3]).unwrap(), 0);
    }

    #[test]
    fn test_truncated_trailing_record_ignored() {
        let mut bytes = pcap_bytes(&[b"full packet", b"cut off here"]);
        bytes.truncate(bytes.len() - 4);
        assert_eq!(count_records(&bytes).unwrap(), 1);
    }

    #[test]
    fn test_not_a_pcap_file() {
        let err = count_records(&[0u8; 32]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_count_packets_missing_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let count = count_packets(&temp_dir.path().join("absent.pcap"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_count_packets_on_disk() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("buffer.pcap");
        tokio::fs::write(&path, pcap_bytes(&[b"one", b"two"]))
            .await
            .unwrap();
        assert_eq!(count_packets(&path).await.unwrap(), 2);
    }
}
