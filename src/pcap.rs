//! libpcap capture files with the UMDT user-DLT encapsulation.
//!
//! Files use link type `DLT_USER0` (147). Each record body starts with a
//! 4-byte metadata prefix — direction, protocol hint, two reserved zero
//! bytes — followed by the frame exactly as on the wire (MBAP frame for
//! TCP, CRC included for RTU). The companion Wireshark dissector keys off
//! the prefix.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{IoOperation, TransportError, UmdtError};

/// libpcap link type reserved for private use.
pub const LINKTYPE_USER0: u32 = 147;

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65_535;

/// Direction byte of the metadata prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Unknown = 0,
    Inbound = 1,
    Outbound = 2,
}

/// Protocol-hint byte of the metadata prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolHint {
    Unknown = 0,
    ModbusRtu = 1,
    ModbusTcp = 2,
}

/// Append-only pcap writer; one mutex per file, flushed after every record
/// so captures survive a crash mid-session.
#[derive(Debug)]
pub struct PcapWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl PcapWriter {
    /// Creates (truncating) the capture file and writes the global header.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, UmdtError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path).await.map_err(|e| {
            TransportError::io(
                IoOperation::Configure,
                format!("Failed to create capture file {}", path.display()),
                e,
            )
        })?;

        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_USER0.to_le_bytes());

        file.write_all(&header)
            .await
            .map_err(|e| TransportError::io(IoOperation::Write, "pcap global header", e))?;
        file.flush()
            .await
            .map_err(|e| TransportError::io(IoOperation::Flush, "pcap global header", e))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and flushes it to disk.
    pub async fn append(
        &self,
        direction: Direction,
        hint: ProtocolHint,
        frame: &[u8],
    ) -> Result<(), UmdtError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let body_len = (frame.len() + 4) as u32;
        let mut record = Vec::with_capacity(16 + 4 + frame.len());
        record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&now.subsec_micros().to_le_bytes());
        record.extend_from_slice(&body_len.to_le_bytes()); // incl_len
        record.extend_from_slice(&body_len.to_le_bytes()); // orig_len
        record.push(direction as u8);
        record.push(hint as u8);
        record.extend_from_slice(&[0x00, 0x00]); // reserved
        record.extend_from_slice(frame);

        let mut file = self.file.lock().await;
        file.write_all(&record)
            .await
            .map_err(|e| TransportError::io(IoOperation::Write, "pcap record", e))?;
        file.flush()
            .await
            .map_err(|e| TransportError::io(IoOperation::Flush, "pcap record", e))?;

        Ok(())
    }
}

/// The bridge's two capture taps: master↔bridge and bridge↔slave.
/// Either side may be absent; records to a missing side are no-ops.
#[derive(Debug, Default)]
pub struct DualPcap {
    upstream: Option<PcapWriter>,
    downstream: Option<PcapWriter>,
}

impl DualPcap {
    pub async fn open(
        upstream: Option<&Path>,
        downstream: Option<&Path>,
    ) -> Result<Self, UmdtError> {
        let upstream = match upstream {
            Some(path) => Some(PcapWriter::create(path).await?),
            None => None,
        };
        let downstream = match downstream {
            Some(path) => Some(PcapWriter::create(path).await?),
            None => None,
        };
        Ok(Self {
            upstream,
            downstream,
        })
    }

    pub async fn record_upstream(&self, direction: Direction, hint: ProtocolHint, frame: &[u8]) {
        if let Some(writer) = &self.upstream {
            if let Err(e) = writer.append(direction, hint, frame).await {
                tracing::warn!("Upstream capture write failed: {}", e);
            }
        }
    }

    pub async fn record_downstream(&self, direction: Direction, hint: ProtocolHint, frame: &[u8]) {
        if let Some(writer) = &self.downstream {
            if let Err(e) = writer.append(direction, hint, frame).await {
                tracing::warn!("Downstream capture write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_global_header_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let _writer = PcapWriter::create(&path).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 2);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 4);
        assert_eq!(
            u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            SNAPLEN
        );
        assert_eq!(
            u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            LINKTYPE_USER0
        );
    }

    #[tokio::test]
    async fn test_record_metadata_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let writer = PcapWriter::create(&path).await.unwrap();

        let frame = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        writer
            .append(Direction::Inbound, ProtocolHint::ModbusRtu, &frame)
            .await
            .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let record = &bytes[24..];
        let incl_len = u32::from_le_bytes([record[8], record[9], record[10], record[11]]);
        assert_eq!(incl_len as usize, frame.len() + 4);
        assert_eq!(record[16], 1); // inbound
        assert_eq!(record[17], 1); // modbus-rtu
        assert_eq!(&record[18..20], &[0, 0]);
        assert_eq!(&record[20..], &frame);
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcap");
        let writer = PcapWriter::create(&path).await.unwrap();

        for _ in 0..5 {
            writer
                .append(Direction::Outbound, ProtocolHint::ModbusTcp, &[0x00; 12])
                .await
                .unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        let mut offset = 24;
        let mut last = (0u32, 0u32);
        while offset < bytes.len() {
            let sec = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let usec = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
            assert!((sec, usec) >= last);
            last = (sec, usec);
            let incl =
                u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap()) as usize;
            offset += 16 + incl;
        }
        assert_eq!(offset, bytes.len());
    }

    #[tokio::test]
    async fn test_dual_taps_independent() {
        let dir = tempfile::tempdir().unwrap();
        let up = dir.path().join("up.pcap");
        let down = dir.path().join("down.pcap");
        let dual = DualPcap::open(Some(&up), Some(&down)).await.unwrap();

        dual.record_upstream(Direction::Inbound, ProtocolHint::ModbusTcp, &[0xAA; 12])
            .await;
        dual.record_downstream(Direction::Outbound, ProtocolHint::ModbusRtu, &[0xBB; 8])
            .await;

        assert_eq!(std::fs::read(&up).unwrap().len(), 24 + 16 + 4 + 12);
        assert_eq!(std::fs::read(&down).unwrap().len(), 24 + 16 + 4 + 8);
    }

    #[tokio::test]
    async fn test_absent_tap_is_noop() {
        let dual = DualPcap::open(None, None).await.unwrap();
        dual.record_upstream(Direction::Inbound, ProtocolHint::ModbusTcp, &[0x00; 4])
            .await;
    }
}
