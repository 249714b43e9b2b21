//! Navigation database snapshots (UBX-MGA-DBD).
//!
//! The receiver dumps its database as a series of UBX-MGA-DBD messages in
//! answer to an empty poll and closes the dump with a UBX-MGA-ACK that
//! carries the number of messages sent. Sending the same messages back
//! restores the database.
use crate::{
    error::{MgaError, Result},
    ubx::{self, class, mga, MsgKind},
};

/// Largest UBX-MGA-DBD payload accepted
pub const MAX_DBD_PAYLOAD: usize = 256;

/// Empty UBX-MGA-DBD, which asks the receiver for its database.
pub fn poll_frame() -> Vec<u8> {
    ubx::fixed_frame(class::MGA, mga::DBD, &[])
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// What a frame meant to a [`DatabaseCollector`]
pub enum CollectStatus {
    /// A database message was stored
    Stored,
    /// The dump is complete
    Complete,
    /// The frame is not part of the dump
    Ignored,
}

#[derive(Debug, Default)]
/// Collects the receiver's answer to [`poll_frame`]
pub struct DatabaseCollector {
    data: Vec<u8>,
    messages: u32,
    complete: bool,
}

impl DatabaseCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one complete frame received from the receiver.
    pub fn push(&mut self, bytes: &[u8]) -> Result<CollectStatus> {
        let Some(frame) = ubx::parse_frame(bytes) else {
            return Ok(CollectStatus::Ignored);
        };
        if self.complete {
            return Ok(CollectStatus::Ignored);
        }
        let payload = frame.payload();
        match frame.kind() {
            Some(MsgKind::MgaDbd) if !payload.is_empty() => {
                if payload.len() > MAX_DBD_PAYLOAD {
                    log::warn!("UBX-MGA-DBD of {} bytes is too long", payload.len());
                    return Err(MgaError::BadData);
                }
                self.data.try_reserve(bytes.len())?;
                self.data.extend_from_slice(bytes);
                self.messages += 1;
                Ok(CollectStatus::Stored)
            }
            Some(MsgKind::MgaAck) if payload.len() >= 8 && payload[3] == mga::DBD => {
                let reported = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                if reported != self.messages {
                    log::warn!(
                        "Receiver reported {reported} database messages, {} received",
                        self.messages
                    );
                    return Err(MgaError::BadData);
                }
                log::info!("Navigation database of {} messages collected", self.messages);
                self.complete = true;
                Ok(CollectStatus::Complete)
            }
            _ => Ok(CollectStatus::Ignored),
        }
    }

    /// Number of database messages collected.
    pub fn messages(&self) -> u32 {
        self.messages
    }

    /// Whether the receiver closed the dump.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The collected messages as a UBX stream.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Check that `data` is a snapshot made of UBX-MGA-DBD messages only.
pub fn validate_database(data: &[u8]) -> Result<()> {
    let mut count = 0;
    for frame in ubx::frames(data) {
        let frame = frame?;
        if frame.kind() != Some(MsgKind::MgaDbd)
            || frame.payload().len() > MAX_DBD_PAYLOAD
            || !frame.checksum_ok()
        {
            log::warn!(
                "UBX {:02X}/{:02X} at offset {} does not belong in a database snapshot",
                frame.header.class,
                frame.header.id,
                frame.offset
            );
            return Err(MgaError::BadData);
        }
        count += 1;
    }
    if count == 0 {
        return Err(MgaError::NoDataToSend);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubx::build_frame;

    fn dbd(n: u8, len: usize) -> Vec<u8> {
        build_frame(0x13, 0x80, &vec![n; len]).unwrap()
    }

    fn closing_ack(count: u32) -> Vec<u8> {
        let mut p = vec![1, 0, 0, 0x80];
        p.extend_from_slice(&count.to_le_bytes());
        build_frame(0x13, 0x60, &p).unwrap()
    }

    #[test]
    fn poll() {
        assert_eq!(poll_frame(), [0xB5, 0x62, 0x13, 0x80, 0x00, 0x00, 0x93, 0xCC]);
    }

    #[test]
    fn collect_dump() {
        let mut db = DatabaseCollector::new();
        let msgs = [dbd(1, 248), dbd(2, 60), dbd(3, 164)];
        for m in &msgs {
            assert_eq!(db.push(m).unwrap(), CollectStatus::Stored);
        }
        let nav_pvt = build_frame(0x01, 0x07, &[0; 92]).unwrap();
        assert_eq!(db.push(&nav_pvt).unwrap(), CollectStatus::Ignored);
        assert_eq!(db.push(&closing_ack(3)).unwrap(), CollectStatus::Complete);
        assert!(db.is_complete());
        assert_eq!(db.push(&msgs[0]).unwrap(), CollectStatus::Ignored);
        assert_eq!(db.messages(), 3);
        let data = db.into_data();
        assert_eq!(data, msgs.concat());
        validate_database(&data).unwrap();
    }

    #[test]
    fn count_mismatch() {
        let mut db = DatabaseCollector::new();
        db.push(&dbd(1, 20)).unwrap();
        assert_eq!(db.push(&closing_ack(2)), Err(MgaError::BadData));
    }

    #[test]
    fn oversized_record() {
        let mut db = DatabaseCollector::new();
        assert_eq!(db.push(&dbd(1, 257)), Err(MgaError::BadData));
        assert_eq!(validate_database(&dbd(1, 257)), Err(MgaError::BadData));
    }

    #[test]
    fn snapshot_must_be_dbd_only() {
        let mut data = dbd(1, 20);
        data.extend(build_frame(0x13, 0x00, &[1, 0, 0, 0]).unwrap());
        assert_eq!(validate_database(&data), Err(MgaError::BadData));
        assert_eq!(validate_database(&[]), Err(MgaError::NoDataToSend));
    }
}
