//! UBX framing: checksums, frame building, message classification and
//! iteration over a stream of frames.
use crate::error::{MgaError, Result};

/// First UBX sync character
pub const SYNC1: u8 = 0xB5;
/// Second UBX sync character
pub const SYNC2: u8 = 0x62;
/// Sync, class, id and length
pub const HEADER_LEN: usize = 6;
/// Header plus checksum
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 2;

/// UBX message classes used by the engine
pub mod class {
    /// UBX-ACK
    pub const ACK: u8 = 0x05;
    /// UBX-CFG
    pub const CFG: u8 = 0x06;
    /// UBX-AID (legacy aiding)
    pub const AID: u8 = 0x0B;
    /// UBX-MGA
    pub const MGA: u8 = 0x13;
}

/// Message ids within UBX-MGA
pub mod mga {
    /// GPS ephemeris/almanac/health
    pub const GPS: u8 = 0x00;
    /// Galileo
    pub const GAL: u8 = 0x02;
    /// BeiDou
    pub const BDS: u8 = 0x03;
    /// QZSS
    pub const QZSS: u8 = 0x05;
    /// GLONASS
    pub const GLO: u8 = 0x06;
    /// AssistNow Offline record
    pub const ANO: u8 = 0x20;
    /// Flash data/stop/ack
    pub const FLASH: u8 = 0x21;
    /// Initial time/position
    pub const INI: u8 = 0x40;
    /// Acknowledgement
    pub const ACK: u8 = 0x60;
    /// Navigation database
    pub const DBD: u8 = 0x80;
}

/// Message ids within UBX-AID
pub mod aid {
    /// Initial data
    pub const INI: u8 = 0x01;
    /// GPS health, UTC and ionosphere
    pub const HUI: u8 = 0x02;
    /// Almanac
    pub const ALM: u8 = 0x30;
    /// Ephemeris
    pub const EPH: u8 = 0x31;
    /// ALP server
    pub const ALPSRV: u8 = 0x32;
    /// ALP file transfer
    pub const ALP: u8 = 0x50;
}

/// Message ids within UBX-ACK
pub mod ack {
    /// Not acknowledged
    pub const NAK: u8 = 0x00;
    /// Acknowledged
    pub const ACK: u8 = 0x01;
}

/// Message ids within UBX-CFG
pub mod cfg {
    /// Message rate
    pub const MSG: u8 = 0x01;
    /// Expert navigation settings
    pub const NAVX5: u8 = 0x23;
    /// Configuration value set
    pub const VALSET: u8 = 0x8A;
}

/// 8-bit Fletcher checksum over `data`.
pub fn checksum(data: &[u8]) -> (u8, u8) {
    data.iter().fold((0u8, 0u8), |(ck_a, ck_b), &byte| {
        let ck_a = ck_a.wrapping_add(byte);
        (ck_a, ck_b.wrapping_add(ck_a))
    })
}

/// Compute the checksum over the whole buffer and append it.
pub fn append_checksum(buf: &mut Vec<u8>) {
    let (ck_a, ck_b) = checksum(buf);
    buf.push(ck_a);
    buf.push(ck_b);
}

/// Check that `[class, id, length, payload]` is followed by its checksum.
///
/// `data` must hold exactly the checksummed bytes plus the two checksum bytes.
pub fn verify_checksum(data: &[u8]) -> bool {
    if data.len() < 6 {
        return false;
    }
    let (body, ck) = data.split_at(data.len() - 2);
    checksum(body) == (ck[0], ck[1])
}

/// Recompute the checksum of a complete frame (sync included) in place.
pub fn refresh_checksum(frame: &mut [u8]) {
    let end = frame.len() - 2;
    let (ck_a, ck_b) = checksum(&frame[2..end]);
    frame[end] = ck_a;
    frame[end + 1] = ck_b;
}

/// Largest payload a UBX frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Build a complete UBX frame.
///
/// Fails with `InvalidArgument` if the payload does not fit the 16-bit length field.
pub fn build_frame(class: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    write_frame(&mut frame, class, id, payload)?;
    Ok(frame)
}

/// Append a complete UBX frame to `out`.
///
/// Nothing is appended if the payload is longer than [`MAX_PAYLOAD`].
pub fn write_frame(out: &mut Vec<u8>, class: u8, id: u8, payload: &[u8]) -> Result<()> {
    let len = u16::try_from(payload.len())
        .map_err(|_| MgaError::InvalidArgument("UBX payload longer than 65535 bytes"))?;
    put_frame(out, class, id, len, payload);
    Ok(())
}

/// Build a frame around a payload whose size is known at compile time.
pub fn fixed_frame<const N: usize>(class: u8, id: u8, payload: &[u8; N]) -> Vec<u8> {
    const { assert!(N <= MAX_PAYLOAD) };
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + N);
    put_frame(&mut frame, class, id, N as u16, payload);
    frame
}

fn put_frame(out: &mut Vec<u8>, class: u8, id: u8, len: u16, payload: &[u8]) {
    let start = out.len();
    out.extend_from_slice(&[SYNC1, SYNC2, class, id]);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&out[start + 2..]);
    out.push(ck_a);
    out.push(ck_b);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Class, id and payload length of a frame.
pub struct FrameHeader {
    /// Message class
    pub class: u8,
    /// Message id
    pub id: u8,
    /// Payload length
    pub len: u16,
}

impl FrameHeader {
    /// Decode the header of a buffer that starts with the sync characters.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN || buf[0] != SYNC1 || buf[1] != SYNC2 {
            return None;
        }
        Some(Self {
            class: buf[2],
            id: buf[3],
            len: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }

    /// Size of the whole frame, checksum included.
    pub fn frame_len(&self) -> usize {
        self.len as usize + FRAME_OVERHEAD
    }

    /// Whether the assistance engine handles this message.
    pub fn is_of_interest(&self) -> bool {
        MsgKind::classify(self.class, self.id).is_some()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
/// The messages of interest to the assistance engine.
pub enum MsgKind {
    /// UBX-MGA-GPS
    MgaGps,
    /// UBX-MGA-GAL
    MgaGal,
    /// UBX-MGA-BDS
    MgaBds,
    /// UBX-MGA-QZSS
    MgaQzss,
    /// UBX-MGA-GLO
    MgaGlo,
    /// UBX-MGA-ANO
    MgaAno,
    /// UBX-MGA-INI
    MgaIni,
    /// UBX-MGA-ACK
    MgaAck,
    /// UBX-MGA-FLASH
    MgaFlash,
    /// UBX-MGA-DBD
    MgaDbd,
    /// UBX-AID-INI
    AidIni,
    /// UBX-AID-HUI
    AidHui,
    /// UBX-AID-ALM
    AidAlm,
    /// UBX-AID-EPH
    AidEph,
    /// UBX-AID-ALP
    AidAlp,
    /// UBX-AID-ALPSRV
    AidAlpsrv,
    /// UBX-ACK-ACK
    Ack,
    /// UBX-ACK-NAK
    Nak,
}

impl MsgKind {
    /// Classify a class/id pair, `None` if it is not of interest.
    pub fn classify(class_id: u8, msg_id: u8) -> Option<Self> {
        use MsgKind::*;
        let kind = match (class_id, msg_id) {
            (class::MGA, mga::GPS) => MgaGps,
            (class::MGA, mga::GAL) => MgaGal,
            (class::MGA, mga::BDS) => MgaBds,
            (class::MGA, mga::QZSS) => MgaQzss,
            (class::MGA, mga::GLO) => MgaGlo,
            (class::MGA, mga::ANO) => MgaAno,
            (class::MGA, mga::INI) => MgaIni,
            (class::MGA, mga::ACK) => MgaAck,
            (class::MGA, mga::FLASH) => MgaFlash,
            (class::MGA, mga::DBD) => MgaDbd,
            (class::AID, aid::INI) => AidIni,
            (class::AID, aid::HUI) => AidHui,
            (class::AID, aid::ALM) => AidAlm,
            (class::AID, aid::EPH) => AidEph,
            (class::AID, aid::ALP) => AidAlp,
            (class::AID, aid::ALPSRV) => AidAlpsrv,
            (class::ACK, ack::ACK) => Ack,
            (class::ACK, ack::NAK) => Nak,
            _ => return None,
        };
        Some(kind)
    }

    /// Per-constellation MGA messages as found in offline data (almanacs and friends).
    pub fn is_almanac(&self) -> bool {
        matches!(
            self,
            MsgKind::MgaGps | MsgKind::MgaGal | MsgKind::MgaBds | MsgKind::MgaQzss | MsgKind::MgaGlo
        )
    }
}

#[derive(Debug, Copy, Clone)]
/// A frame found in a buffer.
pub struct Frame<'a> {
    /// Offset of the first sync character in the scanned buffer
    pub offset: usize,
    /// Decoded header
    pub header: FrameHeader,
    /// The whole frame, sync to checksum
    pub bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Payload of the frame.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_LEN..self.bytes.len() - 2]
    }

    /// Whether the checksum of the frame is correct.
    pub fn checksum_ok(&self) -> bool {
        verify_checksum(&self.bytes[2..])
    }

    /// Classification of the frame.
    pub fn kind(&self) -> Option<MsgKind> {
        MsgKind::classify(self.header.class, self.header.id)
    }
}

/// Parse a single complete frame, checksum included.
pub fn parse_frame(buf: &[u8]) -> Option<Frame<'_>> {
    let header = FrameHeader::peek(buf)?;
    if buf.len() != header.frame_len() {
        return None;
    }
    let frame = Frame {
        offset: 0,
        header,
        bytes: buf,
    };
    frame.checksum_ok().then_some(frame)
}

/// Iterator over the frames of a contiguous UBX stream.
///
/// Yields `Err(BadData)` once and stops if the stream contains anything
/// other than back-to-back frames.
pub struct Frames<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Iterate over the frames of `buf`.
pub fn frames(buf: &[u8]) -> Frames<'_> {
    Frames {
        buf,
        pos: 0,
        failed: false,
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        let header = match FrameHeader::peek(rest) {
            Some(header) if header.frame_len() <= rest.len() => header,
            _ => {
                self.failed = true;
                return Some(Err(MgaError::BadData));
            }
        };
        let offset = self.pos;
        self.pos += header.frame_len();
        Some(Ok(Frame {
            offset,
            header,
            bytes: &rest[..header.frame_len()],
        }))
    }
}

/// Collects serial bytes across reads and hands out complete frames.
///
/// Bytes that are not part of a UBX frame, such as NMEA sentences, are dropped.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    pending: Vec<u8>,
}

impl FrameReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add received bytes and return every frame completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let Some(start) = self.pending[pos..]
                .windows(2)
                .position(|w| w == [SYNC1, SYNC2])
            else {
                // keep a trailing first sync character, it may be completed by the next read
                pos = if self.pending.last() == Some(&SYNC1) {
                    self.pending.len() - 1
                } else {
                    self.pending.len()
                };
                break;
            };
            pos += start;
            let Some(header) = FrameHeader::peek(&self.pending[pos..]) else {
                break;
            };
            let end = pos + header.frame_len();
            if end > self.pending.len() {
                break;
            }
            if verify_checksum(&self.pending[pos + 2..end]) {
                out.push(self.pending[pos..end].to_vec());
                pos = end;
            } else {
                log::warn!(
                    "Dropping UBX frame {:02X}/{:02X} with bad checksum",
                    header.class,
                    header.id
                );
                pos += 1;
            }
        }
        self.pending.drain(..pos);
        out
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
