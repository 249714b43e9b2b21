//! Legacy (UBX-AID) aiding: pushing an ALP file into flash, and serving
//! ALP data to receivers that request it slice by slice.
use serde::{Deserialize, Serialize};

use crate::{
    error::{MgaError, Result, TerminateReason},
    event::{LegacyAidingEvent, ProgressEvent},
    flash::{block_spans, FlashBlock, FlashPayload},
    flow::{Link, Step},
    msglist::MsgState,
    ubx::{self, aid, cfg, class, Frame, MsgKind},
};

/// First word of an ALP file
pub const ALP_MAGIC: u32 = 0x0152_08EF;
/// Size of the ALP file header
pub const ALP_HEADER_LEN: usize = 84;
/// Largest slice of data carried by one UBX-AID-ALP message
pub const ALP_BLOCK_SIZE: usize = 512;

const ALPSRV_UPDATE: u8 = 0xFF;
const ALPSRV_HEADER_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Header at the start of an ALP file
pub struct LegacyAidingHeader {
    /// Always [`ALP_MAGIC`]
    pub magic: u32,
    /// Offsets of the sections of the file
    pub offsets: [u16; 32],
    /// Size of the file in bytes
    pub size: u32,
    /// Non-zero once the file was completely stored
    pub completed: u32,
    /// Time of week the data is valid from
    pub tow: u32,
    /// Week number the data is valid from
    pub wno: u16,
    /// Validity, in days
    pub duration: u16,
}

impl LegacyAidingHeader {
    /// Decode the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ALP_HEADER_LEN {
            return Err(MgaError::BadData);
        }
        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let magic = u32_at(0);
        if magic != ALP_MAGIC {
            log::warn!("Not an ALP file, magic is {magic:#010X}");
            return Err(MgaError::BadData);
        }
        let mut offsets = [0u16; 32];
        for (i, o) in offsets.iter_mut().enumerate() {
            *o = u16_at(4 + 2 * i);
        }
        Ok(Self {
            magic,
            offsets,
            size: u32_at(68),
            completed: u32_at(72),
            tow: u32_at(76),
            wno: u16_at(80),
            duration: u16_at(82),
        })
    }

    /// Encode the header.
    pub fn encode(&self) -> [u8; ALP_HEADER_LEN] {
        let mut out = [0u8; ALP_HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        for (i, o) in self.offsets.iter().enumerate() {
            out[4 + 2 * i..6 + 2 * i].copy_from_slice(&o.to_le_bytes());
        }
        out[68..72].copy_from_slice(&self.size.to_le_bytes());
        out[72..76].copy_from_slice(&self.completed.to_le_bytes());
        out[76..80].copy_from_slice(&self.tow.to_le_bytes());
        out[80..82].copy_from_slice(&self.wno.to_le_bytes());
        out[82..84].copy_from_slice(&self.duration.to_le_bytes());
        out
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
/// Phase of a legacy flash transfer
pub enum LegacyAidingState {
    #[default]
    /// No legacy flash transfer
    Idle,
    /// Resetting the receiver's ALP store
    Starting,
    /// Streaming blocks
    MainSeq,
    /// Closing the transfer
    Stopping,
}

/// UBX-AID-ALP with a single zero byte, which ends (or resets) an ALP transfer.
pub fn alp_stop_frame() -> Vec<u8> {
    ubx::fixed_frame(class::AID, aid::ALP, &[0x00])
}

/// UBX-CFG-MSG setting the rate of UBX-AID-ALPSRV on the current port.
pub fn alpsrv_rate_frame(enable: bool) -> Vec<u8> {
    ubx::fixed_frame(class::CFG, cfg::MSG, &[class::AID, aid::ALPSRV, enable as u8])
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AlpReply {
    Ack,
    Nak,
}

fn alp_reply(frame: &Frame) -> Option<AlpReply> {
    match (frame.kind()?, frame.payload()) {
        (MsgKind::AidAlp, [1]) => Some(AlpReply::Ack),
        (MsgKind::AidAlp, [0]) => Some(AlpReply::Nak),
        _ => None,
    }
}

/// Push of an ALP file into the receiver's flash with UBX-AID-ALP
pub(crate) struct LegacyFlashTransfer {
    data: Vec<u8>,
    header: LegacyAidingHeader,
    blocks: Vec<FlashBlock>,
    current: usize,
    state: LegacyAidingState,
    retries: u32,
    deadline: u64,
}

impl LegacyFlashTransfer {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let header = LegacyAidingHeader::parse(&data)?;
        let mut blocks = Vec::new();
        blocks.try_reserve_exact(data.len() / ALP_BLOCK_SIZE + 1)?;
        for (sequence, (offset, len)) in block_spans(data.len(), ALP_BLOCK_SIZE).enumerate() {
            blocks.push(FlashBlock {
                payload: FlashPayload::Data { offset, len },
                sequence: sequence as u16,
                state: MsgState::WaitingToSend,
                retries: 0,
                deadline: 0,
            });
        }
        Ok(Self {
            data,
            header,
            blocks,
            current: 0,
            state: LegacyAidingState::Idle,
            retries: 0,
            deadline: 0,
        })
    }

    pub fn state(&self) -> LegacyAidingState {
        self.state
    }

    fn emit(link: &mut Link, event: LegacyAidingEvent) {
        link.emit(ProgressEvent::Legacy(event));
    }

    fn send_stop(&mut self, link: &mut Link) {
        link.send(&alp_stop_frame());
        self.deadline = link.deadline();
    }

    fn send_block(&mut self, link: &mut Link) {
        let block = &mut self.blocks[self.current];
        if let FlashPayload::Data { offset, len } = block.payload {
            match ubx::build_frame(class::AID, aid::ALP, &self.data[offset..offset + len]) {
                Ok(frame) => link.send(&frame),
                Err(e) => log::error!("Cannot frame ALP block {}: {e}", block.sequence),
            }
        }
        block.state = MsgState::WaitingForAck;
        block.deadline = link.deadline();
        log::debug!("ALP block {} sent (retry {})", block.sequence, block.retries);
        Self::emit(link, LegacyAidingEvent::FlashBlockSent(block.report()));
    }

    fn enter(&mut self, state: LegacyAidingState, link: &mut Link) {
        log::debug!("Legacy flash transfer {:?} -> {state:?}", self.state);
        self.state = state;
        self.retries = 0;
        match state {
            LegacyAidingState::Starting => {
                Self::emit(link, LegacyAidingEvent::StartupStarted);
                self.send_stop(link);
            }
            LegacyAidingState::MainSeq => {
                Self::emit(link, LegacyAidingEvent::StartupCompleted);
                self.send_block(link);
            }
            LegacyAidingState::Stopping => {
                Self::emit(link, LegacyAidingEvent::FinalizeStarted);
                self.send_stop(link);
            }
            LegacyAidingState::Idle => {}
        }
    }

    pub fn start(&mut self, link: &mut Link) -> Step {
        log::info!("Starting legacy flash transfer of {} bytes", self.data.len());
        link.emit(ProgressEvent::Start {
            messages: self.blocks.len(),
        });
        self.enter(LegacyAidingState::Starting, link);
        Step::Running
    }

    fn finalize(&mut self, link: &mut Link) -> Step {
        self.header.size = self.data.len() as u32;
        self.header.completed = 1;
        self.state = LegacyAidingState::Idle;
        log::info!("Legacy flash transfer complete");
        Self::emit(link, LegacyAidingEvent::FinalizeCompleted(self.header.clone()));
        Step::Finished
    }

    pub fn on_message(&mut self, frame: &Frame, link: &mut Link) -> Option<Step> {
        let reply = alp_reply(frame)?;
        let step = match (self.state, reply) {
            // a reset is answered with a nak by some firmware
            (LegacyAidingState::Starting, _) => {
                self.enter(LegacyAidingState::MainSeq, link);
                Step::Running
            }
            (LegacyAidingState::MainSeq, AlpReply::Ack) => {
                let block = &mut self.blocks[self.current];
                block.state = MsgState::Received;
                Self::emit(link, LegacyAidingEvent::FlashBlockComplete(block.report()));
                self.current += 1;
                if self.current < self.blocks.len() {
                    self.send_block(link);
                } else {
                    self.enter(LegacyAidingState::Stopping, link);
                }
                Step::Running
            }
            (LegacyAidingState::MainSeq, AlpReply::Nak) => {
                let block = &mut self.blocks[self.current];
                Self::emit(link, LegacyAidingEvent::FlashBlockFailed(block.report()));
                if block.retries >= link.cfg.msg_retry_count {
                    log::warn!("ALP block {} refused too often", block.sequence);
                    block.state = MsgState::Failed;
                    return Some(Step::Terminated(TerminateReason::ReceiverNak));
                }
                block.retries += 1;
                self.send_block(link);
                Step::Running
            }
            (LegacyAidingState::Stopping, AlpReply::Ack) => self.finalize(link),
            (LegacyAidingState::Stopping, AlpReply::Nak) => {
                Self::emit(link, LegacyAidingEvent::FinalizeFailed);
                Step::Terminated(TerminateReason::ReceiverNak)
            }
            (LegacyAidingState::Idle, _) => return None,
        };
        Some(step)
    }

    fn stop_timed_out(&mut self, link: &mut Link, failed: LegacyAidingEvent) -> Step {
        if self.retries < link.cfg.msg_retry_count {
            self.retries += 1;
            log::warn!("No ALP reply in {:?}, resending", self.state);
            self.send_stop(link);
            Step::Running
        } else {
            Self::emit(link, failed);
            Step::Terminated(TerminateReason::ReceiverNotResponding)
        }
    }

    pub fn check_timeouts(&mut self, link: &mut Link) -> Step {
        match self.state {
            LegacyAidingState::Starting if link.now >= self.deadline => {
                self.stop_timed_out(link, LegacyAidingEvent::StartupFailed)
            }
            LegacyAidingState::Stopping if link.now >= self.deadline => {
                self.stop_timed_out(link, LegacyAidingEvent::FinalizeFailed)
            }
            LegacyAidingState::MainSeq => {
                let block = &mut self.blocks[self.current];
                if link.now < block.deadline {
                    return Step::Running;
                }
                match block.state {
                    MsgState::WaitingForAck => {
                        log::warn!("No ALP ack for block {}, nudging the receiver", block.sequence);
                        link.send(&[0x00]);
                        block.state = MsgState::WaitingForAckSecondChance;
                        block.deadline = link.deadline();
                        Step::Running
                    }
                    MsgState::WaitingForAckSecondChance if block.retries < link.cfg.msg_retry_count => {
                        block.retries += 1;
                        block.state = MsgState::WaitingForResend;
                        self.send_block(link);
                        Step::Running
                    }
                    MsgState::WaitingForAckSecondChance => {
                        block.state = MsgState::Failed;
                        log::warn!("Receiver stopped answering during legacy flash transfer");
                        Step::Terminated(TerminateReason::ReceiverNotResponding)
                    }
                    _ => Step::Running,
                }
            }
            _ => Step::Running,
        }
    }
}

fn u16_at(p: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([p[i], p[i + 1]])
}

/// Serves slices of an ALP file to a receiver asking for them with UBX-AID-ALPSRV
pub(crate) struct AidingServer {
    data: Vec<u8>,
    file_id: u16,
}

impl AidingServer {
    pub fn new(data: Vec<u8>, file_id: u16) -> Result<Self> {
        LegacyAidingHeader::parse(&data)?;
        Ok(Self { data, file_id })
    }

    pub fn file_id(&self) -> u16 {
        self.file_id
    }

    pub fn start(&mut self, link: &mut Link) -> Step {
        log::info!(
            "Serving {} bytes of ALP data with file id {:#06X}",
            self.data.len(),
            self.file_id
        );
        link.send(&alpsrv_rate_frame(true));
        link.emit(ProgressEvent::Legacy(LegacyAidingEvent::ServerStarted {
            file_id: self.file_id,
        }));
        Step::Running
    }

    /// Switch off the requests and hand back the (possibly updated) data.
    pub fn stop(self, link: &mut Link) -> Vec<u8> {
        link.send(&alpsrv_rate_frame(false));
        link.emit(ProgressEvent::Legacy(LegacyAidingEvent::ServerStopped));
        log::info!("ALP server stopped");
        self.data
    }

    pub fn on_message(&mut self, frame: &Frame, link: &mut Link) -> Option<Step> {
        if frame.kind()? != MsgKind::AidAlpsrv {
            return None;
        }
        let p = frame.payload();
        if p.len() < ALPSRV_HEADER_LEN {
            log::warn!("Short UBX-AID-ALPSRV of {} bytes", p.len());
            return None;
        }
        if p[1] == ALPSRV_UPDATE {
            self.update(p, link);
        } else {
            self.respond(p, link);
        }
        Some(Step::Running)
    }

    fn respond(&mut self, p: &[u8], link: &mut Link) {
        let offset = u16_at(p, 2) as usize * 2;
        let size = u16_at(p, 4) as usize * 2;
        link.emit(ProgressEvent::Legacy(LegacyAidingEvent::RequestReceived { offset, size }));
        let id_size = (p[0] as usize).clamp(ALPSRV_HEADER_LEN, p.len());
        // the echoed header and the data share one UBX payload
        let room = ubx::MAX_PAYLOAD - id_size;
        let start = offset.min(self.data.len());
        let end = (offset + size.min(room)).min(self.data.len());
        let served = end - start;

        let mut payload = Vec::with_capacity(id_size + served);
        payload.extend_from_slice(&p[..id_size]);
        payload[6..8].copy_from_slice(&self.file_id.to_le_bytes());
        // served <= room < 0x10000
        payload[8..10].copy_from_slice(&(served as u16).to_le_bytes());
        payload.extend_from_slice(&self.data[start..end]);
        log::debug!("ALP request for {size} bytes at {offset}, sending {served}");
        match ubx::build_frame(class::AID, aid::ALPSRV, &payload) {
            Ok(frame) => link.send(&frame),
            Err(e) => {
                log::error!("Cannot answer ALP request at {offset}: {e}");
                return;
            }
        }
        link.emit(ProgressEvent::Legacy(LegacyAidingEvent::RequestCompleted {
            offset,
            size: served,
        }));
    }

    fn update(&mut self, p: &[u8], link: &mut Link) {
        let offset = u16_at(p, 2) as usize * 2;
        let size = u16_at(p, 4) as usize * 2;
        let file_id = u16_at(p, 6);
        if file_id != self.file_id {
            log::warn!(
                "Ignoring ALP update for file id {file_id:#06X}, serving {:#06X}",
                self.file_id
            );
            link.emit(ProgressEvent::Legacy(LegacyAidingEvent::RequestFailedIdMismatch {
                file_id,
            }));
            return;
        }
        link.emit(ProgressEvent::Legacy(LegacyAidingEvent::UpdateReceived { offset, size }));
        let src = &p[8..];
        let start = offset.min(self.data.len());
        let end = (offset + size.min(src.len())).min(self.data.len());
        self.data[start..end].copy_from_slice(&src[..end - start]);
        link.emit(ProgressEvent::Legacy(LegacyAidingEvent::UpdateCompleted {
            offset,
            size: end - start,
        }));
    }
}
