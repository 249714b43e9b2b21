//! Transfer of AssistNow Offline data into the receiver's flash with UBX-MGA-FLASH.
use crate::{
    error::{MgaError, Result, TerminateReason},
    event::{BlockReport, ProgressEvent},
    flow::{Link, Step},
    msglist::MsgState,
    offline::get_ano_offline_data,
    ubx::{self, class, mga, Frame, MsgKind},
};

/// Largest slice of data carried by one flash message
pub const FLASH_BLOCK_SIZE: usize = 512;
/// Sequence number the receiver acknowledges a stop message with
pub const FLASH_STOP_SEQUENCE: u16 = 0xFFFF;

const TYPE_DATA: u8 = 1;
const TYPE_STOP: u8 = 2;
const TYPE_ACK: u8 = 3;

/// Byte spans of consecutive blocks of at most `size` bytes covering `len` bytes.
pub(crate) fn block_spans(len: usize, size: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..len).step_by(size).map(move |offset| (offset, size.min(len - offset)))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// What a flash record carries
pub enum FlashPayload {
    /// A slice of the data
    Data {
        /// Offset in the data
        offset: usize,
        /// Length of the slice
        len: usize,
    },
    /// End of transfer
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One UBX-MGA-FLASH message of a transfer
pub struct FlashBlock {
    /// Data slice or stop
    pub payload: FlashPayload,
    /// Sequence number, kept across resends
    pub sequence: u16,
    /// Transfer state
    pub state: MsgState,
    /// Number of times the block was sent again
    pub retries: u32,
    /// Clock value at which the pending acknowledgement times out
    pub deadline: u64,
}

impl FlashBlock {
    fn frame(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.payload {
            FlashPayload::Data { offset, len } => flash_data_frame(self.sequence, &data[offset..offset + len]),
            FlashPayload::Stop => Ok(flash_stop_frame()),
        }
    }

    pub(crate) fn report(&self) -> BlockReport {
        let len = match self.payload {
            FlashPayload::Data { len, .. } => len,
            FlashPayload::Stop => 0,
        };
        BlockReport {
            sequence: self.sequence,
            len,
            retries: self.retries,
        }
    }
}

/// UBX-MGA-FLASH-DATA carrying `chunk`.
///
/// The chunk must leave room for the 6 byte record header in a UBX payload.
pub fn flash_data_frame(sequence: u16, chunk: &[u8]) -> Result<Vec<u8>> {
    let size = u16::try_from(chunk.len())
        .map_err(|_| MgaError::InvalidArgument("flash chunk too long"))?;
    let mut payload = Vec::with_capacity(6 + chunk.len());
    payload.extend_from_slice(&[TYPE_DATA, 0]);
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend_from_slice(&size.to_le_bytes());
    payload.extend_from_slice(chunk);
    ubx::build_frame(class::MGA, mga::FLASH, &payload)
}

/// UBX-MGA-FLASH-STOP.
pub fn flash_stop_frame() -> Vec<u8> {
    ubx::fixed_frame(class::MGA, mga::FLASH, &[TYPE_STOP, 0, 0, 0])
}

/// An empty UBX-MGA-FLASH-DATA followed by UBX-MGA-FLASH-STOP, which erases
/// the offline data stored in flash.
pub fn erase_frames() -> Vec<u8> {
    let mut out = ubx::fixed_frame(class::MGA, mga::FLASH, &[TYPE_DATA, 0, 0, 0, 0, 0]);
    out.extend(flash_stop_frame());
    out
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Decoded UBX-MGA-FLASH-ACK
pub struct FlashAck {
    /// 0 accepted, 1 resend, 2 abort
    pub ack: u8,
    /// Sequence number acknowledged
    pub sequence: u16,
}

impl FlashAck {
    /// Decode a UBX-MGA-FLASH-ACK, `None` for any other frame.
    pub fn parse(frame: &Frame) -> Option<Self> {
        let p = frame.payload();
        if frame.kind() != Some(MsgKind::MgaFlash) || p.len() < 6 || p[0] != TYPE_ACK {
            return None;
        }
        Some(Self {
            ack: p[2],
            sequence: u16::from_le_bytes([p[4], p[5]]),
        })
    }
}

/// Block-by-block transfer of offline data into flash
pub(crate) struct FlashTransfer {
    data: Vec<u8>,
    blocks: Vec<FlashBlock>,
    current: usize,
}

impl FlashTransfer {
    pub fn new(data: &[u8]) -> Result<Self> {
        let data = get_ano_offline_data(data)?;
        let mut blocks = Vec::new();
        blocks.try_reserve_exact(data.len() / FLASH_BLOCK_SIZE + 2)?;
        for (sequence, (offset, len)) in block_spans(data.len(), FLASH_BLOCK_SIZE).enumerate() {
            blocks.push(FlashBlock {
                payload: FlashPayload::Data { offset, len },
                sequence: sequence as u16,
                state: MsgState::WaitingToSend,
                retries: 0,
                deadline: 0,
            });
        }
        blocks.push(FlashBlock {
            payload: FlashPayload::Stop,
            sequence: FLASH_STOP_SEQUENCE,
            state: MsgState::WaitingToSend,
            retries: 0,
            deadline: 0,
        });
        log::debug!("{} bytes of offline data in {} flash blocks", data.len(), blocks.len() - 1);
        Ok(Self {
            data,
            blocks,
            current: 0,
        })
    }

    pub fn blocks(&self) -> &[FlashBlock] {
        &self.blocks
    }

    fn send_current(&mut self, link: &mut Link) {
        let block = &mut self.blocks[self.current];
        match block.frame(&self.data) {
            Ok(frame) => link.send(&frame),
            Err(e) => log::error!("Cannot frame flash block {}: {e}", block.sequence),
        }
        block.state = MsgState::WaitingForAck;
        block.deadline = link.deadline();
        match block.payload {
            FlashPayload::Data { .. } => {
                log::debug!("Flash block {} sent (retry {})", block.sequence, block.retries);
                link.emit(ProgressEvent::FlashBlockSent(block.report()));
            }
            FlashPayload::Stop => log::debug!("Flash stop sent"),
        }
    }

    pub fn start(&mut self, link: &mut Link) -> Step {
        log::info!("Starting flash transfer of {} bytes", self.data.len());
        link.emit(ProgressEvent::Start {
            messages: self.blocks.len() - 1,
        });
        self.send_current(link);
        Step::Running
    }

    pub fn on_message(&mut self, frame: &Frame, link: &mut Link) -> Option<Step> {
        let ack = FlashAck::parse(frame)?;
        let block = &mut self.blocks[self.current];
        if !matches!(block.state, MsgState::WaitingForAck | MsgState::WaitingForAckSecondChance) {
            return None;
        }
        match ack.ack {
            0 if ack.sequence == FLASH_STOP_SEQUENCE => {
                // the receiver accepted a stop, whatever block was in flight
                block.state = MsgState::Received;
                log::info!("Flash transfer complete");
                Some(Step::Finished)
            }
            0 if ack.sequence == block.sequence => {
                block.state = MsgState::Received;
                if block.payload == FlashPayload::Stop {
                    log::info!("Flash transfer complete");
                    return Some(Step::Finished);
                }
                link.emit(ProgressEvent::FlashBlockComplete(block.report()));
                self.current += 1;
                self.send_current(link);
                Some(Step::Running)
            }
            0 => {
                log::debug!("Flash ack for sequence {} while waiting for {}", ack.sequence, block.sequence);
                None
            }
            1 => {
                if block.retries >= link.cfg.msg_retry_count {
                    log::warn!("Flash block {} refused too often", block.sequence);
                    block.state = MsgState::Failed;
                    return Some(Step::Terminated(TerminateReason::ReceiverNak));
                }
                block.retries += 1;
                log::warn!("Receiver asked for flash block {} again", block.sequence);
                link.emit(ProgressEvent::FlashBlockRetry(block.report()));
                self.send_current(link);
                Some(Step::Running)
            }
            2 => {
                log::warn!("Receiver aborted the flash transfer at block {}", block.sequence);
                block.state = MsgState::Failed;
                Some(Step::Terminated(TerminateReason::ReceiverNak))
            }
            code => {
                log::warn!("Unknown flash ack code {code} at block {}", block.sequence);
                block.state = MsgState::Failed;
                Some(Step::Terminated(TerminateReason::ProtocolError))
            }
        }
    }

    pub fn check_timeouts(&mut self, link: &mut Link) -> Step {
        let block = &mut self.blocks[self.current];
        if link.now < block.deadline {
            return Step::Running;
        }
        match block.state {
            MsgState::WaitingForAck => {
                log::warn!("No flash ack for block {}, nudging the receiver", block.sequence);
                link.send(&[0x00]);
                block.state = MsgState::WaitingForAckSecondChance;
                block.deadline = link.deadline();
                Step::Running
            }
            MsgState::WaitingForAckSecondChance if block.retries < link.cfg.msg_retry_count => {
                block.retries += 1;
                block.state = MsgState::WaitingForResend;
                log::warn!("Still no flash ack for block {}, resending", block.sequence);
                link.emit(ProgressEvent::FlashBlockRetry(block.report()));
                self.send_current(link);
                Step::Running
            }
            MsgState::WaitingForAckSecondChance => {
                block.state = MsgState::Failed;
                log::warn!("Receiver stopped answering during flash transfer");
                Step::Terminated(TerminateReason::ReceiverNotResponding)
            }
            _ => Step::Running,
        }
    }
}
