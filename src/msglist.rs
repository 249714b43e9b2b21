use serde::{Deserialize, Serialize};

use crate::{
    error::{FailureReason, MgaError, Result},
    ubx::{self, Frame},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Transfer state of a message or flash block
pub enum MsgState {
    /// Not sent yet
    WaitingToSend,
    /// Sent, acknowledgement pending
    WaitingForAck,
    /// Acknowledgement timed out, about to be sent again
    WaitingForResend,
    /// Acknowledged by the receiver
    Received,
    /// Given up on
    Failed,
    /// Timed out once, receiver was nudged
    WaitingForAckSecondChance,
}

impl MsgState {
    /// Whether the state is terminal
    pub fn is_done(&self) -> bool {
        matches!(self, MsgState::Received | MsgState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One transmittable UBX message of an assistance blob
pub struct MgaMessage {
    /// Offset of the frame in the owned blob
    pub offset: usize,
    /// Length of the whole frame
    pub len: usize,
    /// Message class
    pub class: u8,
    /// Message id
    pub id: u8,
    /// First four payload bytes, echoed by UBX-MGA-ACK
    pub payload_head: [u8; 4],
    /// Position in the blob, starting at 0
    pub sequence: usize,
    /// Transfer state
    pub state: MsgState,
    /// Number of times the message was sent again
    pub retries: u32,
    /// Clock value at which the pending acknowledgement times out
    pub deadline: u64,
    /// Why the transfer failed, when it did
    pub failure: Option<FailureReason>,
}

impl MgaMessage {
    fn from_frame(frame: &Frame, sequence: usize) -> Self {
        let mut payload_head = [0u8; 4];
        let payload = frame.payload();
        let n = payload.len().min(4);
        payload_head[..n].copy_from_slice(&payload[..n]);
        Self {
            offset: frame.offset,
            len: frame.bytes.len(),
            class: frame.header.class,
            id: frame.header.id,
            payload_head,
            sequence,
            state: MsgState::WaitingToSend,
            retries: 0,
            deadline: 0,
            failure: None,
        }
    }

    /// The frame bytes within `data`
    pub fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.offset + self.len]
    }

    /// Whether an MGA-ACK for `msg_id` echoing `head` refers to this message
    pub fn matches_ack(&self, msg_id: u8, head: &[u8]) -> bool {
        self.state == MsgState::WaitingForAck
            && self.class == ubx::class::MGA
            && self.id == msg_id
            && head.len() >= 4
            && self.payload_head == head[..4]
    }
}

fn wanted(frame: &Frame) -> bool {
    if !frame.header.is_of_interest() {
        return false;
    }
    if !frame.checksum_ok() {
        log::warn!(
            "Skipping UBX {:02X}/{:02X} at offset {} with bad checksum",
            frame.header.class,
            frame.header.id,
            frame.offset
        );
        return false;
    }
    true
}

/// Build the ordered list of messages of interest in `data`.
///
/// Frames with a bad checksum and frames the engine does not handle are
/// skipped. Anything between frames is treated as corruption.
pub fn build_message_list(data: &[u8]) -> Result<Vec<MgaMessage>> {
    let mut count = 0;
    for frame in ubx::frames(data) {
        if wanted(&frame?) {
            count += 1;
        }
    }
    if count == 0 {
        return Err(MgaError::NoDataToSend);
    }
    let mut list = Vec::new();
    list.try_reserve_exact(count)?;
    for frame in ubx::frames(data) {
        let frame = frame?;
        if wanted(&frame) {
            list.push(MgaMessage::from_frame(&frame, list.len()));
        }
    }
    log::debug!("{} messages of interest in {} bytes", list.len(), data.len());
    Ok(list)
}
