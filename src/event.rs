use serde::{Deserialize, Serialize};

use crate::{
    error::{FailureReason, ServiceErrorKind, TerminateReason},
    legacy::LegacyAidingHeader,
    msglist::MgaMessage,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A message as reported in progress events
pub struct MsgReport {
    /// Position in the blob
    pub sequence: usize,
    /// Message class
    pub class: u8,
    /// Message id
    pub id: u8,
    /// First four payload bytes
    pub payload_head: [u8; 4],
    /// Resends so far
    pub retries: u32,
    /// Why it failed, if it did
    pub failure: Option<FailureReason>,
}

impl From<&MgaMessage> for MsgReport {
    fn from(msg: &MgaMessage) -> Self {
        Self {
            sequence: msg.sequence,
            class: msg.class,
            id: msg.id,
            payload_head: msg.payload_head,
            retries: msg.retries,
            failure: msg.failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A flash block as reported in progress events
pub struct BlockReport {
    /// Sequence number carried in the flash message
    pub sequence: u16,
    /// Bytes of assistance data in the block
    pub len: usize,
    /// Resends so far
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Progress of the legacy (UBX-AID) aiding protocols
pub enum LegacyAidingEvent {
    /// Flash transfer is resetting the receiver's ALP store
    StartupStarted,
    /// The receiver did not answer the reset
    StartupFailed,
    /// The receiver is ready for data
    StartupCompleted,
    /// A block was sent
    FlashBlockSent(BlockReport),
    /// A block was refused and will be sent again
    FlashBlockFailed(BlockReport),
    /// A block was accepted
    FlashBlockComplete(BlockReport),
    /// All blocks are written, closing the transfer
    FinalizeStarted,
    /// The receiver did not accept the end of the transfer
    FinalizeFailed,
    /// The transfer is complete; carries the header as now stored
    FinalizeCompleted(LegacyAidingHeader),
    /// The aiding server is answering requests
    ServerStarted {
        /// File id stamped into every response
        file_id: u16,
    },
    /// The aiding server was stopped
    ServerStopped,
    /// The receiver asked for a slice of the aiding data
    RequestReceived {
        /// Byte offset
        offset: usize,
        /// Byte count
        size: usize,
    },
    /// A slice was sent back
    RequestCompleted {
        /// Byte offset
        offset: usize,
        /// Byte count actually sent
        size: usize,
    },
    /// An update carried a file id other than the one of this session
    RequestFailedIdMismatch {
        /// File id in the update
        file_id: u16,
    },
    /// The receiver sent an update of the aiding data
    UpdateReceived {
        /// Byte offset
        offset: usize,
        /// Byte count
        size: usize,
    },
    /// The update was written into the aiding data
    UpdateCompleted {
        /// Byte offset
        offset: usize,
        /// Byte count actually written
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Events reported through the progress callback
pub enum ProgressEvent {
    /// A transfer has started
    Start {
        /// Number of messages or blocks to transfer
        messages: usize,
    },
    /// A message was written to the receiver
    MsgSent(MsgReport),
    /// A message was acknowledged
    MsgTransferComplete(MsgReport),
    /// A message was refused or never acknowledged
    MsgTransferFailed(MsgReport),
    /// A flash block was written to the receiver
    FlashBlockSent(BlockReport),
    /// A flash block was acknowledged
    FlashBlockComplete(BlockReport),
    /// The receiver asked for a flash block again
    FlashBlockRetry(BlockReport),
    /// The transfer completed
    Finish,
    /// The transfer ended early
    Terminated(TerminateReason),
    /// The host could not fetch assistance data
    ServiceError {
        /// What went wrong
        kind: ServiceErrorKind,
        /// Explanation, e.g. from the server's response body
        detail: String,
    },
    /// Legacy aiding progress
    Legacy(LegacyAidingEvent),
}

impl ProgressEvent {
    /// Whether this event ends the transfer
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Finish | ProgressEvent::Terminated(_))
    }
}
