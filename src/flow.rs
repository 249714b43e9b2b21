//! Flow control and the MGA message transfer engine.
use std::io;

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};

use crate::{
    error::{FailureReason, Result, TerminateReason},
    event::{MsgReport, ProgressEvent},
    msglist::{build_message_list, MgaMessage, MsgState},
    session::Clock,
    ubx::{self, class, Frame, MsgKind},
};

/// Key of CFG-NAVSPG-ACKAIDING
pub const CFG_NAVSPG_ACKAIDING: u32 = 0x1011_0025;
/// Serial receive buffer of the receiver, in bytes
pub const DEFAULT_SMART_BUDGET: usize = 1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// How messages are paced towards the receiver
pub enum FlowControl {
    /// One message at a time, each waiting for its acknowledgement
    Simple,
    /// Everything at once, acknowledgements ignored
    None,
    /// As many messages as fit in the receiver's input buffer
    Smart,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Message used to switch on acknowledgement of aiding messages
pub enum AckConfig {
    /// UBX-CFG-NAVX5, older receivers
    Navx5,
    /// UBX-CFG-VALSET, generation 9 and later
    Valset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Transfer settings of a session
pub struct FlowConfig {
    /// Time to wait for an acknowledgement
    pub msg_timeout_ms: u32,
    /// Resends before a message is given up
    pub msg_retry_count: u32,
    /// Flow control discipline
    pub flow_control: FlowControl,
    /// How acknowledgements are switched on
    pub ack_config: AckConfig,
    /// Unacknowledged bytes allowed in flight with [`FlowControl::Smart`]
    pub smart_budget: usize,
    /// Delay between messages with [`FlowControl::None`]
    pub pacing_ms: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            msg_timeout_ms: 2000,
            msg_retry_count: 3,
            flow_control: FlowControl::Smart,
            ack_config: AckConfig::Navx5,
            smart_budget: DEFAULT_SMART_BUDGET,
            pacing_ms: 0,
        }
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
/// UBX-CFG-NAVX5 `mask1`
pub struct Navx5Mask1 {
    #[bits(2)]
    _r0: u8,
    /// Apply min/max satellite settings
    pub min_max: bool,
    /// Apply minimum C/N0 setting
    pub min_cno: bool,
    #[bits(2)]
    _r1: u8,
    /// Apply initial 3D fix setting
    pub initial_3d_fix: bool,
    #[bits(2)]
    _r2: u8,
    /// Apply week number rollover setting
    pub wkn_roll: bool,
    /// Apply aiding acknowledgement setting
    pub ack_aid: bool,
    #[bits(2)]
    _r3: u8,
    /// Apply PPP setting
    pub ppp: bool,
    /// Apply AssistNow Autonomous setting
    pub aop: bool,
    #[bits(1)]
    _r4: u8,
}

/// Frame that tells the receiver to acknowledge every aiding message.
pub fn ack_config_frame(cfg: AckConfig) -> Vec<u8> {
    match cfg {
        AckConfig::Navx5 => {
            let mut payload = [0u8; 40];
            let mask1 = Navx5Mask1::new().with_ack_aid(true);
            payload[2..4].copy_from_slice(&mask1.into_bits().to_le_bytes());
            payload[17] = 1;
            ubx::fixed_frame(class::CFG, ubx::cfg::NAVX5, &payload)
        }
        AckConfig::Valset => {
            let mut payload = [0u8; 9];
            // version 0, RAM layer
            payload[1] = 0x01;
            payload[4..8].copy_from_slice(&CFG_NAVSPG_ACKAIDING.to_le_bytes());
            payload[8] = 1;
            ubx::fixed_frame(class::CFG, ubx::cfg::VALSET, &payload)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where a transfer stands after handling an input
pub(crate) enum Step {
    Running,
    Finished,
    Terminated(TerminateReason),
}

/// Everything an engine needs to talk to the host while handling one input.
pub(crate) struct Link<'a> {
    pub write: &'a mut dyn FnMut(&[u8]) -> io::Result<()>,
    pub clock: &'a dyn Clock,
    pub now: u64,
    pub cfg: &'a FlowConfig,
    pub events: &'a mut Vec<ProgressEvent>,
}

impl Link<'_> {
    pub fn send(&mut self, bytes: &[u8]) {
        log::trace!("-> {} bytes", bytes.len());
        if let Err(e) = (self.write)(bytes) {
            log::warn!("Write of {} bytes to the receiver failed: {e}", bytes.len());
        }
    }

    pub fn emit(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }

    pub fn deadline(&self) -> u64 {
        self.now + self.cfg.msg_timeout_ms as u64
    }
}

/// Messages of one transfer and their bookkeeping
pub(crate) struct MsgQueue {
    data: Vec<u8>,
    msgs: Vec<MgaMessage>,
    next: usize,
    sent: usize,
    acked: usize,
}

impl MsgQueue {
    fn new(data: Vec<u8>) -> Result<Self> {
        let msgs = build_message_list(&data)?;
        Ok(Self {
            data,
            msgs,
            next: 0,
            sent: 0,
            acked: 0,
        })
    }

    fn send(&mut self, idx: usize, link: &mut Link) {
        let msg = &mut self.msgs[idx];
        if msg.state == MsgState::WaitingToSend {
            self.sent += 1;
        }
        log::debug!(
            "Sending #{} UBX {:02X}/{:02X} ({} bytes, retry {})",
            msg.sequence,
            msg.class,
            msg.id,
            msg.len,
            msg.retries
        );
        link.send(msg.bytes(&self.data));
        msg.state = MsgState::WaitingForAck;
        msg.deadline = link.deadline();
        link.emit(ProgressEvent::MsgSent(MsgReport::from(&*msg)));
    }

    fn send_next(&mut self, link: &mut Link) -> bool {
        if self.next >= self.msgs.len() {
            return false;
        }
        let idx = self.next;
        self.next += 1;
        self.send(idx, link);
        true
    }

    fn resolve(&mut self, idx: usize, failure: Option<FailureReason>, link: &mut Link) {
        let msg = &mut self.msgs[idx];
        self.acked += 1;
        match failure {
            None => {
                msg.state = MsgState::Received;
                link.emit(ProgressEvent::MsgTransferComplete(MsgReport::from(&*msg)));
            }
            Some(reason) => {
                log::warn!(
                    "Message #{} UBX {:02X}/{:02X} failed: {reason:?}",
                    msg.sequence,
                    msg.class,
                    msg.id
                );
                msg.state = MsgState::Failed;
                msg.failure = Some(reason);
                link.emit(ProgressEvent::MsgTransferFailed(MsgReport::from(&*msg)));
            }
        }
    }

    /// Send the message again, or give up on it once out of retries.
    /// Returns whether it was given up.
    fn retry_or_fail(&mut self, idx: usize, link: &mut Link) -> bool {
        if self.msgs[idx].retries < link.cfg.msg_retry_count {
            let msg = &mut self.msgs[idx];
            msg.state = MsgState::WaitingForResend;
            msg.retries += 1;
            log::warn!("No acknowledgement for message #{}, resending", msg.sequence);
            self.send(idx, link);
            false
        } else {
            self.resolve(idx, Some(FailureReason::TooManyRetries), link);
            true
        }
    }

    fn in_flight(&self) -> usize {
        self.msgs
            .iter()
            .filter(|m| m.state == MsgState::WaitingForAck)
            .map(|m| m.len)
            .sum()
    }

    fn step(&self) -> Step {
        if self.acked == self.msgs.len() {
            Step::Finished
        } else {
            Step::Running
        }
    }

    pub fn messages(&self) -> &[MgaMessage] {
        &self.msgs
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Messages acknowledged or given up on
    pub fn resolved(&self) -> usize {
        self.msgs.iter().filter(|m| m.state.is_done()).count()
    }

    pub fn acked(&self) -> usize {
        self.acked
    }
}

/// What distinguishes one flow control discipline from another.
pub(crate) trait FlowDiscipline: Send {
    /// Whether the receiver must be told to acknowledge messages
    fn needs_acks(&self) -> bool;
    fn on_start(&self, queue: &mut MsgQueue, link: &mut Link) -> Step;
    /// Called after the message at `idx` was resolved by an acknowledgement
    fn on_ack(&self, queue: &mut MsgQueue, link: &mut Link, idx: usize) -> Step;
    /// Called when the acknowledgement of the message at `idx` timed out
    fn on_timeout(&self, queue: &mut MsgQueue, link: &mut Link, idx: usize) -> Step;
}

struct SimpleFlow;

impl FlowDiscipline for SimpleFlow {
    fn needs_acks(&self) -> bool {
        true
    }

    fn on_start(&self, queue: &mut MsgQueue, link: &mut Link) -> Step {
        queue.send_next(link);
        queue.step()
    }

    fn on_ack(&self, queue: &mut MsgQueue, link: &mut Link, _idx: usize) -> Step {
        queue.send_next(link);
        queue.step()
    }

    fn on_timeout(&self, queue: &mut MsgQueue, link: &mut Link, idx: usize) -> Step {
        if queue.retry_or_fail(idx, link) {
            queue.send_next(link);
        }
        queue.step()
    }
}

struct NoFlow;

impl FlowDiscipline for NoFlow {
    fn needs_acks(&self) -> bool {
        false
    }

    fn on_start(&self, queue: &mut MsgQueue, link: &mut Link) -> Step {
        let mut first = true;
        while queue.next < queue.msgs.len() {
            if !first && link.cfg.pacing_ms > 0 {
                link.clock.delay_ms(link.cfg.pacing_ms);
            }
            first = false;
            let idx = queue.next;
            queue.send_next(link);
            queue.msgs[idx].state = MsgState::Received;
            queue.acked += 1;
        }
        queue.step()
    }

    fn on_ack(&self, queue: &mut MsgQueue, _link: &mut Link, _idx: usize) -> Step {
        queue.step()
    }

    fn on_timeout(&self, queue: &mut MsgQueue, _link: &mut Link, _idx: usize) -> Step {
        queue.step()
    }
}

struct SmartFlow {
    budget: usize,
}

impl SmartFlow {
    fn fill(&self, queue: &mut MsgQueue, link: &mut Link) {
        let mut in_flight = queue.in_flight();
        while let Some(next) = queue.msgs.get(queue.next) {
            // a single message larger than the budget still has to go out
            if in_flight > 0 && in_flight + next.len > self.budget {
                break;
            }
            in_flight += next.len;
            queue.send_next(link);
        }
    }
}

impl FlowDiscipline for SmartFlow {
    fn needs_acks(&self) -> bool {
        true
    }

    fn on_start(&self, queue: &mut MsgQueue, link: &mut Link) -> Step {
        self.fill(queue, link);
        queue.step()
    }

    fn on_ack(&self, queue: &mut MsgQueue, link: &mut Link, _idx: usize) -> Step {
        self.fill(queue, link);
        queue.step()
    }

    fn on_timeout(&self, queue: &mut MsgQueue, link: &mut Link, idx: usize) -> Step {
        if queue.retry_or_fail(idx, link) {
            self.fill(queue, link);
        }
        queue.step()
    }
}

fn discipline(cfg: &FlowConfig) -> Box<dyn FlowDiscipline> {
    match cfg.flow_control {
        FlowControl::Simple => Box::new(SimpleFlow),
        FlowControl::None => Box::new(NoFlow),
        FlowControl::Smart => Box::new(SmartFlow {
            budget: cfg.smart_budget,
        }),
    }
}

/// Transfer of a list of MGA (or AID) messages with per-message acknowledgement
pub(crate) struct MgaTransfer {
    queue: MsgQueue,
    discipline: Box<dyn FlowDiscipline>,
}

impl MgaTransfer {
    pub fn new(data: Vec<u8>, cfg: &FlowConfig) -> Result<Self> {
        Ok(Self {
            queue: MsgQueue::new(data)?,
            discipline: discipline(cfg),
        })
    }

    pub fn start(&mut self, link: &mut Link) -> Step {
        log::info!(
            "Starting transfer of {} messages ({:?} flow)",
            self.queue.msgs.len(),
            link.cfg.flow_control
        );
        link.emit(ProgressEvent::Start {
            messages: self.queue.msgs.len(),
        });
        if self.discipline.needs_acks() {
            link.send(&ack_config_frame(link.cfg.ack_config));
        }
        self.discipline.on_start(&mut self.queue, link)
    }

    /// Handle a frame from the receiver; `None` if it is not for this transfer.
    pub fn on_message(&mut self, frame: &Frame, link: &mut Link) -> Option<Step> {
        if !self.discipline.needs_acks() {
            return None;
        }
        let payload = frame.payload();
        let (idx, failure) = match frame.kind()? {
            MsgKind::MgaAck if payload.len() >= 8 => {
                let idx = self
                    .queue
                    .msgs
                    .iter()
                    .position(|m| m.matches_ack(payload[3], &payload[4..8]))?;
                let failure = match payload[0] {
                    1 => None,
                    _ => Some(FailureReason::from_info_code(payload[2])),
                };
                (idx, failure)
            }
            kind @ (MsgKind::Ack | MsgKind::Nak) if payload.len() >= 2 && payload[0] == class::AID => {
                let idx = self.queue.msgs.iter().position(|m| {
                    m.state == MsgState::WaitingForAck && m.class == class::AID && m.id == payload[1]
                })?;
                let failure = (kind == MsgKind::Nak).then_some(FailureReason::Rejected);
                (idx, failure)
            }
            _ => return None,
        };
        self.queue.resolve(idx, failure, link);
        Some(self.discipline.on_ack(&mut self.queue, link, idx))
    }

    pub fn check_timeouts(&mut self, link: &mut Link) -> Step {
        let expired: Vec<usize> = self
            .queue
            .msgs
            .iter()
            .enumerate()
            .filter(|(_, m)| m.state == MsgState::WaitingForAck && link.now >= m.deadline)
            .map(|(i, _)| i)
            .collect();
        for idx in expired {
            let step = self.discipline.on_timeout(&mut self.queue, link, idx);
            if step != Step::Running {
                return step;
            }
        }
        self.queue.step()
    }

    pub fn queue(&self) -> &MsgQueue {
        &self.queue
    }
}
