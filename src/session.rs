//! The session handle through which a host drives every transfer.
//!
//! All entry points take `&self` and serialize on one mutex. The write
//! callback runs with that mutex held and must not call back into the
//! session. Progress events are collected while the mutex is held and
//! handed to the progress callback after it is released, in order, so the
//! progress callback may use the session freely.
use std::{
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    database::validate_database,
    error::{MgaError, Result, ServiceErrorKind, TerminateReason},
    event::ProgressEvent,
    flash::{erase_frames, FlashTransfer},
    flow::{FlowConfig, Link, MgaTransfer, Step},
    ini::{adjust_ini_time, prepend_ini, PosAdjust, TimeAdjust},
    legacy::{AidingServer, LegacyAidingState, LegacyFlashTransfer},
    msglist::MsgState,
    ubx::{self, Frame},
};

/// Largest assistance blob a session accepts
pub const MAX_BLOB_SIZE: usize = 1_000_000;

/// Monotonic millisecond clock of the host
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed point
    fn now_ms(&self) -> u64;
    /// Wait between messages sent without flow control
    fn delay_ms(&self, _ms: u32) {}
}

#[derive(Debug, Clone)]
/// [`Clock`] backed by [`Instant`]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Sends bytes to the receiver
pub type WriteFn = Box<dyn FnMut(&[u8]) -> io::Result<()> + Send>;
/// Receives progress events
pub type ProgressFn = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Host services used by a session
pub struct Callbacks {
    write: WriteFn,
    progress: Option<ProgressFn>,
    clock: Arc<dyn Clock>,
}

impl Callbacks {
    /// Callbacks writing through `write`, using the [`SystemClock`] and no progress reporting.
    pub fn new<W>(write: W) -> Self
    where
        W: FnMut(&[u8]) -> io::Result<()> + Send + 'static,
    {
        Self {
            write: Box::new(write),
            progress: None,
            clock: Arc::new(SystemClock::default()),
        }
    }

    /// Report progress to `progress`.
    pub fn with_progress<P>(mut self, progress: P) -> Self
    where
        P: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Use `clock` for deadlines and pacing.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
/// State of a session
pub enum LibState {
    #[default]
    /// No session started
    Idle,
    /// Started, waiting for data to transfer
    ActiveWaitingForData,
    /// A transfer is in progress
    ActiveProcessingData,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// What happened to a message handed to [`MgaSession::process_receiver_message`]
pub enum Disposition {
    /// The message moved the transfer along
    Consumed,
    /// The message was of no interest to the transfer
    Ignored,
}

#[derive(Default)]
enum Job {
    #[default]
    None,
    Mga(MgaTransfer),
    Flash(FlashTransfer),
    LegacyFlash(LegacyFlashTransfer),
    LegacyServer(AidingServer),
}

impl Job {
    fn start(&mut self, link: &mut Link) -> Step {
        match self {
            Job::None => Step::Finished,
            Job::Mga(xfer) => xfer.start(link),
            Job::Flash(xfer) => xfer.start(link),
            Job::LegacyFlash(xfer) => xfer.start(link),
            Job::LegacyServer(server) => server.start(link),
        }
    }

    fn on_message(&mut self, frame: &Frame, link: &mut Link) -> Option<Step> {
        match self {
            Job::None => None,
            Job::Mga(xfer) => xfer.on_message(frame, link),
            Job::Flash(xfer) => xfer.on_message(frame, link),
            Job::LegacyFlash(xfer) => xfer.on_message(frame, link),
            Job::LegacyServer(server) => server.on_message(frame, link),
        }
    }

    fn check_timeouts(&mut self, link: &mut Link) -> Step {
        match self {
            Job::None | Job::LegacyServer(_) => Step::Running,
            Job::Mga(xfer) => xfer.check_timeouts(link),
            Job::Flash(xfer) => xfer.check_timeouts(link),
            Job::LegacyFlash(xfer) => xfer.check_timeouts(link),
        }
    }

    fn summarize(&self) {
        match self {
            Job::Mga(xfer) => {
                let queue = xfer.queue();
                let failed = queue
                    .messages()
                    .iter()
                    .filter(|m| m.state == MsgState::Failed)
                    .count();
                log::info!(
                    "{} of {} messages sent, {} resolved, {failed} failed",
                    queue.sent(),
                    queue.messages().len(),
                    queue.resolved()
                );
            }
            Job::Flash(xfer) => {
                let done = xfer
                    .blocks()
                    .iter()
                    .filter(|b| b.state == MsgState::Received)
                    .count();
                log::info!("{done} of {} flash messages acknowledged", xfer.blocks().len());
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct SessionInner {
    state: LibState,
    flow: Option<FlowConfig>,
    callbacks: Option<Callbacks>,
    job: Job,
}

impl SessionInner {
    fn drive<R>(&mut self, events: &mut Vec<ProgressEvent>, f: impl FnOnce(&mut Job, &mut Link) -> R) -> Result<R> {
        let cfg = self.flow.as_ref().ok_or(MgaError::NotConfigured)?;
        let callbacks = self.callbacks.as_mut().ok_or(MgaError::NotConfigured)?;
        let mut link = Link {
            write: &mut *callbacks.write,
            clock: &*callbacks.clock,
            now: callbacks.clock.now_ms(),
            cfg,
            events,
        };
        Ok(f(&mut self.job, &mut link))
    }

    fn settle(&mut self, step: Step, events: &mut Vec<ProgressEvent>) {
        let event = match step {
            Step::Running => return,
            Step::Finished => {
                log::info!("Transfer finished");
                ProgressEvent::Finish
            }
            Step::Terminated(reason) => {
                log::warn!("Transfer terminated: {reason:?}");
                ProgressEvent::Terminated(reason)
            }
        };
        self.job.summarize();
        events.push(event);
        self.job = Job::None;
        self.state = LibState::Idle;
    }

    fn require_waiting(&self) -> Result<()> {
        match self.state {
            LibState::Idle => Err(MgaError::AlreadyIdle),
            LibState::ActiveProcessingData => Err(MgaError::AlreadyRunning),
            LibState::ActiveWaitingForData => Ok(()),
        }
    }

    fn progress(&self) -> Option<ProgressFn> {
        self.callbacks.as_ref().and_then(|c| c.progress.clone())
    }
}

fn check_blob(data: &[u8]) -> Result<()> {
    if data.len() > MAX_BLOB_SIZE {
        log::warn!("Blob of {} bytes exceeds {MAX_BLOB_SIZE} bytes", data.len());
        return Err(MgaError::BadData);
    }
    Ok(())
}

/// A single assistance session
pub struct MgaSession {
    inner: Mutex<SessionInner>,
}

impl Default for MgaSession {
    fn default() -> Self {
        Self::init()
    }
}

impl MgaSession {
    /// Create an idle, unconfigured session.
    pub fn init() -> Self {
        Self {
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Stop any transfer in progress and release the session.
    pub fn deinit(self) {
        match self.session_stop() {
            Ok(()) | Err(MgaError::AlreadyIdle) => {}
            Err(e) => log::warn!("Could not stop session: {e}"),
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&mut SessionInner, &mut Vec<ProgressEvent>) -> Result<R>) -> Result<R> {
        let mut events = Vec::new();
        let (result, progress) = {
            let mut inner = self.inner.lock().map_err(|_| MgaError::LockPoisoned)?;
            let result = f(&mut *inner, &mut events);
            (result, inner.progress())
        };
        if let Some(progress) = progress {
            for event in &events {
                progress(event);
            }
        }
        result
    }

    /// Set the transfer settings and host callbacks. Only allowed while idle.
    pub fn configure(&self, flow: FlowConfig, callbacks: Callbacks) -> Result<()> {
        self.locked(|inner, _| {
            if inner.state != LibState::Idle {
                return Err(MgaError::AlreadyRunning);
            }
            log::debug!("Session configured: {flow:?}");
            inner.flow = Some(flow);
            inner.callbacks = Some(callbacks);
            Ok(())
        })
    }

    /// Start a session, after which one transfer can be started.
    pub fn session_start(&self) -> Result<()> {
        self.locked(|inner, _| {
            if inner.state != LibState::Idle {
                return Err(MgaError::AlreadyRunning);
            }
            if inner.flow.is_none() || inner.callbacks.is_none() {
                return Err(MgaError::NotConfigured);
            }
            inner.state = LibState::ActiveWaitingForData;
            log::info!("Session started");
            Ok(())
        })
    }

    /// Abandon the session and any transfer in progress.
    ///
    /// Reports [`TerminateReason::HostCancel`].
    pub fn session_stop(&self) -> Result<()> {
        self.locked(|inner, events| {
            if inner.state == LibState::Idle {
                return Err(MgaError::AlreadyIdle);
            }
            if let Job::LegacyServer(server) = std::mem::take(&mut inner.job) {
                inner.drive(events, |_, link| server.stop(link))?;
            }
            log::info!("Session stopped by host");
            events.push(ProgressEvent::Terminated(TerminateReason::HostCancel));
            inner.state = LibState::Idle;
            Ok(())
        })
    }

    fn start_job(&self, make: impl FnOnce(&FlowConfig) -> Result<Job>) -> Result<()> {
        self.locked(|inner, events| {
            inner.require_waiting()?;
            let cfg = inner.flow.as_ref().ok_or(MgaError::NotConfigured)?;
            inner.job = make(cfg)?;
            inner.state = LibState::ActiveProcessingData;
            let step = inner.drive(events, |job, link| job.start(link))?;
            inner.settle(step, events);
            Ok(())
        })
    }

    /// Transfer AssistNow Online data.
    ///
    /// With a time adjustment, the data must start with a UBX-MGA-INI-TIME
    /// or UBX-AID-INI message, which is updated before sending.
    pub fn session_send_online_data(&self, data: Vec<u8>, time_adjust: Option<&TimeAdjust>) -> Result<()> {
        self.start_job(|cfg| {
            check_blob(&data)?;
            let mut data = data;
            if let Some(time) = time_adjust {
                adjust_ini_time(&mut data, time)?;
            }
            Ok(Job::Mga(MgaTransfer::new(data, cfg)?))
        })
    }

    /// Transfer AssistNow Offline data preceded by the given time, and position if known.
    pub fn session_send_offline_data(
        &self,
        data: Vec<u8>,
        time_adjust: &TimeAdjust,
        pos_adjust: Option<&PosAdjust>,
    ) -> Result<()> {
        self.start_job(|cfg| {
            check_blob(&data)?;
            let data = prepend_ini(&data, time_adjust, pos_adjust)?;
            Ok(Job::Mga(MgaTransfer::new(data, cfg)?))
        })
    }

    /// Store the UBX-MGA-ANO messages of AssistNow Offline data in the receiver's flash.
    pub fn session_send_offline_to_flash(&self, data: Vec<u8>) -> Result<()> {
        self.start_job(|_| {
            check_blob(&data)?;
            Ok(Job::Flash(FlashTransfer::new(&data)?))
        })
    }

    /// Store a legacy ALP file in the receiver's flash.
    pub fn session_send_legacy_offline_to_flash(&self, data: Vec<u8>) -> Result<()> {
        self.start_job(|_| {
            check_blob(&data)?;
            Ok(Job::LegacyFlash(LegacyFlashTransfer::new(data)?))
        })
    }

    /// Restore a navigation database snapshot.
    pub fn session_send_database(&self, data: Vec<u8>) -> Result<()> {
        self.start_job(|cfg| {
            check_blob(&data)?;
            validate_database(&data)?;
            Ok(Job::Mga(MgaTransfer::new(data, cfg)?))
        })
    }

    /// Serve a legacy ALP file to a receiver that requests it slice by slice.
    ///
    /// Returns the file id stamped into the responses.
    pub fn start_legacy_aiding(&self, data: Vec<u8>) -> Result<u16> {
        let mut file_id = 0;
        self.start_job(|_| {
            check_blob(&data)?;
            let server = AidingServer::new(data, rand::random())?;
            file_id = server.file_id();
            Ok(Job::LegacyServer(server))
        })?;
        Ok(file_id)
    }

    /// Stop serving ALP data and get the file back, including any updates
    /// the receiver made to it.
    pub fn stop_legacy_aiding(&self) -> Result<Vec<u8>> {
        self.locked(|inner, events| {
            if inner.state == LibState::Idle {
                return Err(MgaError::AlreadyIdle);
            }
            match std::mem::take(&mut inner.job) {
                Job::LegacyServer(server) => {
                    let data = inner.drive(events, |_, link| server.stop(link))?;
                    inner.state = LibState::Idle;
                    Ok(data)
                }
                other => {
                    inner.job = other;
                    Err(MgaError::InvalidArgument("no legacy aiding server running"))
                }
            }
        })
    }

    /// Hand a complete UBX frame received from the receiver to the session.
    pub fn process_receiver_message(&self, bytes: &[u8]) -> Result<Disposition> {
        self.locked(|inner, events| {
            if inner.state != LibState::ActiveProcessingData {
                return Ok(Disposition::Ignored);
            }
            let Some(frame) = ubx::parse_frame(bytes) else {
                log::trace!("Ignoring {} bytes that are not a valid UBX frame", bytes.len());
                return Ok(Disposition::Ignored);
            };
            match inner.drive(events, |job, link| job.on_message(&frame, link))? {
                Some(step) => {
                    inner.settle(step, events);
                    Ok(Disposition::Consumed)
                }
                None => Ok(Disposition::Ignored),
            }
        })
    }

    /// Resend or give up on messages whose acknowledgement is overdue.
    /// Call this periodically while a transfer is in progress.
    pub fn check_for_timeouts(&self) -> Result<()> {
        self.locked(|inner, events| {
            if inner.state != LibState::ActiveProcessingData {
                return Ok(());
            }
            let step = inner.drive(events, |job, link| job.check_timeouts(link))?;
            inner.settle(step, events);
            Ok(())
        })
    }

    /// Erase the offline data stored in the receiver's flash.
    pub fn erase_offline_flash(&self) -> Result<()> {
        self.locked(|inner, events| {
            if inner.state == LibState::ActiveProcessingData {
                return Err(MgaError::AlreadyRunning);
            }
            log::info!("Erasing offline data in flash");
            inner.drive(events, |_, link| link.send(&erase_frames()))
        })
    }

    /// Report a failure of the host's HTTP layer through the progress callback.
    pub fn notify_service_error(&self, kind: ServiceErrorKind, detail: impl Into<String>) -> Result<()> {
        let detail = detail.into();
        log::warn!("Assistance service error {kind:?}: {detail}");
        self.locked(|_, events| {
            events.push(ProgressEvent::ServiceError { kind, detail });
            Ok(())
        })
    }

    /// Current session state.
    pub fn state(&self) -> Result<LibState> {
        self.locked(|inner, _| Ok(inner.state))
    }

    /// Phase of the legacy flash transfer, [`LegacyAidingState::Idle`] if there is none.
    pub fn legacy_state(&self) -> Result<LegacyAidingState> {
        self.locked(|inner, _| {
            Ok(match &inner.job {
                Job::LegacyFlash(xfer) => xfer.state(),
                _ => LegacyAidingState::Idle,
            })
        })
    }
}
