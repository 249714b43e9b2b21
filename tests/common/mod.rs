#![allow(dead_code)]
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use ublox_mga::{
    ubx::build_frame, Callbacks, Clock, Disposition, FlowConfig, LegacyAidingEvent, MgaSession,
    ProgressEvent,
};

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A session wired to in-memory write and progress sinks
pub struct Harness {
    pub session: MgaSession,
    pub clock: Arc<ManualClock>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl Harness {
    pub fn configured(flow: FlowConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let writes = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = writes.clone();
        let progress = events.clone();
        let callbacks = Callbacks::new(move |bytes: &[u8]| {
            sink.lock().unwrap().push(bytes.to_vec());
            Ok(())
        })
        .with_progress(move |event: &ProgressEvent| progress.lock().unwrap().push(event.clone()))
        .with_clock(clock.clone());
        let session = MgaSession::init();
        session.configure(flow, callbacks).unwrap();
        Self {
            session,
            clock,
            writes,
            events,
        }
    }

    pub fn started(flow: FlowConfig) -> Self {
        let h = Self::configured(flow);
        h.session.session_start().unwrap();
        h
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn last_write(&self) -> Vec<u8> {
        self.writes.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn legacy_events(&self) -> Vec<LegacyAidingEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Legacy(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    pub fn feed(&self, frame: &[u8]) -> Disposition {
        self.session.process_receiver_message(frame).unwrap()
    }

    /// Move the clock and let the session act on expired deadlines
    pub fn advance(&self, ms: u64) {
        self.clock.advance(ms);
        self.session.check_for_timeouts().unwrap();
    }
}

/// UBX-MGA-GPS-EPH for satellite `sv`
pub fn eph(sv: u8) -> Vec<u8> {
    let mut p = vec![0u8; 68];
    p[0] = 0x01;
    p[2] = sv;
    build_frame(0x13, 0x00, &p).unwrap()
}

/// UBX-MGA-GPS-ALM for satellite `sv`
pub fn alm(sv: u8) -> Vec<u8> {
    let mut p = vec![0u8; 36];
    p[0] = 0x02;
    p[2] = sv;
    build_frame(0x13, 0x00, &p).unwrap()
}

/// UBX-MGA-ANO for satellite `sv` on the given day
pub fn ano(sv: u8, year: u8, month: u8, day: u8) -> Vec<u8> {
    let mut p = vec![0u8; 76];
    p[2] = sv;
    p[4] = year;
    p[5] = month;
    p[6] = day;
    build_frame(0x13, 0x20, &p).unwrap()
}

/// UBX-MGA-ACK answering the MGA message `frame`
pub fn mga_ack(frame: &[u8], accepted: bool, info: u8) -> Vec<u8> {
    let mut p = vec![accepted as u8, 0, info, frame[3]];
    p.extend_from_slice(&frame[6..10]);
    build_frame(0x13, 0x60, &p).unwrap()
}

/// UBX-MGA-FLASH-ACK
pub fn flash_ack(ack: u8, sequence: u16) -> Vec<u8> {
    let s = sequence.to_le_bytes();
    build_frame(0x13, 0x21, &[3, 0, ack, 0, s[0], s[1]]).unwrap()
}

pub fn is_frame(bytes: &[u8], class: u8, id: u8) -> bool {
    bytes.len() >= 8 && bytes[..2] == [0xB5, 0x62] && bytes[2] == class && bytes[3] == id
}
