mod common;

use chrono::{TimeZone, Utc};
use common::*;
use ublox_mga::{
    ubx::{build_frame, parse_frame},
    Disposition, FailureReason, FlowConfig, FlowControl, LibState, MgaError, PosAdjust,
    ProgressEvent, TerminateReason, TimeAdjust, MAX_BLOB_SIZE,
};

fn simple() -> FlowConfig {
    FlowConfig {
        flow_control: FlowControl::Simple,
        ..Default::default()
    }
}

#[test]
fn simple_flow_one_message_at_a_time() {
    let h = Harness::started(simple());
    let msgs = [eph(1), eph(2), eph(3)];
    h.session.session_send_online_data(msgs.concat(), None).unwrap();
    assert_eq!(h.session.state(), Ok(LibState::ActiveProcessingData));

    let writes = h.writes();
    assert_eq!(writes.len(), 2);
    assert!(is_frame(&writes[0], 0x06, 0x23));
    assert_eq!(writes[1], msgs[0]);

    for (i, msg) in msgs.iter().enumerate() {
        assert_eq!(h.writes().len(), 2 + i);
        assert_eq!(h.feed(&mga_ack(msg, true, 0)), Disposition::Consumed);
    }

    let writes = h.writes();
    assert_eq!(writes.len(), 4);
    assert_eq!(writes[1..], msgs[..]);

    let events = h.events();
    assert_eq!(events.first(), Some(&ProgressEvent::Start { messages: 3 }));
    assert_eq!(events.last(), Some(&ProgressEvent::Finish));
    let complete = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::MsgTransferComplete(_)))
        .count();
    assert_eq!(complete, 3);
    assert_eq!(h.session.state(), Ok(LibState::Idle));
}

#[test]
fn smart_flow_fills_the_budget() {
    let h = Harness::started(FlowConfig {
        smart_budget: 200,
        ..Default::default()
    });
    // 76 bytes each, two fit in 200
    let msgs: Vec<Vec<u8>> = (1..=5).map(eph).collect();
    h.session.session_send_online_data(msgs.concat(), None).unwrap();
    assert_eq!(h.writes().len(), 3);

    h.feed(&mga_ack(&msgs[0], true, 0));
    assert_eq!(h.writes().len(), 4);
    assert_eq!(h.last_write(), msgs[2]);

    for msg in &msgs[1..] {
        h.feed(&mga_ack(msg, true, 0));
    }
    assert_eq!(h.writes().len(), 6);
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
}

#[test]
fn nak_and_stray_acks() {
    let h = Harness::started(simple());
    let msgs = [eph(1), eph(2)];
    h.session.session_send_online_data(msgs.concat(), None).unwrap();

    // ack for a message not yet sent
    assert_eq!(h.feed(&mga_ack(&msgs[1], true, 0)), Disposition::Ignored);
    // something that is not an acknowledgement at all
    assert_eq!(h.feed(&build_frame(0x01, 0x07, &[0; 92]).unwrap()), Disposition::Ignored);
    assert_eq!(h.feed(&[0xB5, 0x62, 0x13]), Disposition::Ignored);

    assert_eq!(h.feed(&mga_ack(&msgs[0], false, 0x01)), Disposition::Consumed);
    h.feed(&mga_ack(&msgs[1], true, 0));

    let failed: Vec<_> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::MsgTransferFailed(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sequence, 0);
    assert_eq!(failed[0].failure, Some(FailureReason::NoTime));
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
}

#[test]
fn unacknowledged_message_is_retried_then_given_up() {
    let h = Harness::started(FlowConfig {
        flow_control: FlowControl::Simple,
        msg_timeout_ms: 2000,
        msg_retry_count: 3,
        ..Default::default()
    });
    let msgs = [eph(1), eph(2)];
    h.session.session_send_online_data(msgs.concat(), None).unwrap();

    h.advance(1999);
    assert_eq!(h.writes().len(), 2);
    for resend in 1..=3 {
        h.advance(if resend == 1 { 1 } else { 2000 });
        assert_eq!(h.writes().len(), 2 + resend);
        assert_eq!(h.last_write(), msgs[0]);
    }
    h.advance(2000);
    // given up, the next one goes out
    assert_eq!(h.last_write(), msgs[1]);
    let failed = h.events().into_iter().find_map(|e| match e {
        ProgressEvent::MsgTransferFailed(r) => Some(r),
        _ => None,
    });
    let failed = failed.unwrap();
    assert_eq!(failed.retries, 3);
    assert_eq!(failed.failure, Some(FailureReason::TooManyRetries));

    h.feed(&mga_ack(&msgs[1], true, 0));
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
}

#[test]
fn no_flow_control_sends_everything_at_once() {
    let h = Harness::started(FlowConfig {
        flow_control: FlowControl::None,
        ..Default::default()
    });
    let msgs = [eph(1), eph(2), eph(3)];
    h.session.session_send_online_data(msgs.concat(), None).unwrap();
    assert_eq!(h.writes(), msgs.to_vec());
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
    assert_eq!(h.session.state(), Ok(LibState::Idle));
    assert_eq!(h.feed(&mga_ack(&msgs[0], true, 0)), Disposition::Ignored);
}

#[test]
fn state_machine_errors() {
    let h = Harness::configured(simple());
    assert_eq!(
        h.session.session_send_online_data(eph(1), None),
        Err(MgaError::AlreadyIdle)
    );
    assert_eq!(h.session.session_stop(), Err(MgaError::AlreadyIdle));

    h.session.session_start().unwrap();
    assert_eq!(h.session.session_start(), Err(MgaError::AlreadyRunning));
    assert_eq!(h.session.state(), Ok(LibState::ActiveWaitingForData));

    h.session.session_send_online_data(eph(1), None).unwrap();
    assert_eq!(
        h.session.session_send_online_data(eph(2), None),
        Err(MgaError::AlreadyRunning)
    );
    assert_eq!(
        h.session.configure(FlowConfig::default(), ublox_mga::Callbacks::new(|_: &[u8]| Ok(()))),
        Err(MgaError::AlreadyRunning)
    );
    assert_eq!(h.session.erase_offline_flash(), Err(MgaError::AlreadyRunning));
}

#[test]
fn rejected_blobs_leave_the_session_waiting() {
    let h = Harness::started(simple());
    let huge = vec![0u8; MAX_BLOB_SIZE + 1];
    assert_eq!(h.session.session_send_online_data(huge, None), Err(MgaError::BadData));
    assert_eq!(
        h.session.session_send_online_data(build_frame(0x01, 0x07, &[0; 4]).unwrap(), None),
        Err(MgaError::NoDataToSend)
    );
    let time = TimeAdjust::absolute(Utc::now(), 2, 0);
    assert_eq!(
        h.session.session_send_online_data(eph(1), Some(&time)),
        Err(MgaError::NoIniTime)
    );
    assert_eq!(h.session.state(), Ok(LibState::ActiveWaitingForData));
    assert!(h.writes().is_empty());
}

#[test]
fn online_time_is_adjusted() {
    let h = Harness::started(FlowConfig {
        flow_control: FlowControl::None,
        ..Default::default()
    });
    let stale = TimeAdjust::absolute(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), 60, 0);
    let mut blob = ublox_mga::mga_ini_time_frame(&stale).unwrap();
    blob.extend(eph(1));

    let now = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
    h.session
        .session_send_online_data(blob, Some(&TimeAdjust::absolute(now, 1, 500)))
        .unwrap();
    let ini = h.writes()[0].clone();
    let frame = parse_frame(&ini).unwrap();
    assert!(frame.checksum_ok());
    let p = frame.payload();
    assert_eq!(&p[4..11], &[0xE8, 0x07, 3, 4, 5, 6, 7]);
    assert_eq!(&p[16..18], &1u16.to_le_bytes());
    assert_eq!(&p[20..24], &500_000_000u32.to_le_bytes());
}

#[test]
fn offline_data_gets_time_and_position() {
    let h = Harness::started(FlowConfig {
        flow_control: FlowControl::None,
        ..Default::default()
    });
    let blob = [alm(1), ano(1, 24, 1, 2)].concat();
    let time = TimeAdjust::absolute(Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap(), 10, 0);
    let pos = PosAdjust {
        lat_x1e7: 471_234_567,
        lon_x1e7: 80_000_000,
        alt_mm: 500_000,
        acc_mm: 10_000,
    };
    h.session
        .session_send_offline_data(blob.clone(), &time, Some(&pos))
        .unwrap();

    let writes = h.writes();
    assert_eq!(writes.len(), 4);
    let ini_time = parse_frame(&writes[0]).unwrap();
    assert_eq!((ini_time.header.class, ini_time.header.id), (0x13, 0x40));
    assert_eq!(ini_time.payload()[0], 0x10);
    let ini_pos = parse_frame(&writes[1]).unwrap();
    assert_eq!(ini_pos.payload()[0], 0x01);
    assert_eq!(&ini_pos.payload()[12..16], &50_000i32.to_le_bytes());
    assert_eq!(writes[2..].concat(), blob);
}

#[test]
fn database_restore() {
    let h = Harness::started(FlowConfig::default());
    let dbd = [
        build_frame(0x13, 0x80, &[1; 20]).unwrap(),
        build_frame(0x13, 0x80, &[2; 40]).unwrap(),
    ];
    assert_eq!(
        h.session.session_send_database([dbd[0].clone(), eph(1)].concat()),
        Err(MgaError::BadData)
    );
    h.session.session_send_database(dbd.concat()).unwrap();
    assert_eq!(h.writes().len(), 3);
    for msg in &dbd {
        h.feed(&mga_ack(msg, true, 0));
    }
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
}

#[test]
fn host_cancel() {
    let h = Harness::started(simple());
    h.session.session_send_online_data(eph(1), None).unwrap();
    h.session.session_stop().unwrap();
    assert_eq!(
        h.events().last(),
        Some(&ProgressEvent::Terminated(TerminateReason::HostCancel))
    );
    assert_eq!(h.session.state(), Ok(LibState::Idle));
    assert_eq!(h.feed(&mga_ack(&eph(1), true, 0)), Disposition::Ignored);

    // the session can be used again
    h.session.session_start().unwrap();
    h.session.session_send_online_data(eph(2), None).unwrap();
    h.feed(&mga_ack(&eph(2), true, 0));
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
}

#[test]
fn service_errors_are_reported() {
    let h = Harness::configured(simple());
    h.session
        .notify_service_error(ublox_mga::ServiceErrorKind::CannotConnect, "timed out")
        .unwrap();
    assert_eq!(
        h.events(),
        vec![ProgressEvent::ServiceError {
            kind: ublox_mga::ServiceErrorKind::CannotConnect,
            detail: "timed out".into(),
        }]
    );
}

#[test]
fn progress_callback_may_call_back() {
    use std::sync::{Arc, Mutex};
    use ublox_mga::{Callbacks, MgaSession};

    let session = Arc::new(MgaSession::init());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (inner, log) = (Arc::downgrade(&session), seen.clone());
    let callbacks = Callbacks::new(|_: &[u8]| Ok(())).with_progress(move |e: &ProgressEvent| {
        if let Some(s) = inner.upgrade() {
            log.lock().unwrap().push((e.clone(), s.state().unwrap()));
        }
    });
    session
        .configure(
            FlowConfig {
                flow_control: FlowControl::None,
                ..Default::default()
            },
            callbacks,
        )
        .unwrap();
    session.session_start().unwrap();
    session.session_send_online_data(eph(1), None).unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&(ProgressEvent::Finish, LibState::Idle)));
}
