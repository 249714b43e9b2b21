mod common;

use common::*;
use ublox_mga::{
    alp_stop_frame, alpsrv_rate_frame,
    ubx::{build_frame, parse_frame},
    FlowConfig, LegacyAidingEvent, LegacyAidingHeader, LegacyAidingState, LibState, MgaError,
    ProgressEvent, ALP_HEADER_LEN, ALP_MAGIC,
};

fn alp_file(len: usize) -> Vec<u8> {
    let header = LegacyAidingHeader {
        magic: ALP_MAGIC,
        offsets: [0x20; 32],
        size: 0,
        completed: 0,
        tow: 0,
        wno: 2300,
        duration: 14,
    };
    let mut data = header.encode().to_vec();
    data.extend((0..len - ALP_HEADER_LEN).map(|i| (i * 7) as u8));
    data
}

fn alp_ack(ok: bool) -> Vec<u8> {
    build_frame(0x0B, 0x50, &[ok as u8]).unwrap()
}

fn alpsrv_request(offset_words: u16, size_words: u16) -> Vec<u8> {
    let mut p = vec![16, 0];
    p.extend_from_slice(&offset_words.to_le_bytes());
    p.extend_from_slice(&size_words.to_le_bytes());
    p.extend_from_slice(&[0; 4]);
    p.extend_from_slice(&[9, 8, 7, 6, 5, 4]);
    build_frame(0x0B, 0x32, &p).unwrap()
}

fn alpsrv_update(offset_words: u16, file_id: u16, bytes: &[u8]) -> Vec<u8> {
    let mut p = vec![8, 0xFF];
    p.extend_from_slice(&offset_words.to_le_bytes());
    p.extend_from_slice(&((bytes.len() / 2) as u16).to_le_bytes());
    p.extend_from_slice(&file_id.to_le_bytes());
    p.extend_from_slice(bytes);
    build_frame(0x0B, 0x32, &p).unwrap()
}

#[test]
fn alp_file_is_pushed_to_flash() {
    let data = alp_file(1100);
    let h = Harness::started(FlowConfig::default());
    h.session.session_send_legacy_offline_to_flash(data.clone()).unwrap();
    assert_eq!(h.session.legacy_state(), Ok(LegacyAidingState::Starting));
    assert_eq!(h.writes(), vec![alp_stop_frame()]);

    h.feed(&alp_ack(true));
    assert_eq!(h.session.legacy_state(), Ok(LegacyAidingState::MainSeq));
    for _ in 0..3 {
        h.feed(&alp_ack(true));
    }
    assert_eq!(h.session.legacy_state(), Ok(LegacyAidingState::Stopping));
    h.feed(&alp_ack(true));
    assert_eq!(h.session.legacy_state(), Ok(LegacyAidingState::Idle));
    assert_eq!(h.session.state(), Ok(LibState::Idle));

    let writes = h.writes();
    assert_eq!(writes.len(), 5);
    let sent: Vec<u8> = writes[1..4]
        .iter()
        .flat_map(|w| parse_frame(w).unwrap().payload().to_vec())
        .collect();
    assert_eq!(sent, data);
    assert_eq!(writes[4], alp_stop_frame());

    let legacy = h.legacy_events();
    assert_eq!(legacy.first(), Some(&LegacyAidingEvent::StartupStarted));
    assert!(matches!(
        legacy.last(),
        Some(LegacyAidingEvent::FinalizeCompleted(header)) if header.size == 1100 && header.completed == 1
    ));
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));
}

#[test]
fn not_an_alp_file() {
    let h = Harness::started(FlowConfig::default());
    let mut data = alp_file(300);
    data[0] ^= 0xFF;
    assert_eq!(
        h.session.session_send_legacy_offline_to_flash(data.clone()),
        Err(MgaError::BadData)
    );
    assert_eq!(h.session.start_legacy_aiding(data), Err(MgaError::BadData));
}

#[test]
fn aiding_server_answers_and_records_updates() {
    let data = alp_file(10_000);
    let h = Harness::started(FlowConfig::default());
    let file_id = h.session.start_legacy_aiding(data.clone()).unwrap();
    assert_eq!(h.writes(), vec![alpsrv_rate_frame(true)]);
    assert_eq!(h.session.state(), Ok(LibState::ActiveProcessingData));
    assert_eq!(h.session.legacy_state(), Ok(LegacyAidingState::Idle));

    h.feed(&alpsrv_request(2, 5));
    let resp = h.last_write();
    let resp = parse_frame(&resp).unwrap();
    let p = resp.payload();
    assert_eq!(&p[6..8], &file_id.to_le_bytes());
    assert_eq!(&p[10..16], &[9, 8, 7, 6, 5, 4]);
    assert_eq!(&p[16..], &data[4..14]);

    // timeouts mean nothing to the server
    h.advance(60_000);
    assert_eq!(h.session.state(), Ok(LibState::ActiveProcessingData));

    h.feed(&alpsrv_update(200, file_id, &[0x55; 6]));
    assert!(h
        .legacy_events()
        .contains(&LegacyAidingEvent::UpdateCompleted { offset: 400, size: 6 }));

    let updated = h.session.stop_legacy_aiding().unwrap();
    assert_eq!(h.last_write(), alpsrv_rate_frame(false));
    assert_eq!(h.legacy_events().last(), Some(&LegacyAidingEvent::ServerStopped));
    assert_eq!(updated.len(), data.len());
    assert_eq!(&updated[400..406], &[0x55; 6]);
    assert_eq!(updated[..400], data[..400]);
    assert_eq!(h.session.state(), Ok(LibState::Idle));
    assert_eq!(h.session.stop_legacy_aiding(), Err(MgaError::AlreadyIdle));
}

#[test]
fn session_stop_shuts_the_server_down() {
    let h = Harness::started(FlowConfig::default());
    h.session.start_legacy_aiding(alp_file(500)).unwrap();
    h.session.session_stop().unwrap();
    assert_eq!(h.last_write(), alpsrv_rate_frame(false));
    assert_eq!(
        h.events().last(),
        Some(&ProgressEvent::Terminated(ublox_mga::TerminateReason::HostCancel))
    );
}

#[test]
fn stop_without_server() {
    let h = Harness::started(FlowConfig::default());
    h.session.session_send_legacy_offline_to_flash(alp_file(300)).unwrap();
    assert!(matches!(
        h.session.stop_legacy_aiding(),
        Err(MgaError::InvalidArgument(_))
    ));
    assert_eq!(h.session.legacy_state(), Ok(LegacyAidingState::Starting));
}

#[test]
fn large_request_is_served_in_one_valid_frame() {
    let data = alp_file(200_000);
    let h = Harness::started(FlowConfig::default());
    h.session.start_legacy_aiding(data.clone()).unwrap();

    h.feed(&alpsrv_request(0, 0x8000));
    let resp = h.last_write();
    let frame = parse_frame(&resp).expect("reply must be a single well formed frame");
    let p = frame.payload();
    assert_eq!(p.len(), 0xFFFF);
    let served = u16::from_le_bytes([p[8], p[9]]) as usize;
    assert_eq!(served, p.len() - 16);
    assert_eq!(&p[16..], &data[..served]);
}
