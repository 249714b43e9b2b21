mod common;

use common::*;
use ublox_mga::{
    erase_frames, flash_stop_frame, ubx::parse_frame, FlowConfig, LibState, MgaError,
    ProgressEvent, TerminateReason,
};

fn flash_cfg() -> FlowConfig {
    FlowConfig {
        msg_timeout_ms: 5000,
        msg_retry_count: 2,
        ..Default::default()
    }
}

fn offline_blob(ano_count: u8) -> Vec<u8> {
    let mut blob = alm(1);
    for sv in 1..=ano_count {
        blob.extend(ano(sv, 24, 1, 2));
    }
    blob.extend(alm(2));
    blob
}

#[test]
fn offline_data_is_flashed_block_by_block() {
    let h = Harness::started(flash_cfg());
    h.session.session_send_offline_to_flash(offline_blob(8)).unwrap();
    assert_eq!(h.events().first(), Some(&ProgressEvent::Start { messages: 2 }));

    h.feed(&flash_ack(0, 0));
    h.feed(&flash_ack(0, 1));
    assert_eq!(h.last_write(), flash_stop_frame());
    assert_eq!(h.session.state(), Ok(LibState::ActiveProcessingData));
    h.feed(&flash_ack(0, 0xFFFF));
    assert_eq!(h.events().last(), Some(&ProgressEvent::Finish));

    // only the ANO messages go into flash
    let flashed: Vec<u8> = h.writes()[..2]
        .iter()
        .flat_map(|w| parse_frame(w).unwrap().payload()[6..].to_vec())
        .collect();
    let anos: Vec<u8> = (1..=8).flat_map(|sv| ano(sv, 24, 1, 2)).collect();
    assert_eq!(flashed, anos);
}

#[test]
fn silent_receiver_is_nudged_then_given_up() {
    let h = Harness::started(flash_cfg());
    h.session.session_send_offline_to_flash(offline_blob(7)).unwrap();
    let block = h.last_write();
    assert_eq!(parse_frame(&block).unwrap().payload().len(), 6 + 512);

    h.advance(5000);
    assert_eq!(h.last_write(), vec![0x00]);
    h.advance(5000);
    assert_eq!(h.last_write(), block);
    assert!(matches!(
        h.events().last(),
        Some(ProgressEvent::FlashBlockSent(b)) if b.sequence == 0 && b.retries == 1
    ));

    h.advance(5000);
    h.advance(5000);
    assert_eq!(h.last_write(), block);
    h.advance(5000);
    assert_eq!(h.last_write(), vec![0x00]);
    h.advance(5000);
    assert_eq!(
        h.events().last(),
        Some(&ProgressEvent::Terminated(TerminateReason::ReceiverNotResponding))
    );
    assert_eq!(h.session.state(), Ok(LibState::Idle));
    assert_eq!(h.writes().len(), 6);
}

#[test]
fn receiver_abort_terminates() {
    let h = Harness::started(flash_cfg());
    h.session.session_send_offline_to_flash(offline_blob(3)).unwrap();
    h.feed(&flash_ack(2, 0));
    assert_eq!(
        h.events().last(),
        Some(&ProgressEvent::Terminated(TerminateReason::ReceiverNak))
    );
}

#[test]
fn nothing_to_flash() {
    let h = Harness::started(flash_cfg());
    assert_eq!(
        h.session.session_send_offline_to_flash(alm(1)),
        Err(MgaError::NoDataToSend)
    );
}

#[test]
fn erase() {
    let h = Harness::configured(flash_cfg());
    h.session.erase_offline_flash().unwrap();
    assert_eq!(h.writes(), vec![erase_frames()]);
    assert_eq!(h.session.state(), Ok(LibState::Idle));
}
