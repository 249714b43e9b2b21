//! Extraction of subsets of AssistNow Offline data.
use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::{
    error::{MgaError, Result},
    ubx::{self, Frame, MsgKind},
};

fn ano_time(frame: &Frame) -> Option<NaiveDateTime> {
    if frame.kind() != Some(MsgKind::MgaAno) {
        return None;
    }
    let p = frame.payload();
    if p.len() < 8 {
        return None;
    }
    NaiveDate::from_ymd_opt(p[4] as i32 + 2000, p[5] as u32, p[6] as u32)?.and_hms_opt(p[7] as u32, 0, 0)
}

fn collect<F>(data: &[u8], mut keep: F) -> Result<Vec<u8>>
where
    F: FnMut(&Frame) -> bool,
{
    let mut size = 0;
    for frame in ubx::frames(data) {
        let frame = frame?;
        if frame.checksum_ok() && keep(&frame) {
            size += frame.bytes.len();
        }
    }
    if size == 0 {
        return Err(MgaError::NoDataToSend);
    }
    let mut out = Vec::new();
    out.try_reserve_exact(size)?;
    for frame in ubx::frames(data) {
        let frame = frame?;
        if frame.checksum_ok() && keep(&frame) {
            out.extend_from_slice(frame.bytes);
        }
    }
    Ok(out)
}

fn is_almanac(frame: &Frame) -> bool {
    frame.kind().is_some_and(|k| k.is_almanac())
}

/// The almanac messages of an offline blob.
pub fn get_alm_offline_data(data: &[u8]) -> Result<Vec<u8>> {
    collect(data, is_almanac)
}

/// The UBX-MGA-ANO messages of an offline blob.
pub fn get_ano_offline_data(data: &[u8]) -> Result<Vec<u8>> {
    collect(data, |f| f.kind() == Some(MsgKind::MgaAno))
}

/// The almanac messages and the UBX-MGA-ANO messages for `date` (UTC).
///
/// If the blob has no records for `date`, the records of the closest date
/// it does cover are used instead.
pub fn get_todays_offline_data(date: NaiveDate, data: &[u8]) -> Result<Vec<u8>> {
    let wanted = date.and_hms_opt(0, 0, 0).ok_or(MgaError::InvalidArgument("date"))?;
    let mut closest: Option<NaiveDateTime> = None;
    for frame in ubx::frames(data) {
        let frame = frame?;
        if let Some(t) = ano_time(&frame) {
            let better = closest.map_or(true, |c| {
                (t - wanted).num_seconds().abs() < (c - wanted).num_seconds().abs()
            });
            if better {
                closest = Some(t);
            }
        }
    }
    let target = closest;
    if let Some(target) = target {
        if target.date() != date {
            log::info!(
                "No offline data for {date}, using {} instead",
                target.format("%Y-%m-%d")
            );
        }
    }
    collect(data, |f| {
        if is_almanac(f) {
            return true;
        }
        match (ano_time(f), target) {
            (Some(t), Some(target)) => {
                t.year() == target.year() && t.month() == target.month() && t.day() == target.day()
            }
            _ => false,
        }
    })
}
