//! Construction and adjustment of the initial time and position messages
//! that precede assistance data.
use bitfield_struct::bitfield;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{MgaError, Result},
    ubx::{self, class, FrameHeader, HEADER_LEN},
};

const INI_TIME_UTC: u8 = 0x10;
const INI_POS_LLH: u8 = 0x01;
const INI_TIME_LEN: usize = 24;
const INI_POS_LEN: usize = 20;
const AID_INI_LEN: usize = 48;
/// Leap seconds unknown
const LEAP_UNKNOWN: u8 = 0x80;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// How a time adjustment is applied to an existing INI message
pub enum TimeAdjustMode {
    /// Replace the date and time
    Absolute,
    /// Add hours, minutes and seconds to the date and time already there
    Relative,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// UTC time handed to the receiver ahead of assistance data.
///
/// In relative mode only `hour`, `minute`, `second` and `acc_s` are used.
pub struct TimeAdjust {
    /// Absolute or relative
    pub mode: TimeAdjustMode,
    /// Year, e.g. 2024
    pub year: u16,
    /// Month, 1 to 12
    pub month: u8,
    /// Day of month
    pub day: u8,
    /// Hour
    pub hour: u8,
    /// Minute
    pub minute: u8,
    /// Second
    pub second: u8,
    /// Accuracy, seconds part
    pub acc_s: u16,
    /// Accuracy, milliseconds part
    pub acc_ms: u16,
}

impl TimeAdjust {
    /// Absolute adjustment to `time`, with the given accuracy.
    pub fn absolute(time: DateTime<Utc>, acc_s: u16, acc_ms: u16) -> Self {
        Self {
            mode: TimeAdjustMode::Absolute,
            year: time.year() as u16,
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
            acc_s,
            acc_ms,
        }
    }

    /// Relative adjustment by the given offset.
    pub fn relative(hour: u8, minute: u8, second: u8, acc_s: u16) -> Self {
        Self {
            mode: TimeAdjustMode::Relative,
            year: 0,
            month: 0,
            day: 0,
            hour,
            minute,
            second,
            acc_s,
            acc_ms: 0,
        }
    }

    fn datetime(&self) -> Result<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)
            .and_then(|d| d.and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32))
            .ok_or(MgaError::InvalidArgument("invalid date or time"))
    }

    fn offset(&self) -> Duration {
        Duration::seconds(self.hour as i64 * 3600 + self.minute as i64 * 60 + self.second as i64)
    }

    fn acc_ns(&self) -> u32 {
        self.acc_ms as u32 * 1_000_000
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Position handed to the receiver ahead of assistance data
pub struct PosAdjust {
    /// Latitude, degrees x 1e7
    pub lat_x1e7: i32,
    /// Longitude, degrees x 1e7
    pub lon_x1e7: i32,
    /// Altitude, millimetres
    pub alt_mm: i32,
    /// Position accuracy, millimetres
    pub acc_mm: u32,
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
/// UBX-AID-INI `flags`
pub struct AidIniFlags {
    /// Position is valid
    pub pos: bool,
    /// Time is valid
    pub time: bool,
    /// Clock drift is valid
    pub clock_d: bool,
    /// Time is based on the time pulse
    pub tp: bool,
    /// Clock frequency is valid
    pub clock_f: bool,
    /// Position is latitude/longitude/altitude
    pub lla: bool,
    /// Altitude is not valid
    pub alt_inv: bool,
    /// Use previous time pulse edge
    pub prev_tm: bool,
    #[bits(2)]
    _r0: u8,
    /// Time is a UTC date and time
    pub utc: bool,
    #[bits(21)]
    _r1: u32,
}

/// Build a UBX-MGA-INI-TIME_UTC frame from an absolute adjustment.
pub fn mga_ini_time_frame(time: &TimeAdjust) -> Result<Vec<u8>> {
    if time.mode != TimeAdjustMode::Absolute {
        return Err(MgaError::InvalidArgument("INI time needs an absolute time"));
    }
    let mut payload = [0u8; INI_TIME_LEN];
    payload[0] = INI_TIME_UTC;
    payload[3] = LEAP_UNKNOWN;
    write_ini_time(&mut payload, &time.datetime()?);
    payload[16..18].copy_from_slice(&time.acc_s.to_le_bytes());
    payload[20..24].copy_from_slice(&time.acc_ns().to_le_bytes());
    Ok(ubx::fixed_frame(class::MGA, ubx::mga::INI, &payload))
}

/// Build a UBX-MGA-INI-POS_LLH frame.
pub fn mga_ini_pos_frame(pos: &PosAdjust) -> Vec<u8> {
    let mut payload = [0u8; INI_POS_LEN];
    payload[0] = INI_POS_LLH;
    payload[4..8].copy_from_slice(&pos.lat_x1e7.to_le_bytes());
    payload[8..12].copy_from_slice(&pos.lon_x1e7.to_le_bytes());
    // the message carries centimetres
    payload[12..16].copy_from_slice(&(pos.alt_mm / 10).to_le_bytes());
    payload[16..20].copy_from_slice(&(pos.acc_mm / 10).to_le_bytes());
    ubx::fixed_frame(class::MGA, ubx::mga::INI, &payload)
}

fn write_ini_time(payload: &mut [u8], dt: &NaiveDateTime) {
    payload[4..6].copy_from_slice(&(dt.year() as u16).to_le_bytes());
    payload[6] = dt.month() as u8;
    payload[7] = dt.day() as u8;
    payload[8] = dt.hour() as u8;
    payload[9] = dt.minute() as u8;
    payload[10] = dt.second() as u8;
    payload[12..16].fill(0);
}

fn read_ini_time(payload: &[u8]) -> Result<NaiveDateTime> {
    let year = u16::from_le_bytes([payload[4], payload[5]]) as i32;
    NaiveDate::from_ymd_opt(year, payload[6] as u32, payload[7] as u32)
        .and_then(|d| d.and_hms_opt(payload[8] as u32, payload[9] as u32, payload[10] as u32))
        .ok_or(MgaError::BadData)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum IniKind {
    MgaTime,
    AidIni,
}

fn first_ini(data: &[u8]) -> Option<(IniKind, usize)> {
    let header = FrameHeader::peek(data)?;
    if header.frame_len() > data.len() {
        return None;
    }
    let len = header.len as usize;
    match (header.class, header.id) {
        (class::MGA, ubx::mga::INI) if len == INI_TIME_LEN && data[HEADER_LEN] == INI_TIME_UTC => {
            Some((IniKind::MgaTime, header.frame_len()))
        }
        (class::AID, ubx::aid::INI) if len == AID_INI_LEN => {
            Some((IniKind::AidIni, header.frame_len()))
        }
        _ => None,
    }
}

/// Whether `data` starts with a UBX-MGA-INI-TIME_UTC message.
pub fn starts_with_ini_time(data: &[u8]) -> bool {
    matches!(first_ini(data), Some((IniKind::MgaTime, _)))
}

/// Copy `data` behind a new UBX-MGA-INI-TIME, and UBX-MGA-INI-POS when given.
///
/// An INI time already leading `data` is replaced rather than stacked.
pub fn prepend_ini(data: &[u8], time: &TimeAdjust, pos: Option<&PosAdjust>) -> Result<Vec<u8>> {
    let time_frame = mga_ini_time_frame(time)?;
    let pos_frame = pos.map(mga_ini_pos_frame);
    let rest = match first_ini(data) {
        Some((IniKind::MgaTime, len)) => &data[len..],
        _ => data,
    };
    let mut out = Vec::new();
    out.try_reserve_exact(
        time_frame.len() + pos_frame.as_ref().map_or(0, Vec::len) + rest.len(),
    )?;
    out.extend_from_slice(&time_frame);
    if let Some(pos_frame) = pos_frame {
        out.extend_from_slice(&pos_frame);
    }
    out.extend_from_slice(rest);
    Ok(out)
}

/// Copy `data` behind a new UBX-MGA-INI-TIME.
pub fn prepend_ini_time(data: &[u8], time: &TimeAdjust) -> Result<Vec<u8>> {
    prepend_ini(data, time, None)
}

/// Copy `data` behind a new UBX-MGA-INI-POS.
pub fn prepend_ini_pos(data: &[u8], pos: &PosAdjust) -> Result<Vec<u8>> {
    let pos_frame = mga_ini_pos_frame(pos);
    let mut out = Vec::new();
    out.try_reserve_exact(pos_frame.len() + data.len())?;
    out.extend_from_slice(&pos_frame);
    out.extend_from_slice(data);
    Ok(out)
}

/// Adjust the time in the INI message leading `data`, in place.
pub fn adjust_ini_time(data: &mut [u8], time: &TimeAdjust) -> Result<()> {
    let (kind, len) = first_ini(data).ok_or(MgaError::NoIniTime)?;
    let payload = &mut data[HEADER_LEN..len - 2];
    match (kind, time.mode) {
        (IniKind::MgaTime, TimeAdjustMode::Absolute) => {
            write_ini_time(payload, &time.datetime()?);
            payload[16..18].copy_from_slice(&time.acc_s.to_le_bytes());
            payload[20..24].copy_from_slice(&time.acc_ns().to_le_bytes());
        }
        (IniKind::MgaTime, TimeAdjustMode::Relative) => {
            let adjusted = read_ini_time(payload)? + time.offset();
            write_ini_time(payload, &adjusted);
            payload[16..18].copy_from_slice(&time.acc_s.to_le_bytes());
        }
        (IniKind::AidIni, TimeAdjustMode::Absolute) => {
            let dt = time.datetime()?;
            let year = dt.year() - 2000;
            if !(0..=255).contains(&year) {
                return Err(MgaError::InvalidArgument("year out of range for UBX-AID-INI"));
            }
            payload[18] = dt.month() as u8;
            payload[19] = year as u8;
            payload[20] = dt.second() as u8;
            payload[21] = dt.minute() as u8;
            payload[22] = dt.hour() as u8;
            payload[23] = dt.day() as u8;
            payload[24..28].fill(0);
            let acc_ms = time.acc_s as u32 * 1000 + time.acc_ms as u32;
            payload[28..32].copy_from_slice(&acc_ms.to_le_bytes());
            payload[32..36].fill(0);
            let flags = AidIniFlags::from_bits(u32::from_le_bytes([
                payload[44],
                payload[45],
                payload[46],
                payload[47],
            ]))
            .with_time(true)
            .with_utc(true);
            payload[44..48].copy_from_slice(&flags.into_bits().to_le_bytes());
        }
        (IniKind::AidIni, TimeAdjustMode::Relative) => {
            return Err(MgaError::InvalidArgument(
                "UBX-AID-INI only supports absolute time adjustment",
            ));
        }
    }
    ubx::refresh_checksum(&mut data[..len]);
    Ok(())
}
