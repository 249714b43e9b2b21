//! Query strings for the AssistNow Online and Offline services.
//!
//! The host appends the result to `GetOnlineData.ashx?` or
//! `GetOfflineData.ashx?` and carries out the HTTP request itself.
use std::fmt::Write;

use num_traits::{PrimInt, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::{MgaError, Result};

/// Days of offline data the legacy service can deliver
pub const LEGACY_OFFLINE_DAYS: [u32; 7] = [1, 2, 3, 5, 7, 10, 14];
/// Most days of offline data the MGA service delivers
pub const MAX_OFFLINE_DAYS: u32 = 35;
/// Days of offline data requested when none are given
pub const DEFAULT_OFFLINE_DAYS: u32 = 28;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Constellations to request data for
pub struct GnssSelection {
    /// GPS
    pub gps: bool,
    /// GLONASS
    pub glonass: bool,
    /// QZSS
    pub qzss: bool,
    /// Galileo
    pub galileo: bool,
    /// BeiDou
    pub beidou: bool,
}

impl GnssSelection {
    fn names(&self) -> impl Iterator<Item = &'static str> {
        [
            (self.gps, "gps"),
            (self.glonass, "glo"),
            (self.qzss, "qzss"),
            (self.galileo, "gal"),
            (self.beidou, "bds"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Kinds of online data to request
pub struct DataTypeSelection {
    /// Ephemerides
    pub ephemeris: bool,
    /// Almanacs
    pub almanac: bool,
    /// Auxiliary data (ionosphere, UTC, health)
    pub aux: bool,
    /// Approximate position from the server
    pub position: bool,
}

impl DataTypeSelection {
    fn names(&self) -> impl Iterator<Item = &'static str> {
        [
            (self.ephemeris, "eph"),
            (self.almanac, "alm"),
            (self.aux, "aux"),
            (self.position, "pos"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Approximate receiver position sent with an online request
pub struct RequestPosition {
    /// Latitude, 1e-7 degrees
    pub lat_x1e7: i32,
    /// Longitude, 1e-7 degrees
    pub lon_x1e7: i32,
    /// Altitude, mm
    pub alt_mm: i32,
    /// Accuracy, mm
    pub acc_mm: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Parameters of an AssistNow Online request
pub struct OnlineServerConfig {
    /// Authorization token
    pub token: String,
    /// Constellations
    pub gnss: GnssSelection,
    /// Kinds of data
    pub data_types: DataTypeSelection,
    /// Position of the receiver
    pub position: Option<RequestPosition>,
    /// Only send ephemerides of satellites visible from `position`
    pub filter_on_pos: bool,
    /// Expected delay until the data reaches the receiver, ms
    pub latency_ms: Option<u32>,
    /// Accuracy of the receiver's time, ms
    pub time_accuracy_ms: Option<u32>,
    /// Ask for UBX-AID instead of UBX-MGA messages
    pub legacy_aiding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Parameters of an AssistNow Offline request
pub struct OfflineServerConfig {
    /// Authorization token
    pub token: String,
    /// Constellations to get orbit predictions for
    pub gnss: GnssSelection,
    /// Constellations to get almanacs for
    pub almanac: GnssSelection,
    /// Ask for an ALP file instead of UBX-MGA messages
    pub legacy_aiding: bool,
    /// Days of data, adjusted to what the service supports
    pub days: Option<u32>,
    /// Weeks of data, takes the place of `days` for the MGA service
    pub period_weeks: Option<u32>,
    /// Days between predictions
    pub resolution_days: Option<u32>,
}

/// Render `value / 10^decimals` with exactly `decimals` digits after the point.
pub fn fixed_point<T: PrimInt + ToPrimitive>(value: T, decimals: u32) -> String {
    let v = value.to_i128().unwrap_or_default();
    let scale = 10u128.pow(decimals);
    let abs = v.unsigned_abs();
    let sign = if v < 0 { "-" } else { "" };
    let width = decimals as usize;
    format!("{sign}{}.{:0width$}", abs / scale, abs % scale)
}

fn push_list<'a>(out: &mut String, key: &str, names: impl Iterator<Item = &'a str>) {
    let mut first = true;
    for name in names {
        out.push_str(if first { ";" } else { "," });
        if first {
            out.push_str(key);
            out.push('=');
        }
        out.push_str(name);
        first = false;
    }
}

fn check_token(token: &str) -> Result<()> {
    if token.is_empty() || token.contains([';', '&', ' ']) {
        return Err(MgaError::InvalidArgument("token"));
    }
    Ok(())
}

/// Nearest number of days the legacy service delivers; ties go to the longer period.
pub fn legacy_offline_days(days: u32) -> u32 {
    LEGACY_OFFLINE_DAYS
        .iter()
        .copied()
        .min_by_key(|&d| (d.abs_diff(days), u32::MAX - d))
        .unwrap_or(1)
}

/// Query string of an AssistNow Online request.
pub fn build_online_request_params(cfg: &OnlineServerConfig) -> Result<String> {
    check_token(&cfg.token)?;
    let mut out = format!("token={}", cfg.token);
    push_list(&mut out, "gnss", cfg.gnss.names());
    push_list(&mut out, "datatype", cfg.data_types.names());
    if let Some(pos) = &cfg.position {
        let _ = write!(
            out,
            ";lat={};lon={};alt={};pacc={}",
            fixed_point(pos.lat_x1e7, 7),
            fixed_point(pos.lon_x1e7, 7),
            fixed_point(pos.alt_mm, 3),
            fixed_point(pos.acc_mm, 3)
        );
    }
    if cfg.filter_on_pos {
        out.push_str(";filteronpos");
    }
    if let Some(latency) = cfg.latency_ms {
        let _ = write!(out, ";latency={}", fixed_point(latency, 3));
    }
    if let Some(tacc) = cfg.time_accuracy_ms {
        let _ = write!(out, ";tacc={}", fixed_point(tacc, 3));
    }
    if cfg.legacy_aiding {
        out.push_str(";format=aid");
    }
    log::debug!("Online request: {out}");
    Ok(out)
}

/// Query string of an AssistNow Offline request.
pub fn build_offline_request_params(cfg: &OfflineServerConfig) -> Result<String> {
    check_token(&cfg.token)?;
    let mut out = format!("token={}", cfg.token);
    push_list(&mut out, "gnss", cfg.gnss.names());
    push_list(&mut out, "alm", cfg.almanac.names());
    if cfg.legacy_aiding {
        let days = legacy_offline_days(cfg.days.unwrap_or(DEFAULT_OFFLINE_DAYS));
        let _ = write!(out, ";format=aid;days={days}");
    } else if let Some(weeks) = cfg.period_weeks {
        let _ = write!(out, ";period={weeks}");
    } else {
        let days = cfg.days.unwrap_or(DEFAULT_OFFLINE_DAYS).clamp(1, MAX_OFFLINE_DAYS);
        let _ = write!(out, ";days={days}");
    }
    if let Some(resolution) = cfg.resolution_days {
        let _ = write!(out, ";resolution={resolution}");
    }
    log::debug!("Offline request: {out}");
    Ok(out)
}

/// Copy `params` and a terminating zero into `buf`.
///
/// Returns the length of `params`. Without a buffer nothing is written and
/// only the length is returned.
pub fn write_params(params: &str, buf: Option<&mut [u8]>) -> Result<usize> {
    let len = params.len();
    if let Some(buf) = buf {
        if buf.len() < len + 1 {
            return Err(MgaError::BufferTooSmall { needed: len + 1 });
        }
        buf[..len].copy_from_slice(params.as_bytes());
        buf[len] = 0;
    }
    Ok(len)
}

/// [`build_online_request_params`] into a caller-provided buffer.
pub fn write_online_request_params(cfg: &OnlineServerConfig, buf: Option<&mut [u8]>) -> Result<usize> {
    write_params(&build_online_request_params(cfg)?, buf)
}

/// [`build_offline_request_params`] into a caller-provided buffer.
pub fn write_offline_request_params(cfg: &OfflineServerConfig, buf: Option<&mut [u8]>) -> Result<usize> {
    write_params(&build_offline_request_params(cfg)?, buf)
}
