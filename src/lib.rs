#![deny(missing_docs)]
//! # u-blox MGA Assistance
//! Transfers AssistNow assistance data to u-blox GNSS receivers.
//!
//! Takes the UBX streams served by the AssistNow Online and Offline services
//! (or a navigation database saved from the receiver) and feeds them to the
//! receiver with acknowledgement tracking, retries and flow control. Offline
//! data can also be stored in the receiver's flash, and receivers that only
//! speak the legacy UBX-AID protocol can be served ALP data.
//!
//! The crate does no I/O of its own. The host writes the bytes handed to its
//! write callback to the receiver, passes every UBX frame it receives to
//! [`MgaSession::process_receiver_message`] and calls
//! [`MgaSession::check_for_timeouts`] periodically.
//!
//! ```no_run
//! use ublox_mga::{Callbacks, FlowConfig, MgaSession, ProgressEvent};
//!
//! let session = MgaSession::init();
//! let callbacks = Callbacks::new(|bytes: &[u8]| {
//!     // write to the serial port here
//!     let _ = bytes;
//!     Ok(())
//! })
//! .with_progress(|event: &ProgressEvent| println!("{event:?}"));
//! session.configure(FlowConfig::default(), callbacks)?;
//! session.session_start()?;
//! # let data = Vec::new();
//! session.session_send_online_data(data, None)?;
//! # Ok::<(), ublox_mga::MgaError>(())
//! ```
pub mod database;
mod error;
mod event;
mod flash;
mod flow;
mod ini;
mod legacy;
mod msglist;
mod offline;
mod request;
mod session;
pub mod ubx;

pub use error::{FailureReason, MgaError, Result, ServiceErrorKind, TerminateReason};
pub use event::{BlockReport, LegacyAidingEvent, MsgReport, ProgressEvent};
pub use flash::{
    erase_frames, flash_data_frame, flash_stop_frame, FlashAck, FlashBlock, FlashPayload,
    FLASH_BLOCK_SIZE, FLASH_STOP_SEQUENCE,
};
pub use flow::{
    ack_config_frame, AckConfig, FlowConfig, FlowControl, Navx5Mask1, CFG_NAVSPG_ACKAIDING,
    DEFAULT_SMART_BUDGET,
};
pub use ini::{
    adjust_ini_time, mga_ini_pos_frame, mga_ini_time_frame, prepend_ini, prepend_ini_pos,
    prepend_ini_time, starts_with_ini_time, AidIniFlags, PosAdjust, TimeAdjust, TimeAdjustMode,
};
pub use legacy::{
    alp_stop_frame, alpsrv_rate_frame, LegacyAidingHeader, LegacyAidingState, ALP_BLOCK_SIZE,
    ALP_HEADER_LEN, ALP_MAGIC,
};
pub use msglist::{build_message_list, MgaMessage, MsgState};
pub use offline::{get_alm_offline_data, get_ano_offline_data, get_todays_offline_data};
pub use request::{
    build_offline_request_params, build_online_request_params, fixed_point, legacy_offline_days,
    write_offline_request_params, write_online_request_params, write_params, DataTypeSelection,
    GnssSelection, OfflineServerConfig, OnlineServerConfig, RequestPosition,
    DEFAULT_OFFLINE_DAYS, LEGACY_OFFLINE_DAYS, MAX_OFFLINE_DAYS,
};
pub use session::{
    Callbacks, Clock, Disposition, LibState, MgaSession, ProgressFn, SystemClock, WriteFn,
    MAX_BLOB_SIZE,
};

/// Version of this library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
