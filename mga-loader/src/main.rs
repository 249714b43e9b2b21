#![deny(missing_docs)]
//! # MGA Loader
//! Feeds AssistNow data to a u-blox receiver on a serial port.
mod config;
mod store;
use chrono::Utc;
use crossterm::terminal;
use env_logger::{Builder, Target};
use lazy_static::lazy_static;
use serialport::SerialPort;
use std::{
    error::Error,
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};
use ublox_mga::{
    database::{poll_frame, CollectStatus, DatabaseCollector},
    get_todays_offline_data,
    ubx::FrameReassembler,
    Callbacks, LegacyAidingEvent, MgaSession, ProgressEvent, TimeAdjust,
};

pub use config::{LoaderCfg, Mode};
use store::StoreCfg;

lazy_static! {
    static ref RUNNING: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
}

/// Gives up on a database dump after this long without a frame
const DATABASE_IDLE: Duration = Duration::from_secs(10);

fn main() -> Result<(), Box<dyn Error>> {
    let mut builder = Builder::from_default_env();
    builder
        .target(Target::Stdout)
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    let cfg: LoaderCfg = argh::from_env();
    let cfg = if cfg.serial_port.is_some() {
        cfg
    } else {
        LoaderCfg::load_default().map_err(|e| format!("No serial port given and no saved configuration: {e}"))?
    };
    if cfg.save_config {
        cfg.store_default()?;
        log::info!("Configuration saved");
    }
    let port_name = cfg.serial_port.clone().ok_or("No serial port configured")?;

    let flag = RUNNING.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    let port = serialport::new(&port_name, cfg.baud_rate)
        .timeout(Duration::from_millis(cfg.timeout))
        .open()?;
    log::info!("Opened {port_name} at {} baud, mode {}", cfg.baud_rate, cfg.mode);
    let file = StoreCfg::new(cfg.file.clone());

    if cfg.mode == Mode::Database {
        return save_database(port, &file);
    }

    let mut writer = port.try_clone()?;
    let (tx, rx) = mpsc::channel();
    let callbacks = Callbacks::new(move |bytes: &[u8]| writer.write_all(bytes))
        .with_progress(move |event: &ProgressEvent| {
            let _ = tx.send(event.clone());
        });
    let session = MgaSession::init();
    session.configure(cfg.flow()?, callbacks)?;

    if cfg.mode == Mode::Erase {
        session.erase_offline_flash()?;
        log::info!("Erase request sent");
        return Ok(());
    }

    let data = file.load()?;
    let mut served = None;
    session.session_start()?;
    match cfg.mode {
        Mode::Online => session.session_send_online_data(data, None)?,
        Mode::Offline => {
            let date = cfg.date.unwrap_or_else(|| Utc::now().date_naive());
            let today = get_todays_offline_data(date, &data)?;
            session.session_send_offline_data(today, &TimeAdjust::absolute(Utc::now(), 10, 0), None)?
        }
        Mode::Flash => session.session_send_offline_to_flash(data)?,
        Mode::LegacyFlash => session.session_send_legacy_offline_to_flash(data)?,
        Mode::LegacyServer => {
            served = Some(data.clone());
            let file_id = session.start_legacy_aiding(data)?;
            log::info!("Serving ALP data as file {file_id}, press Ctrl-C to stop");
        }
        Mode::Restore => session.session_send_database(data)?,
        Mode::Erase | Mode::Database => unreachable!(),
    }

    let mut port = port;
    let mut progress = Progress::default();
    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 1024];
    let mut done = false;
    while !done {
        if !RUNNING.load(Ordering::SeqCst) {
            if let Some(original) = &served {
                let updated = session.stop_legacy_aiding()?;
                if &updated != original {
                    log::info!("Receiver updated the ALP data, saving");
                    file.store(&updated)?;
                }
            } else {
                session.session_stop()?;
            }
            done = true;
        } else {
            match port.read(&mut buf) {
                Ok(n) => {
                    for frame in reassembler.push(&buf[..n]) {
                        session.process_receiver_message(&frame)?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            session.check_for_timeouts()?;
        }
        for event in rx.try_iter() {
            done |= progress.show(&event);
        }
    }
    session.deinit();
    Ok(())
}

fn save_database(mut port: Box<dyn SerialPort>, file: &StoreCfg) -> Result<(), Box<dyn Error>> {
    port.write_all(&poll_frame())?;
    let mut collector = DatabaseCollector::new();
    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 1024];
    let mut last = Instant::now();
    while RUNNING.load(Ordering::SeqCst) && !collector.is_complete() {
        if last.elapsed() > DATABASE_IDLE {
            return Err("Receiver stopped sending its database".into());
        }
        match port.read(&mut buf) {
            Ok(n) => {
                for frame in reassembler.push(&buf[..n]) {
                    if collector.push(&frame)? != CollectStatus::Ignored {
                        last = Instant::now();
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
    if !collector.is_complete() {
        return Err("Interrupted".into());
    }
    log::info!("Received {} database messages", collector.messages());
    file.store(&collector.into_data())?;
    Ok(())
}

#[derive(Debug, Default)]
struct Progress {
    total: usize,
    complete: usize,
    failed: usize,
}

impl Progress {
    /// Print an event, returns whether the transfer is over
    fn show(&mut self, event: &ProgressEvent) -> bool {
        let width = terminal::size().map(|s| s.0 as usize).unwrap_or(80);
        match event {
            ProgressEvent::Start { messages } => {
                self.total = *messages;
                println!("{:-<width$}", format!("Transferring {messages} messages "));
            }
            ProgressEvent::MsgSent(_) | ProgressEvent::FlashBlockSent(_) => {}
            ProgressEvent::MsgTransferComplete(_) | ProgressEvent::FlashBlockComplete(_) => {
                self.complete += 1;
                print!("\r{}/{} acknowledged", self.complete, self.total);
                let _ = std::io::stdout().flush();
            }
            ProgressEvent::MsgTransferFailed(msg) => {
                self.failed += 1;
                println!(
                    "\nMessage {} (UBX {:02X}/{:02X}) failed: {:?}",
                    msg.sequence, msg.class, msg.id, msg.failure
                );
            }
            ProgressEvent::FlashBlockRetry(block) => {
                println!("\nResending flash block {}", block.sequence);
            }
            ProgressEvent::Finish => {
                println!(
                    "\n{:=<width$}",
                    format!("Finished, {} of {} failed ", self.failed, self.total)
                );
            }
            ProgressEvent::Terminated(reason) => {
                println!("\n{:=<width$}", format!("Terminated: {reason:?} "));
            }
            ProgressEvent::ServiceError { kind, detail } => {
                eprintln!("Service error {kind:?}: {detail}");
            }
            ProgressEvent::Legacy(LegacyAidingEvent::FlashBlockComplete(block)) => {
                print!("\rALP block {} stored", block.sequence);
                let _ = std::io::stdout().flush();
            }
            ProgressEvent::Legacy(LegacyAidingEvent::FlashBlockSent(_)) => {}
            ProgressEvent::Legacy(event) => println!("{event:?}"),
        }
        event.is_terminal()
    }
}
