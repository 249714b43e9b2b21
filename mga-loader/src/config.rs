use std::{fmt, path::PathBuf, str::FromStr};

use argh::FromArgs;
use chrono::NaiveDate;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use ublox_mga::FlowConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// What to do with the receiver
pub enum Mode {
    /// Send AssistNow Online data
    Online,
    /// Send today's part of AssistNow Offline data
    Offline,
    /// Store AssistNow Offline data in flash
    Flash,
    /// Store a legacy ALP file in flash
    LegacyFlash,
    /// Serve a legacy ALP file until interrupted
    LegacyServer,
    /// Erase the offline data in flash
    Erase,
    /// Save the navigation database to a file
    Database,
    /// Restore the navigation database from a file
    Restore,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Mode::Online),
            "offline" => Ok(Mode::Offline),
            "flash" => Ok(Mode::Flash),
            "legacy-flash" => Ok(Mode::LegacyFlash),
            "legacy-server" => Ok(Mode::LegacyServer),
            "erase" => Ok(Mode::Erase),
            "database" => Ok(Mode::Database),
            "restore" => Ok(Mode::Restore),
            _ => Err(format!("unknown mode {s:?}")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Mode::Online => "online",
            Mode::Offline => "offline",
            Mode::Flash => "flash",
            Mode::LegacyFlash => "legacy-flash",
            Mode::LegacyServer => "legacy-server",
            Mode::Erase => "erase",
            Mode::Database => "database",
            Mode::Restore => "restore",
        };
        write!(f, "{name}")
    }
}

#[derive(FromArgs, Serialize, Deserialize, Debug)]
/// Load AssistNow data into a u-blox receiver
pub struct LoaderCfg {
    /// serial device, the saved configuration is used if omitted
    #[argh(positional)]
    pub serial_port: Option<String>,
    /// baud rate
    #[argh(option, default = "115200")]
    pub baud_rate: u32,
    /// serial read timeout in milliseconds
    #[argh(option, default = "100")]
    pub timeout: u64,
    /// assistance data file, gzip-compressed if it ends in .gz
    #[argh(option, default = "PathBuf::from(\"mga.ubx\")")]
    pub file: PathBuf,
    /// online, offline, flash, legacy-flash, legacy-server, erase, database or restore
    #[argh(option, default = "Mode::Online")]
    pub mode: Mode,
    /// UTC date to pick offline data for, today if omitted
    #[argh(option)]
    pub date: Option<NaiveDate>,
    /// JSON5 file with flow control settings
    #[argh(option)]
    pub flow_config: Option<PathBuf>,
    /// save these options as the defaults
    #[argh(switch)]
    #[serde(skip)]
    pub save_config: bool,
}

impl LoaderCfg {
    /// Store the configuration in the default location
    pub fn store_default(&self) -> Result<(), std::io::Error> {
        let mut path = get_default_path();
        std::fs::create_dir_all(&path)?;
        path.push("config.json");
        std::fs::write(
            path,
            serde_json::to_string(self)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?,
        )
    }

    /// Load the configuration from the default location
    pub fn load_default() -> Result<Self, std::io::Error> {
        let mut path = get_default_path();
        path.push("config.json");
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Flow control settings, from `flow_config` if given
    pub fn flow(&self) -> Result<FlowConfig, std::io::Error> {
        let Some(path) = &self.flow_config else {
            return Ok(FlowConfig::default());
        };
        let text = std::fs::read_to_string(path)?;
        json5::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn get_default_path() -> PathBuf {
    if let Some(path) = ProjectDirs::from("", "", "ublox_mga_loader") {
        path.config_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    }
}
