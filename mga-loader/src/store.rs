use std::{
    fmt::{self, Display, Formatter},
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Raw,
    Gzip,
}

impl StoreKind {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => StoreKind::Gzip,
            _ => StoreKind::Raw,
        }
    }
}

impl Display for StoreKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            StoreKind::Raw => write!(f, "ubx"),
            StoreKind::Gzip => write!(f, "gz"),
        }
    }
}

#[derive(Debug)]
/// An assistance data file
pub struct StoreCfg {
    path: PathBuf,
    kind: StoreKind,
}

impl StoreCfg {
    pub fn new(path: PathBuf) -> Self {
        let kind = StoreKind::of(&path);
        Self { path, kind }
    }

    pub fn load(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut data = Vec::new();
        match self.kind {
            StoreKind::Raw => {
                File::open(&self.path)?.read_to_end(&mut data)?;
            }
            StoreKind::Gzip => {
                GzDecoder::new(File::open(&self.path)?).read_to_end(&mut data)?;
            }
        }
        log::info!("Loaded {} bytes from {:?} ({})", data.len(), self.path, self.kind);
        Ok(data)
    }

    pub fn store(&self, data: &[u8]) -> Result<(), std::io::Error> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = File::create(&self.path)?;
        match self.kind {
            StoreKind::Raw => {
                let mut file = file;
                file.write_all(data)?;
                file.flush()?;
            }
            StoreKind::Gzip => {
                let mut enc = GzEncoder::new(file, Compression::default());
                enc.write_all(data)?;
                enc.finish()?.flush()?;
            }
        }
        log::info!("Stored {} bytes to {:?} ({})", data.len(), self.path, self.kind);
        Ok(())
    }
}
