//! Log initialisation
//!
//! Everything goes to stderr (stdout carries the protocol) and, when enabled,
//! is appended to a log file as well.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use once_cell::sync::OnceCell;

use crate::config::ServerConfig;

static LOG_FILE: OnceCell<PathBuf> = OnceCell::new();

/// Copies log output to stderr and an optional file
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            // stderr still has the record if this fails
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        io::stderr().flush()
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize logging. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &ServerConfig) {
    let file = config.log_path().and_then(|path| match open_log_file(&path) {
        Ok(file) => {
            let _ = LOG_FILE.set(path);
            Some(file)
        }
        Err(e) => {
            eprintln!("Cannot open log file {}: {}", path.display(), e);
            None
        }
    });

    let result = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "[{}] [{}] [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    })
    .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
    .try_init();

    if result.is_err() {
        log::debug!("Logger already initialised");
    }
    log::info!("midimcp {} started", env!("CARGO_PKG_VERSION"));
}

/// Log file in use, if any
pub fn log_file_path() -> Option<&'static Path> {
    LOG_FILE.get().map(PathBuf::as_path)
}
