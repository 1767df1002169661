//! Per-run log context: a scoped subscriber writing `<log_root>/<date>/migration.log`
//! and stderr. Dropping [`RunLogging`] uninstalls it.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tracing::subscriber::DefaultGuard;
use tracing::Level;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "migration.log";

pub struct RunLogging {
    path: PathBuf,
    _guard: DefaultGuard,
}

impl RunLogging {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Installs the run's subscriber on the current thread.
pub fn init_run_logging(log_root: &Path, date: NaiveDate, level: Level) -> io::Result<RunLogging> {
    let dir = sfm_sync::dated_dir(log_root, date);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(level))
        .with(
            fmt::layer()
                .with_writer(SharedFileWriter::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .with(fmt::layer().with_writer(io::stderr).with_target(false));

    Ok(RunLogging {
        path,
        _guard: tracing::subscriber::set_default(subscriber),
    })
}

#[derive(Clone)]
struct SharedFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl SharedFileWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

struct SharedFileGuard {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for SharedFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .flush()
    }
}

impl<'a> MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileGuard {
            file: Arc::clone(&self.file),
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,sf_migrate={level},sfm_core={level},sfm_storage={level},\
             sfm_adapters={level},sfm_sync={level}",
            level = level.as_str().to_lowercase()
        ))
    })
}
