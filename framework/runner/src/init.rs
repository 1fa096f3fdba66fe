use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::cli::BlasterCli;
use crate::types::BlasterResult;

/// Full log of a run, everything from info up.
pub const FULL_LOG_NAME: &str = "pcap_blaster_full";
/// Warnings and errors only.
pub const ERROR_LOG_NAME: &str = "pcap_blaster_errors";

/// Initialise the CLI and logging for pcap-blaster.
///
/// Console output is controlled by `RUST_LOG` as usual and defaults to `info`. The returned
/// [LogSinks] has the dated log files under `log/` attached already, more can be attached once the
/// run directory is known.
pub fn init() -> BlasterResult<(BlasterCli, LogSinks)> {
    let sinks = init_logging()?;
    sinks
        .attach_dated(Path::new("log"))
        .context("Failed to open log files")?;

    Ok((BlasterCli::parse(), sinks))
}

fn init_logging() -> BlasterResult<LogSinks> {
    let console = env_logger::Builder::from_env(Env::default().default_filter_or("info")).build();
    let sinks = LogSinks::default();

    let max_level = console.filter().max(LevelFilter::Info);
    log::set_boxed_logger(Box::new(TeeLogger {
        console,
        sinks: sinks.clone(),
    }))
    .context("Logger already initialised")?;
    log::set_max_level(max_level);

    Ok(sinks)
}

/// Log files that receive a copy of every record at or above their level.
#[derive(Clone, Default)]
pub struct LogSinks {
    inner: Arc<Mutex<Vec<FileSink>>>,
}

struct FileSink {
    level: LevelFilter,
    file: File,
}

impl LogSinks {
    /// Append records at or above `level` to the file at `path`.
    pub fn attach(&self, path: &Path, level: LevelFilter) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.inner.lock().push(FileSink { level, file });
        Ok(())
    }

    /// The full and error logs for today, in `dir`.
    pub fn attach_dated(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let date = chrono::Local::now().format("%Y-%m-%d");
        self.attach(
            &dir.join(format!("{FULL_LOG_NAME}_{date}.log")),
            LevelFilter::Info,
        )?;
        self.attach(
            &dir.join(format!("{ERROR_LOG_NAME}_{date}.log")),
            LevelFilter::Warn,
        )
    }

    /// The full and error logs of a run, in its run directory.
    pub fn attach_run_dir(&self, dir: &Path) -> std::io::Result<()> {
        self.attach(&dir.join(format!("{FULL_LOG_NAME}.log")), LevelFilter::Info)?;
        self.attach(&dir.join(format!("{ERROR_LOG_NAME}.log")), LevelFilter::Warn)
    }

    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner
            .lock()
            .iter()
            .any(|sink| metadata.level() <= sink.level)
    }

    fn write(&self, record: &Record) {
        let mut sinks = self.inner.lock();
        if sinks.iter().all(|sink| record.level() > sink.level) {
            return;
        }

        let line = format_line(record);
        for sink in sinks.iter_mut().filter(|sink| record.level() <= sink.level) {
            // Nowhere to report a failing log file.
            let _ = sink.file.write_all(line.as_bytes());
        }
    }
}

fn format_line(record: &Record) -> String {
    format!(
        "[{}] {} | {} | {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.target(),
        record.args()
    )
}

struct TeeLogger {
    console: env_logger::Logger,
    sinks: LogSinks,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || self.sinks.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.console.enabled(record.metadata()) {
            self.console.log(record);
        }
        self.sinks.write(record);
    }

    fn flush(&self) {
        self.console.flush();
        for sink in self.sinks.inner.lock().iter_mut() {
            let _ = sink.file.flush();
        }
    }
}
