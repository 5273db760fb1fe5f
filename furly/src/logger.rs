//! Logging bootstrap.
//!
//! Library code logs through the `log` macros; [`logger_init`] installs a
//! bridge that forwards those records into an asynchronous `slog` drain.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use slog::{o, Drain};

use furly_conf::logging::{Log, To};
pub use slog::Logger;

/// Builds the root logger from `cfg` and routes the `log` macros into it.
pub fn logger_init(cfg: &Log) -> Result<Logger> {
    let level = cfg.level.inner();
    let logger = config_logger(cfg.filename(), cfg.to, level)?;
    log::set_boxed_logger(Box::new(Bridge(logger.clone())))
        .map_err(|e| anyhow!("logger already initialized, {}", e))?;
    log::set_max_level(to_log_level(level).to_level_filter());
    Ok(logger)
}

/// Forwards `log` records to a `slog` logger.
struct Bridge(Logger);

impl log::Log for Bridge {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let location = slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let s = slog::RecordStatic { location: &location, level: to_slog_level(r.level()), tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn timestamp_local(io: &mut dyn Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// A terminal formatted, asynchronous logger writing to `to`.
///
/// The log file, when one is needed, is created up front.
pub fn config_logger(filename: String, to: To, level: slog::Level) -> Result<Logger> {
    let output = Output::open(&filename, to)?;
    let decorator = slog_term::PlainSyncDecorator::new(output);
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(timestamp_local)
        .use_file_location()
        .build()
        .fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// The sinks selected by [`To`].
struct Output {
    console: Option<io::Stdout>,
    file: Option<File>,
}

impl Output {
    fn open(filename: &str, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(filename)?) } else { None };
        let console = if to.console() { Some(io::stdout()) } else { None };
        Ok(Self { console, file })
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(console) = self.console.as_mut() {
            console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(console) = self.console.as_mut() {
            console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if filename.is_empty() {
        return Err(anyhow!("logger file config error, no file name"));
    }
    if let Some(dir) = Path::new(filename).parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("logger file config error, dir: {:?}, {:?}", dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("logger file config error, filename: {}, {:?}", filename, e))
}
