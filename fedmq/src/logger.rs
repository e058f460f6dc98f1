use std::fs::{self, File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use slog::{o, Drain, Level, LevelFilter, Logger};
use slog_async::AsyncGuard;

use fedmq_conf::logging::{Log, To};
use fedmq_utils::format_timestamp_millis_now;

use crate::{FedError, Result};

/// Installs the slog drain described by `cfg` as the backend of the `log` facade.
///
/// Keep the returned guard alive, dropping it flushes and stops the async drain.
pub fn logger_init(cfg: &Log) -> Result<AsyncGuard> {
    let (logger, guard) = config_logger(&cfg.filename(), cfg.to, cfg.level.inner())?;
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| FedError::Msg(format!("logger init, {e}")))?;
    log::set_max_level(slog_log_to_level(cfg.level.inner()).to_level_filter());
    Ok(guard)
}

pub fn config_logger(filename: &str, to: To, level: Level) -> Result<(Logger, AsyncGuard)> {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(filename, to)?);
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp_local).build().ignore_res();
    let drain = LevelFilter::new(drain, level).fuse();
    let (drain, guard) = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build_with_guard();
    Ok((Logger::root(drain.fuse(), o!()), guard))
}

fn timestamp_local(io: &mut dyn io::Write) -> io::Result<()> {
    write!(io, "{}", format_timestamp_millis_now())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> Level {
    match level {
        log::Level::Trace => Level::Trace,
        log::Level::Debug => Level::Debug,
        log::Level::Info => Level::Info,
        log::Level::Warn => Level::Warning,
        log::Level::Error => Level::Error,
    }
}

fn slog_log_to_level(level: Level) -> log::Level {
    match level {
        Level::Trace => log::Level::Trace,
        Level::Debug => log::Level::Debug,
        Level::Info => log::Level::Info,
        Level::Warning => log::Level::Warn,
        Level::Error | Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();
    slog::RecordLocation { file, line, column: 0, function: "", module }
}

//Fans formatted records out to the console, the log file, both or nowhere.
struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: &str, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if filename.is_empty() {
        return Err(FedError::Msg("logger file config error, file name is empty".into()));
    }
    if let Some(dir) = Path::new(filename).parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| FedError::Msg(format!("logger file config error, filename: {filename}, {e:?}")))
}
