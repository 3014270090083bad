use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Colored, boot-relative timestamped console logger
struct AgentLogger;

impl log::Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now().duration_since(*boot_time).unwrap_or_default();
        let color = match record.level() {
            Level::Error => colors::BRIGHT_RED,
            Level::Warn => colors::BRIGHT_YELLOW,
            Level::Info => colors::BRIGHT_GREEN,
            Level::Debug => colors::BRIGHT_BLUE,
            Level::Trace => colors::GRAY,
        };
        let line = format_line(
            elapsed,
            record.level(),
            record.module_path().unwrap_or("unknown"),
            &record.args().to_string(),
        );
        println!("{}{}{}", color, line, colors::RESET);
    }

    fn flush(&self) {}
}

static LOGGER: AgentLogger = AgentLogger;

/// Install the console logger at `Info`
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(SystemTime::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);
    println!(
        "{}twin-ota-agent {} logger ready{}",
        colors::BRIGHT_GREEN,
        env!("CARGO_PKG_VERSION"),
        colors::RESET
    );
    Ok(())
}

/// `"  3.042s"`, `" 2m05s"` or `" 1h07m"` depending on uptime
pub fn compact_timestamp(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, elapsed.subsec_millis())
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

pub fn format_line(elapsed: Duration, level: Level, module_path: &str, message: &str) -> String {
    let level_char = match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    };
    let module = module_path.rsplit("::").next().unwrap_or(module_path);
    let module = module.get(..12).unwrap_or(module);
    format!("{} [{}] {:>12} | {}", compact_timestamp(elapsed), level_char, module, message)
}

pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(filter) => {
            log::set_max_level(filter);
            true
        }
        None => false,
    }
}
