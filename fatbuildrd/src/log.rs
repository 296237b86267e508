//! Logging setup.
//!
//! `env_logger`-based, following `tools/pipesys/src/cmd/mod.rs::init_logger`:
//! pick up an explicit level if given, otherwise defer to `RUST_LOG`,
//! scoped to this crate's name so dependency crates stay quiet unless the
//! caller opts into full debug.

use ::log::LevelFilter;
use env_logger::Builder;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

pub fn init_logger(level: Option<LevelFilter>, fulldebug: bool) {
    let mut builder = if std::env::var_os("RUST_LOG").is_some() && level.is_none() {
        Builder::from_default_env()
    } else {
        let mut builder = Builder::new();
        if fulldebug {
            builder.filter_level(level.unwrap_or(DEFAULT_LEVEL));
        } else {
            builder.filter(Some(env!("CARGO_CRATE_NAME")), level.unwrap_or(DEFAULT_LEVEL));
        }
        builder
    };
    builder.init();
}

/// Per-task log sink, duplicated into a task's console journal.
///
/// The original daemon filtered thread-scoped handlers by `threadName ==
/// "worker-{instance}"`. Rust's `log` crate has no per-thread handler
/// registry, so instead each worker thread installs this as a thin wrapper
/// around a channel to the task's `TaskIO`, and removes it when the task
/// ends; see `tasks::io::TaskIo::attach_log`.
pub struct TaskLogRecord {
    pub level: ::log::Level,
    pub message: String,
}

impl TaskLogRecord {
    pub fn from_record(record: &::log::Record) -> Self {
        TaskLogRecord {
            level: record.level(),
            message: format!("{}", record.args()),
        }
    }

    /// Render as `LEVEL_AS_INT:message`, matching the original wire format
    /// consumed by `console::client::tty_console_renderer_log`.
    pub fn to_wire(&self) -> String {
        format!("{}:{}", level_to_int(self.level), self.message)
    }
}

fn level_to_int(level: ::log::Level) -> u8 {
    // Mirrors Python's logging module level integers, since the wire format
    // and rendering table are shared with the original.
    match level {
        ::log::Level::Error => 40,
        ::log::Level::Warn => 30,
        ::log::Level::Info => 20,
        ::log::Level::Debug => 10,
        ::log::Level::Trace => 10,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format() {
        let record = TaskLogRecord {
            level: ::log::Level::Warn,
            message: "disk almost full".to_string(),
        };
        assert_eq!(record.to_wire(), "30:disk almost full");
    }
}
