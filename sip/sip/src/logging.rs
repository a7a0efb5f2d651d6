//! Per category logging with an optional application hook
//!
//! Everything the user agent logs goes through the [`log`] crate with the category as target.
//! A [`LogConnector`] additionally receives every message that passes the configured level.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Receives `(level, category, message)` for every message that passes the configured level
pub type LogConnector = Arc<dyn Fn(log::Level, &str, &str) + Send + Sync>;

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Forward messages to the [`log`] crate
    pub builtin_enabled: bool,

    /// 0 = error, 1 = warn, 2 = log, 3 = debug
    pub level: u8,

    #[serde(skip)]
    pub connector: Option<LogConnector>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            builtin_enabled: true,
            level: 2,
            connector: None,
        }
    }
}

impl fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConfig")
            .field("builtin_enabled", &self.builtin_enabled)
            .field("level", &self.level)
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

impl LogConfig {
    fn max_level(&self) -> log::Level {
        match self.level {
            0 => log::Level::Error,
            1 => log::Level::Warn,
            2 => log::Level::Info,
            _ => log::Level::Debug,
        }
    }
}

/// Logger of one category, e.g. `sip.ua` or `sip.transport`
#[derive(Clone)]
pub(crate) struct Logger {
    category: &'static str,
    config: LogConfig,
}

impl Logger {
    pub(crate) fn new(category: &'static str, config: &LogConfig) -> Self {
        Self {
            category,
            config: config.clone(),
        }
    }

    pub(crate) fn log(&self, level: log::Level, args: fmt::Arguments<'_>) {
        if level > self.config.max_level() {
            return;
        }

        if self.config.builtin_enabled {
            log::log!(target: self.category, level, "{args}");
        }

        if let Some(connector) = &self.config.connector {
            connector(level, self.category, &args.to_string());
        }
    }

    pub(crate) fn error(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Error, args);
    }

    pub(crate) fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Warn, args);
    }

    pub(crate) fn info(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Info, args);
    }

    pub(crate) fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Debug, args);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;

    fn recording(level: u8) -> (LogConfig, Arc<Mutex<Vec<(log::Level, String, String)>>>) {
        let records = Arc::new(Mutex::new(vec![]));
        let sink = records.clone();

        let config = LogConfig {
            builtin_enabled: false,
            level,
            connector: Some(Arc::new(move |level: log::Level, category: &str, message: &str| {
                sink.lock()
                    .push((level, category.to_owned(), message.to_owned()));
            })),
        };

        (config, records)
    }

    #[test]
    fn connector_receives_messages_up_to_level() {
        let (config, records) = recording(1);
        let logger = Logger::new("sip.ua", &config);

        logger.error(format_args!("broken {}", 1));
        logger.warn(format_args!("careful"));
        logger.info(format_args!("hidden"));
        logger.debug(format_args!("hidden"));

        let records = records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            (log::Level::Error, "sip.ua".to_owned(), "broken 1".to_owned())
        );
        assert_eq!(records[1].0, log::Level::Warn);
    }

    #[test]
    fn debug_level_passes_everything() {
        let (config, records) = recording(3);
        let logger = Logger::new("sip.transport", &config);

        logger.debug(format_args!("details"));

        assert_eq!(records.lock()[0].1, "sip.transport");
    }

    #[test]
    fn deserialize_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"level": 3}"#).unwrap();

        assert!(config.builtin_enabled);
        assert_eq!(config.level, 3);
        assert!(config.connector.is_none());
    }
}
