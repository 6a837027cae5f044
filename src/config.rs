//! Runtime configuration.
//!
//! Set programmatically through [`Config::builder`] or read from the
//! environment with [`Config::from_env`]:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ALLOCTYPE_TYPE_FILE` | Path of the type database | `types.json` |
//! | `ALLOCTYPE_STACKTRACE` | Attach call stacks to failed buffer checks | false |
//! | `ALLOCTYPE_LOG_LEVEL` | off/error/warn/info/debug/trace or 0-5 | `RUST_LOG`, else warn |
//! | `ALLOCTYPE_SOURCE_LOCATION` | Resolve call sites in diagnostics: none/error/all | error |

use std::{env, path::PathBuf};

use once_cell::sync::OnceCell;

pub const TYPE_FILE_VAR: &str = "ALLOCTYPE_TYPE_FILE";
pub const STACKTRACE_VAR: &str = "ALLOCTYPE_STACKTRACE";
pub const LOG_LEVEL_VAR: &str = "ALLOCTYPE_LOG_LEVEL";
pub const SOURCE_LOCATION_VAR: &str = "ALLOCTYPE_SOURCE_LOCATION";

pub const DEFAULT_TYPE_FILE: &str = "types.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Which diagnostics look up the source location of their call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceLocationMode {
    None,
    /// Errors only
    #[default]
    Error,
    All,
}

impl SourceLocationMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" => Some(SourceLocationMode::None),
            "error" => Some(SourceLocationMode::Error),
            "all" => Some(SourceLocationMode::All),
            _ => None,
        }
    }

    pub fn applies_to(self, level: log::Level) -> bool {
        match self {
            SourceLocationMode::None => false,
            SourceLocationMode::Error => level == log::Level::Error,
            SourceLocationMode::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub type_file: PathBuf,
    /// Whether `type_file` was chosen explicitly; a missing default file is
    /// not an error.
    pub type_file_explicit: bool,
    pub stacktrace: bool,
    /// `None` defers to `RUST_LOG`
    pub log_level: Option<LogLevel>,
    pub source_location: SourceLocationMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            type_file: PathBuf::from(DEFAULT_TYPE_FILE),
            type_file_explicit: false,
            stacktrace: false,
            log_level: None,
            source_location: SourceLocationMode::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`Config::from_env`], with variables looked up through `var`.
    /// Invalid values are ignored with a warning.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var(TYPE_FILE_VAR).filter(|path| !path.is_empty()) {
            config.type_file = PathBuf::from(path);
            config.type_file_explicit = true;
        }
        if let Some(value) = var(STACKTRACE_VAR) {
            match parse_bool(&value) {
                Some(enabled) => config.stacktrace = enabled,
                None => log::warn!("Ignoring {STACKTRACE_VAR}={value}, expected a boolean"),
            }
        }
        if let Some(value) = var(LOG_LEVEL_VAR) {
            match LogLevel::from_str(&value) {
                Some(level) => config.log_level = Some(level),
                None => log::warn!("Ignoring {LOG_LEVEL_VAR}={value}, expected a log level"),
            }
        }
        if let Some(value) = var(SOURCE_LOCATION_VAR) {
            match SourceLocationMode::from_str(&value) {
                Some(mode) => config.source_location = mode,
                None => log::warn!("Ignoring {SOURCE_LOCATION_VAR}={value}, expected none/error/all"),
            }
        }

        config
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Use the type database at `path`; failing to load it is an error.
    pub fn type_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.type_file = path.into();
        self.config.type_file_explicit = true;
        self
    }

    pub fn stacktrace(mut self, enabled: bool) -> Self {
        self.config.stacktrace = enabled;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = Some(level);
        self
    }

    pub fn source_location(mut self, mode: SourceLocationMode) -> Self {
        self.config.source_location = mode;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

static LOGGER: OnceCell<()> = OnceCell::new();

/// Install the logger, once per process. Later calls are ignored, as is an
/// already installed logger from someone else.
pub fn init_logging(level: Option<LogLevel>) {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(log::LevelFilter::Warn);
        builder.parse_default_env();
        if let Some(level) = level {
            builder.filter_level(level.to_filter());
        }
        let _ = builder.try_init();
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.type_file, PathBuf::from("types.json"));
        assert!(!config.type_file_explicit);
    }

    #[test]
    fn variables_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            (TYPE_FILE_VAR, "/tmp/app-types.json"),
            (STACKTRACE_VAR, "yes"),
            (LOG_LEVEL_VAR, "4"),
            (SOURCE_LOCATION_VAR, "ALL"),
        ]));
        assert_eq!(config.type_file, PathBuf::from("/tmp/app-types.json"));
        assert!(config.type_file_explicit);
        assert!(config.stacktrace);
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.source_location, SourceLocationMode::All);
    }

    #[test]
    fn invalid_values_are_ignored() {
        let config = Config::from_lookup(lookup(&[
            (STACKTRACE_VAR, "maybe"),
            (LOG_LEVEL_VAR, "loud"),
            (SOURCE_LOCATION_VAR, "some"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn builder_matches_lookup() {
        let built = Config::builder()
            .type_file("/tmp/app-types.json")
            .stacktrace(true)
            .log_level(LogLevel::Debug)
            .source_location(SourceLocationMode::All)
            .build();
        let looked_up = Config::from_lookup(lookup(&[
            (TYPE_FILE_VAR, "/tmp/app-types.json"),
            (STACKTRACE_VAR, "1"),
            (LOG_LEVEL_VAR, "debug"),
            (SOURCE_LOCATION_VAR, "all"),
        ]));
        assert_eq!(built, looked_up);
    }

    #[test]
    fn log_levels() {
        assert_eq!(LogLevel::from_str("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("0"), Some(LogLevel::Off));
        assert_eq!(LogLevel::Trace.to_filter(), log::LevelFilter::Trace);
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert!(SourceLocationMode::Error.applies_to(log::Level::Error));
        assert!(!SourceLocationMode::Error.applies_to(log::Level::Warn));
        assert!(!SourceLocationMode::None.applies_to(log::Level::Error));
    }
}
