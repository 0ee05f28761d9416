//! Boot parameters
//!
//! Parameters are given as `key=value` arguments, named after the hypervisor command line options
//! they stand in for:
//!
//! * `gnttab_max_frames`: maximum grant frames per domain
//! * `gnttab_max_maptrack_frames`: maximum map-track frames per domain
//! * `gnttab_initial_frames`: grant frames allocated at domain creation
//! * `loglvl`: one of `none`, `error`, `warning`, `info`, `debug`, `all`

use {
    displaydoc::Display,
    gnttab::grant_table::GrantTableConfig,
    log::LevelFilter,
    std::str::FromStr,
};

/// Boot parameter error
#[derive(Debug, Display, PartialEq, Eq)]
pub enum ConfigError {
    /// boot parameter `{0}` is not of the form key=value
    MissingValue(String),
    /// invalid value `{value}` for boot parameter `{key}`
    InvalidValue {
        /// Parameter name
        key: String,
        /// Rejected value
        value: String,
    },
    /// unknown log level `{0}`
    InvalidLogLevel(String),
    /// grant table limits are inconsistent
    InvalidLimits,
}

impl std::error::Error for ConfigError {}

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Grant table limits of every domain
    pub grant_table: GrantTableConfig,
    /// Maximum log level
    pub log_level: LevelFilter,
    /// Parameters that were not recognised
    pub unknown: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grant_table: GrantTableConfig::default(),
            log_level: LevelFilter::Info,
            unknown: Vec::new(),
        }
    }
}

fn parse_frames(key: &str, value: &str) -> Result<usize, ConfigError> {
    usize::from_str(value).map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_level(value: &str) -> Result<LevelFilter, ConfigError> {
    match value {
        "none" => Ok(LevelFilter::Off),
        "warning" => Ok(LevelFilter::Warn),
        "all" => Ok(LevelFilter::Trace),
        _ => LevelFilter::from_str(value)
            .map_err(|_| ConfigError::InvalidLogLevel(value.to_owned())),
    }
}

impl Config {
    /// Parses boot parameters, later parameters overriding earlier ones
    pub fn parse<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();

        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| ConfigError::MissingValue(arg.to_owned()))?;

            match key {
                "gnttab_max_frames" => config.grant_table.max_grant_frames = parse_frames(key, value)?,
                "gnttab_max_maptrack_frames" => {
                    config.grant_table.max_maptrack_frames = parse_frames(key, value)?
                }
                "gnttab_initial_frames" => {
                    config.grant_table.initial_frames = parse_frames(key, value)?
                }
                "loglvl" => config.log_level = parse_level(value)?,
                _ => config.unknown.push(arg.to_owned()),
            }
        }

        config
            .grant_table
            .validate()
            .map_err(|_| ConfigError::InvalidLimits)?;

        Ok(config)
    }
}
