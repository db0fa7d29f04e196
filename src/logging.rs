//! Logger setup for the `liquid_frame` binaries.
use crate::config::LoggingConfig;
use log::Level;
use std::str::FromStr;

/// Installs `simple_logger` at the level named in `config`, falling back to
/// `info` for a name that isn't a level. A logger installed earlier in the
/// process is left in place.
pub fn init(config: &LoggingConfig) {
    let level = Level::from_str(&config.level).unwrap_or(Level::Info);
    if simple_logger::init_with_level(level).is_err() {
        log::debug!("A logger was already installed");
    }
}
