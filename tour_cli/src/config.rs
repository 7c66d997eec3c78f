//! Layered configuration: environment variables (prefixed `TOUR`) override a local config file
//! (same execution directory as the process) override the standard appdata config file.
//!
//! Follows `st_http::config::initialise_config` exactly, generalised from one `Config` struct to
//! wrap [`tour_system::config::TourSystemConfig`].

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tour_system::config::TourSystemConfig;

static CONFIG_FILE: &str = "tour_config.toml";

/// Initialise the config file.
///
/// Creates a new config file if it doesn't yet exist, otherwise loads the existing one.
///
/// Priority order (most to least important):
/// 1. Environment variables prefixed by `TOUR`
/// 2. Local config file (same execution directory as process)
/// 3. Standard config file, located in the appdata directory.
pub fn initialise_config() -> eyre::Result<Config> {
    let c_path = get_full_config_path();

    if !c_path.exists() {
        save_config(&Config::default())?;
    }

    let c = config::Config::builder()
        .add_source(config::File::with_name(&c_path.to_string_lossy()).required(true))
        .add_source(config::File::with_name(CONFIG_FILE).required(false))
        .add_source(config::Environment::with_prefix("TOUR"))
        .build()?;

    Ok(c.try_deserialize()?)
}

/// Save the provided config to the known config directory.
pub fn save_config(app_settings: &Config) -> eyre::Result<()> {
    std::fs::create_dir_all(get_config_directory())?;

    let mut config_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(get_full_config_path())?;

    let basic_output = toml::to_string_pretty(app_settings)?;
    config_file.write_all(basic_output.as_bytes())?;

    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub system: TourSystemConfig,
    #[serde(default)]
    pub group_mode: bool,
}

/// Retrieve the *full* path to the config file.
pub fn get_full_config_path() -> PathBuf {
    get_config_directory().join(CONFIG_FILE)
}

/// Retrieve the directory which will be used to locate/save the config file.
pub fn get_config_directory() -> PathBuf {
    tour_system::get_app_dirs().config_dir
}
