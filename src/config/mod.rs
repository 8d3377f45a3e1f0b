//! Configuration loading.
//!
//! Defaults are overlaid by an optional `config/default.*` file and then by
//! `MENTORBRIDGE__<SECTION>__<KEY>` environment variables (a `.env` file is
//! honoured). The result is one immutable `Settings` value.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    AuthSettings, BrokerSettings, LoggingSettings, MembershipSettings, ModelSettings,
    ServerSettings, Settings, WorkerSettings,
};

pub const ENV_PREFIX: &str = "MENTORBRIDGE";

/// Loads the configuration from `config/default` and the environment,
/// merged with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    load_config_from("config/default")
}

/// Same as [`load_config`] but reads the optional file at `path`
/// (extension inferred by the `config` crate).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
