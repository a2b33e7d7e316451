use std::{env, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "smtp.yandex.ru".to_owned(),
            port: 465,
            login: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageSettings {
    /// Keep reminders in the SQLite file; otherwise they live only for the session.
    pub persistent: bool,
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            persistent: true,
            database_path: PathBuf::from("database.db"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExportSettings {
    pub directory: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent_deliveries: usize,
    pub misfire_grace_secs: u64,
    pub event_queue_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 3,
            misfire_grace_secs: 60,
            event_queue_capacity: 64,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct AppSettings {
    pub smtp: SmtpSettings,
    pub storage: StorageSettings,
    pub export: ExportSettings,
    pub scheduler: SchedulerSettings,
}

impl AppSettings {
    /// Layers, lowest priority first: built-in defaults, `appsettings.*` (or the
    /// given file), `appsettings.local.*`, `APP__SECTION__KEY` variables and
    /// finally `YANDEX_LOGIN` / `YANDEX_PASSWORD`.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = Config::builder();
        let builder = match config_file {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("appsettings").required(false)),
        };

        let settings = builder
            .add_source(File::with_name("appsettings.local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .set_override_option("smtp.login", env::var("YANDEX_LOGIN").ok())?
            .set_override_option("smtp.password", env::var("YANDEX_PASSWORD").ok())?
            .build()?;

        settings.try_deserialize()
    }
}
