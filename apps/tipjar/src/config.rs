use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "tipjar.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub catalog_path: PathBuf,
    pub product_identifiers: Vec<String>,
    pub finish_restored_transactions: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/tipjar.db".into(),
            catalog_path: PathBuf::from("demos/catalog.json"),
            product_identifiers: vec![
                "tip_small".into(),
                "tip_large".into(),
                "supporter_monthly".into(),
                "supporter_yearly".into(),
            ],
            finish_restored_transactions: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    catalog_path: Option<PathBuf>,
    product_identifiers: Option<Vec<String>>,
    finish_restored_transactions: Option<bool>,
}

/// Defaults, then the toml file at `path` if present, then `APP__*`
/// environment variables.
pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "config: ignoring unreadable file"
            ),
        }
    }

    apply_env_overrides(&mut settings, |key| env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.catalog_path {
        settings.catalog_path = v;
    }
    if let Some(v) = file_cfg.product_identifiers {
        settings.product_identifiers = v;
    }
    if let Some(v) = file_cfg.finish_restored_transactions {
        settings.finish_restored_transactions = v;
    }
}

fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__CATALOG_PATH") {
        settings.catalog_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("APP__PRODUCT_IDENTIFIERS") {
        settings.product_identifiers = v
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = lookup("APP__FINISH_RESTORED_TRANSACTIONS") {
        match parse_flag(&v) {
            Some(flag) => settings.finish_restored_transactions = flag,
            None => warn!(
                value = %v,
                "config: APP__FINISH_RESTORED_TRANSACTIONS is not a boolean"
            ),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Accepts plain file paths as well as sqlite urls. The ledger creates the
/// parent directory when it opens the database.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
