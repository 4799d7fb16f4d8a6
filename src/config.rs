use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::matcher::FilterSetDef;

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub email: String,
    pub filters: Vec<FilterSetDef>,
}

#[derive(Debug)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub download: DownloadConfig,
    pub vault_dir: PathBuf,
}

#[derive(Debug)]
pub struct DownloadConfig {
    pub default_days: u32,
    pub base_path: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {}", e),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    download: RawDownloadConfig,
    #[serde(default)]
    vault: RawVaultConfig,
    #[serde(default)]
    account: BTreeMap<String, RawAccountConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDownloadConfig {
    #[serde(default = "default_days")]
    default_days: u32,
    base_path: Option<String>,
}

impl Default for RawDownloadConfig {
    fn default() -> Self {
        Self {
            default_days: default_days(),
            base_path: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVaultConfig {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAccountConfig {
    #[serde(default)]
    filter: Vec<FilterSetDef>,
}

fn default_days() -> u32 {
    7
}

/// Default config location: $XDG_CONFIG_HOME/mailgrab/config.toml, falling
/// back to ~/.config/mailgrab/config.toml.
pub fn default_config_path() -> PathBuf {
    config_home().join("mailgrab").join("config.toml")
}

/// Default vault location, used when [vault] path is absent or no config
/// file exists yet.
pub fn default_vault_dir() -> PathBuf {
    config_home().join("mailgrab").join("vault")
}

fn config_home() -> PathBuf {
    match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else if path == "~" {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
    } else {
        PathBuf::from(path)
    }
}

/// Expand `~` and resolve relative paths against the config file's directory.
fn resolve_path(raw: &str, config_dir: &Path) -> PathBuf {
    let expanded = expand_tilde(raw);
    if expanded.is_absolute() {
        expanded
    } else {
        config_dir.join(expanded)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&contents, config_dir)
    }

    fn parse(contents: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if raw.download.default_days == 0 {
            return Err(ConfigError::Parse(
                "default_days must be greater than 0 in [download]".to_string(),
            ));
        }

        let base_path = raw.download.base_path.ok_or_else(|| {
            ConfigError::Parse("missing base_path in [download]".to_string())
        })?;
        let base_path = resolve_path(&base_path, config_dir);

        let vault_dir = match raw.vault.path {
            Some(path) => resolve_path(&path, config_dir),
            None => default_vault_dir(),
        };

        let mut accounts = Vec::new();
        for (email, account) in raw.account {
            if !email.contains('@') {
                return Err(ConfigError::Parse(format!(
                    "account key '{}' is not an email address",
                    email
                )));
            }
            accounts.push(AccountConfig {
                email,
                filters: account.filter,
            });
        }

        if accounts.is_empty() {
            return Err(ConfigError::Parse(
                "no accounts configured (add an [account.\"you@example.com\"] section)"
                    .to_string(),
            ));
        }

        Ok(Config {
            accounts,
            download: DownloadConfig {
                default_days: raw.download.default_days,
                base_path,
            },
            vault_dir,
        })
    }
}
