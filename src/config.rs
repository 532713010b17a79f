//! Application-level configuration loading: the account roster, the snapshot
//! directory and the remote store selection.

use std::{collections::HashSet, env, fs, io::ErrorKind, path::PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::state::ledger::{Account, MIN_CREDENTIAL_LEN, ScoreLedger};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "TILE_REVEAL_BACK_CONFIG_PATH";
/// Environment variable selecting the remote store backend.
const REMOTE_STORE_ENV: &str = "REMOTE_STORE";
/// Directory holding local snapshots when the config does not name one.
const DEFAULT_DATA_DIR: &str = "data";

/// Which remote store the supervisor connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBackend {
    /// CouchDB configured through the `COUCH_*` variables.
    Couch,
    /// Process-local store, lost on restart.
    Memory,
    /// Local snapshots only.
    Disabled,
}

impl RemoteBackend {
    fn from_env() -> Self {
        match env::var(REMOTE_STORE_ENV).ok().as_deref().map(str::trim) {
            Some("couch") | Some("couchdb") => Self::Couch,
            Some("memory") => Self::Memory,
            Some("none") | Some("disabled") => Self::Disabled,
            Some(other) => {
                warn!(value = other, "unknown {REMOTE_STORE_ENV}; using local snapshots only");
                Self::Disabled
            }
            None if env::var_os("COUCH_BASE_URL").is_some() => Self::Couch,
            None => Self::Disabled,
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    accounts: Vec<Account>,
    data_dir: PathBuf,
    remote: RemoteBackend,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to the built-in roster.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let remote = RemoteBackend::from_env();
        let raw = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => Some(raw),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    None
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                None
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                None
            }
        };

        let mut config = Self {
            remote,
            ..Self::default()
        };
        let Some(raw) = raw else {
            return config;
        };
        if let Some(dir) = raw.data_dir {
            config.data_dir = dir;
        }
        if let Some(accounts) = raw.accounts {
            match validate_roster(&accounts) {
                Ok(()) => config.accounts = accounts.into_iter().map(Into::into).collect(),
                Err(reason) => warn!(
                    path = %path.display(),
                    reason,
                    "invalid roster in config; keeping the built-in roster"
                ),
            }
        }
        info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            data_dir = %config.data_dir.display(),
            remote = ?config.remote,
            "loaded configuration"
        );
        config
    }

    /// Fresh ledger over the configured roster.
    pub fn ledger(&self) -> ScoreLedger {
        ScoreLedger::new(self.accounts.iter().cloned())
    }

    /// Directory for local snapshots and the error log.
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Remote store selected from the environment.
    pub fn remote_backend(&self) -> RemoteBackend {
        self.remote
    }

    /// Override the snapshot directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            accounts: default_accounts(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            remote: RemoteBackend::Disabled,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    accounts: Option<Vec<RawAccount>>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccount {
    id: String,
    display_name: String,
    credential: String,
    #[serde(default)]
    privileged: bool,
}

impl From<RawAccount> for Account {
    fn from(value: RawAccount) -> Self {
        Account::new(value.id, value.display_name, value.credential, value.privileged)
    }
}

fn validate_roster(accounts: &[RawAccount]) -> Result<(), &'static str> {
    if accounts.is_empty() {
        return Err("roster is empty");
    }
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for account in accounts {
        if !ids.insert(account.id.as_str()) {
            return Err("duplicate account id");
        }
        if !names.insert(account.display_name.to_lowercase()) {
            return Err("duplicate display name");
        }
        if account.credential.chars().count() < MIN_CREDENTIAL_LEN {
            return Err("credential too short");
        }
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Built-in roster shipped with the binary.
fn default_accounts() -> Vec<Account> {
    [
        ("1", "Condor", "vuela741"),
        ("2", "Colibrí", "rapido852"),
        ("3", "Tucan", "colores963"),
        ("4", "Quetzal", "sagrado159"),
        ("5", "Flamingo", "rosado753"),
        ("6", "Gaviota", "marina426"),
        ("7", "Pelicano", "pescador817"),
        ("8", "Canario", "amarillo294"),
        ("9", "Cisne", "elegante685"),
        ("10", "Gorrion", "urbano372"),
    ]
    .into_iter()
    .map(|(id, name, credential)| Account::new(id, name, credential, false))
    .chain(std::iter::once(Account::new(
        "admin",
        "admin",
        "admin1998",
        true,
    )))
    .collect()
}
