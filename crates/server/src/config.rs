use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{bail, ensure, Context};
use config::{Config, Environment, File};
use relay::RelayConfig;
use serde::Deserialize;
use shared::domain::Topology;
use url::Url;

pub const SETTINGS_FILE: &str = "relay.toml";
const DEFAULT_DEV_LEDGER_URL: &str = "sqlite://./data/dev-ledger.db";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub ledger_url: String,
    pub signing_credential: String,
    /// Credential the development ledger accepts writes from. Defaults to the
    /// signing credential.
    pub owner_credential: Option<String>,
    pub confirmation_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub dev_block_time_ms: u64,
    pub max_body_bytes: usize,
    pub topology: Topology,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    Dev { database_url: String },
    Gateway { endpoint: Url },
}

impl Settings {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            topology: self.topology,
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            ..RelayConfig::default()
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn dev_block_time(&self) -> Duration {
        Duration::from_millis(self.dev_block_time_ms)
    }

    pub fn owner_credential(&self) -> &str {
        self.owner_credential
            .as_deref()
            .unwrap_or(&self.signing_credential)
    }

    pub fn ledger_backend(&self) -> anyhow::Result<LedgerBackend> {
        let raw = self.ledger_url.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("dev") {
            return Ok(LedgerBackend::Dev {
                database_url: DEFAULT_DEV_LEDGER_URL.to_string(),
            });
        }
        if raw.starts_with("sqlite:") {
            return Ok(LedgerBackend::Dev {
                database_url: normalize_sqlite_url(raw),
            });
        }
        if raw.contains("://") {
            let endpoint =
                Url::parse(raw).with_context(|| format!("invalid ledger url '{raw}'"))?;
            return match endpoint.scheme() {
                "http" | "https" => Ok(LedgerBackend::Gateway { endpoint }),
                other => bail!("unsupported ledger url scheme '{other}' in '{raw}'"),
            };
        }
        Ok(LedgerBackend::Dev {
            database_url: normalize_sqlite_url(raw),
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.confirmation_timeout_secs > 0,
            "confirmation_timeout_secs must be positive"
        );
        ensure!(
            self.reconcile_interval_secs > 0,
            "reconcile_interval_secs must be positive"
        );
        ensure!(self.dev_block_time_ms > 0, "dev_block_time_ms must be positive");
        ensure!(
            !self.signing_credential.trim().is_empty(),
            "signing_credential must not be empty"
        );
        ensure!(
            self.topology.lights + self.topology.heaters + self.topology.doors > 0,
            "topology must contain at least one device"
        );
        self.ledger_backend()?;
        Ok(())
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Some(Path::new(SETTINGS_FILE)), std::env::vars().collect())
}

/// Defaults, then the legacy `NETWORK_URL`/`PRIVATE_KEY` variables, then the
/// optional settings file, then `APP__*` variables.
pub fn load_settings_from(
    file: Option<&Path>,
    env: HashMap<String, String>,
) -> anyhow::Result<Settings> {
    let topology = Topology::default();
    let mut builder = Config::builder()
        .set_default("server_bind", "127.0.0.1:8080")?
        .set_default("ledger_url", "dev")?
        .set_default("signing_credential", "dev-relayer-credential")?
        .set_default("confirmation_timeout_secs", 60)?
        .set_default("reconcile_interval_secs", 5)?
        .set_default("dev_block_time_ms", 1000)?
        .set_default("max_body_bytes", 16 * 1024)?
        .set_default("topology.lights", i64::from(topology.lights))?
        .set_default("topology.heaters", i64::from(topology.heaters))?
        .set_default("topology.doors", i64::from(topology.doors))?;

    if let Some(url) = env.get("NETWORK_URL") {
        builder = builder.set_default("ledger_url", url.as_str())?;
    }
    if let Some(key) = env.get("PRIVATE_KEY") {
        builder = builder.set_default("signing_credential", key.as_str())?;
    }
    if let Some(path) = file {
        builder = builder.add_source(File::from(path).required(false));
    }

    let settings: Settings = builder
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true)
                .source(Some(env.into_iter().collect())),
        )
        .build()
        .context("failed to read relay settings")?
        .try_deserialize()
        .context("invalid relay settings")?;

    settings.validate()?;
    Ok(settings)
}

fn normalize_sqlite_url(raw: &str) -> String {
    if raw.starts_with("sqlite::memory:") || raw.starts_with("sqlite://") {
        return raw.to_string();
    }
    let path = raw.strip_prefix("sqlite:").unwrap_or(raw).replace('\\', "/");
    format!("sqlite://{path}")
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
