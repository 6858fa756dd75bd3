//! Project configuration, read from `Plinth.toml` and `PLINTH_*` variables.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    Environment, NamedAccounts,
    accounts::{
        AccountRef, DEFAULT_DEV_ACCOUNT_COUNT, DEFAULT_DEV_MNEMONIC, RoleSpec, dev_accounts,
    },
    retry::RetryPolicy,
};

/// The default name of the configuration file.
pub const PLINTH_CONFIG_FILENAME: &str = "Plinth.toml";

/// Prefix of environment variables overriding the configuration file.
pub const PLINTH_ENV_PREFIX: &str = "PLINTH_";

/// Chain ID of local dev chains.
pub const LOCAL_CHAIN_ID: u64 = 31337;

/// Configuration of one target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// File backing the local chain state. Only used for non-live environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_state: Option<PathBuf>,
}

/// Top-level project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlinthConfig {
    /// Root of the artifact store.
    pub outdata: PathBuf,
    /// Directory of compiled contract artifacts.
    pub artifacts_dir: PathBuf,
    /// Mnemonic the dev accounts are derived from.
    pub mnemonic: String,
    /// Number of dev accounts to derive.
    pub accounts: usize,
    pub named_accounts: BTreeMap<String, RoleSpec>,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    pub retry: RetryPolicy,
}

impl Default for PlinthConfig {
    fn default() -> Self {
        let named_accounts = ["deployer", "lender", "borrower1", "borrower2"]
            .into_iter()
            .enumerate()
            .map(|(index, role)| (role.to_string(), RoleSpec::Fixed(AccountRef::Index(index))))
            .collect();

        let environments = BTreeMap::from([(
            "localhost".to_string(),
            EnvironmentConfig {
                chain_id: LOCAL_CHAIN_ID,
                live: false,
                tags: vec!["local".to_string()],
                chain_state: None,
            },
        )]);

        Self {
            outdata: PathBuf::from("deployments"),
            artifacts_dir: PathBuf::from("artifacts/contracts"),
            mnemonic: DEFAULT_DEV_MNEMONIC.to_string(),
            accounts: DEFAULT_DEV_ACCOUNT_COUNT,
            named_accounts,
            environments,
            retry: RetryPolicy::default(),
        }
    }
}

impl PlinthConfig {
    /// Load the configuration, layering defaults, the TOML file at `path` (if it
    /// exists) and `PLINTH_*` environment variables, in that order.
    ///
    /// `path` may be the file itself or a directory holding `Plinth.toml`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = if path.is_dir() {
            path.join(PLINTH_CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        if !file.exists() {
            tracing::debug!(path = %file.display(), "No configuration file, using defaults");
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(PLINTH_ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))?;

        tracing::debug!(
            path = %file.display(),
            environments = config.environments.len(),
            roles = config.named_accounts.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// The named environment.
    pub fn environment(&self, name: &str) -> Result<Environment> {
        let config = self.environments.get(name).with_context(|| {
            let known: Vec<_> = self.environments.keys().map(String::as_str).collect();
            format!("Unknown environment `{name}` (configured: {})", known.join(", "))
        })?;

        Ok(Environment {
            name: name.to_string(),
            chain_id: config.chain_id,
            live: config.live,
            tags: config.tags.clone(),
        })
    }

    /// Resolve the configured roles for `environment`.
    pub fn named_accounts(&self, environment: &Environment) -> Result<NamedAccounts> {
        let dev_accounts = dev_accounts(&self.mnemonic, self.accounts)?;
        NamedAccounts::from_config(&self.named_accounts, environment, &dev_accounts)
    }

    /// File backing the local chain of `environment`.
    pub fn chain_state_path(&self, environment: &str) -> PathBuf {
        self.environments
            .get(environment)
            .and_then(|config| config.chain_state.clone())
            .unwrap_or_else(|| self.outdata.join(environment).join("chain.json"))
    }

    /// Path of a compiled contract artifact (`<artifacts_dir>/<Name>.sol/<Name>.json`).
    pub fn contract_artifact_path(&self, contract: &str) -> PathBuf {
        self.artifacts_dir
            .join(format!("{contract}.sol"))
            .join(format!("{contract}.json"))
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::address;
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new("plinth-config").expect("Failed to create temp dir");

        let config = PlinthConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config, PlinthConfig::default());
        assert_eq!(config.environment("localhost").unwrap().chain_id, LOCAL_CHAIN_ID);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp_dir = TempDir::new("plinth-config").expect("Failed to create temp dir");
        std::fs::write(
            temp_dir.path().join(PLINTH_CONFIG_FILENAME),
            r#"
outdata = "out"

[named_accounts]
deployer = 0
lender = { default = 1, sepolia = "0x00000000000000000000000000000000000000aa" }

[environments.sepolia]
chain_id = 11155111
live = true

[retry]
max_retries = 5
"#,
        )
        .unwrap();

        let config = PlinthConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.outdata, PathBuf::from("out"));
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.environment("sepolia").unwrap().live);
        // Tables merge with the defaults.
        assert!(config.environments.contains_key("localhost"));

        let sepolia = config.environment("sepolia").unwrap();
        let accounts = config.named_accounts(&sepolia).unwrap();
        assert_eq!(
            accounts.resolve("lender").unwrap(),
            address!("00000000000000000000000000000000000000aa")
        );
    }

    #[test]
    fn test_unknown_environment() {
        let err = PlinthConfig::default().environment("mainnet").unwrap_err();
        assert!(err.to_string().contains("Unknown environment `mainnet`"));
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new("plinth-config").expect("Failed to create temp dir");
        let path = temp_dir.path().join(PLINTH_CONFIG_FILENAME);

        let mut config = PlinthConfig::default();
        config.outdata = PathBuf::from("elsewhere");
        config.save_to_file(&path).unwrap();

        assert_eq!(PlinthConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_contract_artifact_path() {
        let config = PlinthConfig::default();
        assert_eq!(
            config.contract_artifact_path("Vault"),
            PathBuf::from("artifacts/contracts/Vault.sol/Vault.json")
        );
    }
}
