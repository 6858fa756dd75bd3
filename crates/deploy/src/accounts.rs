//! Named account resolution.
//!
//! Deployment scripts refer to accounts by role (`deployer`, `lender`, ...).
//! Roles are configured either as an index into the environment's dev accounts
//! or as a literal address, optionally overridden per environment:
//!
//! ```toml
//! [named_accounts]
//! deployer = 0
//! lender = { default = 1, mainnet = "0x00000000000000000000000000000000000000aa" }
//! ```

use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, coins_bip39::English};
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{DeployError, Environment};

/// Mnemonic used by local dev chains (hardhat, anvil).
pub const DEFAULT_DEV_MNEMONIC: &str =
    "test test test test test test test test test test test junk";

/// Number of dev accounts derived when none is configured.
pub const DEFAULT_DEV_ACCOUNT_COUNT: usize = 10;

/// Reference to a concrete account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountRef {
    /// Index into the environment's dev accounts.
    Index(usize),
    /// A literal address.
    Address(Address),
}

/// Configuration of a single role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleSpec {
    /// Same account in every environment.
    Fixed(AccountRef),
    /// Per-environment accounts; the `default` key applies to unlisted environments.
    PerEnvironment(BTreeMap<String, AccountRef>),
}

impl RoleSpec {
    fn for_environment(&self, environment: &str) -> Option<AccountRef> {
        match self {
            Self::Fixed(account) => Some(*account),
            Self::PerEnvironment(map) => map
                .get(environment)
                .or_else(|| map.get("default"))
                .copied(),
        }
    }
}

/// Immutable role-to-address mapping for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedAccounts {
    environment: String,
    roles: BTreeMap<String, Address>,
}

impl NamedAccounts {
    pub fn new(environment: impl Into<String>, roles: BTreeMap<String, Address>) -> Self {
        Self {
            environment: environment.into(),
            roles,
        }
    }

    /// Build the mapping for `environment` from role configuration.
    ///
    /// Roles without an entry for this environment (and no default) are left
    /// out, so resolving them later fails with [`DeployError::UnknownRole`].
    pub fn from_config(
        config: &BTreeMap<String, RoleSpec>,
        environment: &Environment,
        dev_accounts: &[Address],
    ) -> Result<Self, anyhow::Error> {
        let mut roles = BTreeMap::new();

        for (role, spec) in config {
            let Some(account) = spec.for_environment(&environment.name) else {
                tracing::debug!(
                    role,
                    environment = %environment.name,
                    "Role not configured for environment"
                );
                continue;
            };

            let address = match account {
                AccountRef::Address(address) => address,
                AccountRef::Index(index) => *dev_accounts.get(index).with_context(|| {
                    format!(
                        "role `{role}` uses dev account #{index} but only {} are available",
                        dev_accounts.len()
                    )
                })?,
            };

            roles.insert(role.clone(), address);
        }

        Ok(Self::new(environment.name.clone(), roles))
    }

    /// Resolve a role to its address.
    pub fn resolve(&self, role: &str) -> Result<Address, DeployError> {
        self.roles
            .get(role)
            .copied()
            .ok_or_else(|| DeployError::UnknownRole {
                role: role.to_string(),
                environment: self.environment.clone(),
            })
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, Address)> {
        self.roles.iter().map(|(role, address)| (role.as_str(), *address))
    }
}

/// Derive the first `count` dev account addresses from a BIP-39 mnemonic
/// (path `m/44'/60'/0'/0/{index}`).
pub fn dev_accounts(mnemonic: &str, count: usize) -> Result<Vec<Address>, anyhow::Error> {
    (0..count)
        .map(|index| {
            let signer = MnemonicBuilder::<English>::default()
                .phrase(mnemonic)
                .index(index as u32)
                .context("Invalid derivation index")?
                .build()
                .with_context(|| format!("Failed to derive dev account #{index}"))?;
            Ok(signer.address())
        })
        .collect()
}
