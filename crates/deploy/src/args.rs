//! Late-bound arguments for constructors and actions.

use alloy_core::primitives::Address;
use serde_json::Value;

use crate::{DeployError, UnitContext, unit::UnitId};

/// An argument resolved against a [`UnitContext`] at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// A literal JSON value.
    Value(Value),
    /// The artifact address of a unit (a declared dependency or the unit itself).
    AddressOf(UnitId),
    /// The address of a named account role.
    Account(String),
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn address_of(unit: impl Into<UnitId>) -> Self {
        Self::AddressOf(unit.into())
    }

    pub fn account(role: impl Into<String>) -> Self {
        Self::Account(role.into())
    }

    /// The account role this argument names, if any.
    pub fn role(&self) -> Option<&str> {
        match self {
            Self::Account(role) => Some(role),
            Self::Value(_) | Self::AddressOf(_) => None,
        }
    }

    pub fn resolve(&self, ctx: &UnitContext<'_>) -> Result<Value, DeployError> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::AddressOf(unit) => Ok(address_value(ctx.address_of(unit.as_str())?)),
            Self::Account(role) => Ok(address_value(ctx.accounts().resolve(role)?)),
        }
    }
}

/// JSON rendering of an address inside argument lists.
pub fn address_value(address: Address) -> Value {
    Value::String(address.to_string())
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Self::Value(value.into())
    }
}

impl From<Address> for Arg {
    fn from(address: Address) -> Self {
        Self::Value(address_value(address))
    }
}
