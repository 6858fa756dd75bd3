//! Boundary to the network client that submits deployments and transactions.
//!
//! The engine never signs or broadcasts anything itself: it drives a
//! [`ChainClient`], which an integrator backs with a real RPC client. The
//! [`InMemoryChain`] implementation serves local dry runs and tests.

mod memory;

pub use memory::{Fault, FaultTarget, InMemoryChain};

use alloy_core::primitives::{Address, B256, Bytes, address};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::canonical_json;

/// The deterministic deployment proxy used for CREATE2 deployments.
pub const DETERMINISTIC_DEPLOYER: Address = address!("4e59b44847b379578588920ca78fbf26c0b4956c");

/// Failures reported by a chain client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The request did not complete in time. Its effect is unknown.
    #[error("request timed out")]
    Timeout,
    /// The request was rejected by the chain.
    #[error("reverted: {0}")]
    Revert(String),
    /// The request could not be delivered.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A contract creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub from: Address,
    pub contract: String,
    pub bytecode: Bytes,
    pub args: Vec<Value>,
    /// CREATE2 salt; `None` deploys with CREATE from `from`.
    pub salt: Option<B256>,
}

impl DeployRequest {
    /// Creation code: bytecode followed by the encoded constructor arguments.
    pub fn init_code(&self) -> Vec<u8> {
        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(canonical_json(&Value::Array(self.args.clone())).as_bytes());
        code
    }

    /// Address of a deterministic deployment, known before submitting it.
    pub fn predicted_address(&self) -> Option<Address> {
        self.salt
            .map(|salt| DETERMINISTIC_DEPLOYER.create2_from_code(salt.0, self.init_code()))
    }
}

/// Outcome of a contract creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployed {
    pub address: Address,
    /// `None` when an existing deployment was adopted.
    pub transaction_hash: Option<B256>,
}

/// A state-changing contract call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub method: String,
    pub args: Vec<Value>,
}

/// A read-only contract call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub to: Address,
    pub method: String,
    pub args: Vec<Value>,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: B256,
}

/// Network client used by units and actions.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<Deployed, ClientError>;

    async fn send(&self, request: &TransactionRequest) -> Result<TxReceipt, ClientError>;

    /// Evaluate a view call. Unset values are returned as `Value::Null`.
    async fn call(&self, request: &CallRequest) -> Result<Value, ClientError>;

    /// Hash of the code deployed at `address`, if any.
    async fn code_hash(&self, address: Address) -> Result<Option<B256>, ClientError>;

    /// Number of transactions sent by `from` so far, which is also the nonce of its next one.
    async fn nonce(&self, from: Address) -> Result<u64, ClientError>;
}
