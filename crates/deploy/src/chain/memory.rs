//! In-process development chain.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use alloy_core::primitives::{Address, B256, keccak256};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    CallRequest, ChainClient, ClientError, DeployRequest, Deployed, TransactionRequest, TxReceipt,
};
use crate::fingerprint::canonical_json;

/// Which requests an injected [`Fault`] applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultTarget {
    /// Deployments of the named contract.
    Deploy(String),
    /// Transactions calling the named method.
    Send(String),
    /// View calls to the named method.
    Call(String),
}

/// A failure injected into the next matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a timeout without applying anything.
    Timeout,
    /// Apply the request, then report a timeout (lost response).
    TimeoutAfterApply,
    /// Reject the request.
    Revert(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContractState {
    contract: String,
    code_hash: B256,
    slots: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChainState {
    nonces: BTreeMap<Address, u64>,
    contracts: BTreeMap<Address, ContractState>,
    deployments: u64,
    transactions: u64,
}

impl ChainState {
    fn next_nonce(&mut self, from: Address) -> u64 {
        let nonce = self.nonces.entry(from).or_default();
        let current = *nonce;
        *nonce += 1;
        current
    }
}

/// A minimal chain living in process memory.
///
/// Each contract is modelled as a key/value store. A transaction writes its last
/// argument (or `true` when it has none) into the slot named after the method
/// and the remaining arguments; a view call reads the slot named after its method
/// and all of its arguments. Method names are normalised by dropping a leading
/// `_` and a `set`/`get` prefix, so `setUnderlyingPrice(asset, price)` is read
/// back by `getUnderlyingPrice(asset)`.
///
/// The state can be backed by a JSON file so that separate runs of the CLI see
/// the same chain.
#[derive(Debug, Default)]
pub struct InMemoryChain {
    state: Mutex<ChainState>,
    faults: Mutex<VecDeque<(FaultTarget, Fault)>>,
    inert_methods: Mutex<BTreeSet<String>>,
    state_file: Option<PathBuf>,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a chain persisted at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read chain state from {}", path.display()))?;
            serde_json::from_str(&content).context("Failed to parse chain state JSON")?
        } else {
            ChainState::default()
        };

        tracing::debug!(path = %path.display(), "Opened in-memory chain");

        Ok(Self {
            state: Mutex::new(state),
            state_file: Some(path),
            ..Default::default()
        })
    }

    /// Make the next request matching `target` fail with `fault`.
    pub fn inject(&self, target: FaultTarget, fault: Fault) {
        lock(&self.faults).push_back((target, fault));
    }

    /// Accept transactions calling `method` without applying their effect.
    pub fn make_inert(&self, method: impl Into<String>) {
        lock(&self.inert_methods).insert(method.into());
    }

    /// Number of contracts created so far.
    pub fn deployment_count(&self) -> u64 {
        lock(&self.state).deployments
    }

    /// Number of state-changing transactions applied so far.
    pub fn transaction_count(&self) -> u64 {
        lock(&self.state).transactions
    }

    /// Read a storage slot of the contract at `address` directly.
    pub fn slot(&self, address: Address, method: &str, keys: &[Value]) -> Option<Value> {
        lock(&self.state)
            .contracts
            .get(&address)
            .and_then(|contract| contract.slots.get(&slot_name(method, keys)).cloned())
    }

    fn take_fault(&self, target: &FaultTarget) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        let position = faults.iter().position(|(t, _)| t == target)?;
        faults.remove(position).map(|(_, fault)| fault)
    }

    fn persist(&self, state: &ChainState) -> Result<(), ClientError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ClientError::Transport(format!("failed to encode chain state: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| ClientError::Transport(format!("failed to write chain state: {e}")))
    }

    fn apply_deploy(&self, request: &DeployRequest) -> Result<Deployed, ClientError> {
        let mut state = lock(&self.state);
        let nonce = state.next_nonce(request.from);

        let address = match request.predicted_address() {
            Some(address) => address,
            None => request.from.create(nonce),
        };

        if state.contracts.contains_key(&address) {
            return Err(ClientError::Revert(format!("contract already exists at {address}")));
        }

        let init_code = request.init_code();
        state.contracts.insert(
            address,
            ContractState {
                contract: request.contract.clone(),
                code_hash: keccak256(&init_code),
                slots: BTreeMap::new(),
            },
        );
        state.deployments += 1;

        let transaction_hash = transaction_hash(request.from, nonce, &request.contract);

        self.persist(&state)?;

        Ok(Deployed {
            address,
            transaction_hash: Some(transaction_hash),
        })
    }

    fn apply_send(&self, request: &TransactionRequest) -> Result<TxReceipt, ClientError> {
        let inert = lock(&self.inert_methods).contains(&request.method);
        let mut state = lock(&self.state);

        if !state.contracts.contains_key(&request.to) {
            return Err(ClientError::Revert(format!("no contract at {}", request.to)));
        }

        let nonce = state.next_nonce(request.from);
        state.transactions += 1;

        if !inert {
            let (keys, value) = match request.args.split_last() {
                Some((value, keys)) => (keys, value.clone()),
                None => (&[][..], Value::Bool(true)),
            };
            let slot = slot_name(&request.method, keys);

            if let Some(contract) = state.contracts.get_mut(&request.to) {
                contract.slots.insert(slot, value);
            }
        }

        self.persist(&state)?;

        Ok(TxReceipt {
            transaction_hash: transaction_hash(request.from, nonce, &request.method),
        })
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn deploy(&self, request: &DeployRequest) -> Result<Deployed, ClientError> {
        match self.take_fault(&FaultTarget::Deploy(request.contract.clone())) {
            Some(Fault::Timeout) => Err(ClientError::Timeout),
            Some(Fault::Revert(reason)) => Err(ClientError::Revert(reason)),
            Some(Fault::TimeoutAfterApply) => {
                self.apply_deploy(request)?;
                Err(ClientError::Timeout)
            }
            None => self.apply_deploy(request),
        }
    }

    async fn send(&self, request: &TransactionRequest) -> Result<TxReceipt, ClientError> {
        match self.take_fault(&FaultTarget::Send(request.method.clone())) {
            Some(Fault::Timeout) => Err(ClientError::Timeout),
            Some(Fault::Revert(reason)) => Err(ClientError::Revert(reason)),
            Some(Fault::TimeoutAfterApply) => {
                self.apply_send(request)?;
                Err(ClientError::Timeout)
            }
            None => self.apply_send(request),
        }
    }

    async fn call(&self, request: &CallRequest) -> Result<Value, ClientError> {
        match self.take_fault(&FaultTarget::Call(request.method.clone())) {
            Some(Fault::Timeout | Fault::TimeoutAfterApply) => return Err(ClientError::Timeout),
            Some(Fault::Revert(reason)) => return Err(ClientError::Revert(reason)),
            None => {}
        }

        let state = lock(&self.state);
        let contract = state
            .contracts
            .get(&request.to)
            .ok_or_else(|| ClientError::Revert(format!("no contract at {}", request.to)))?;

        Ok(contract
            .slots
            .get(&slot_name(&request.method, &request.args))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn code_hash(&self, address: Address) -> Result<Option<B256>, ClientError> {
        Ok(lock(&self.state)
            .contracts
            .get(&address)
            .map(|contract| contract.code_hash))
    }

    async fn nonce(&self, from: Address) -> Result<u64, ClientError> {
        Ok(lock(&self.state).nonces.get(&from).copied().unwrap_or(0))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the plain data inconsistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn transaction_hash(from: Address, nonce: u64, label: &str) -> B256 {
    keccak256(format!("{from}:{nonce}:{label}"))
}

/// Storage slot addressed by `method(keys...)`.
fn slot_name(method: &str, keys: &[Value]) -> String {
    let keys: Vec<String> = keys.iter().map(canonical_json).collect();
    format!("{}({})", normalize_method(method), keys.join(","))
}

fn normalize_method(method: &str) -> String {
    let name = method.trim_start_matches('_');
    let name = ["set", "get"]
        .iter()
        .find_map(|prefix| {
            name.strip_prefix(prefix)
                .filter(|rest| rest.starts_with(|c: char| c.is_ascii_uppercase()))
        })
        .unwrap_or(name);

    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
