//! Deployment units: the nodes of the deployment graph.

use std::{borrow::Borrow, collections::BTreeSet, fmt, sync::Arc};

use alloy_core::primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    DeployError,
    actions::{Action, action_key},
    args::Arg,
    chain::{DeployRequest, Deployed},
    context::UnitContext,
    fingerprint::Fingerprint,
};

/// Unique, human-readable identifier of a unit (usually the contract name).
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for UnitId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for UnitId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Typed handle to a registered unit, valid for the graph that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitHandle(pub(crate) usize);

impl UnitHandle {
    /// Registration sequence number of the unit.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Contract code identity: a name and its creation bytecode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCode {
    pub name: String,
    pub bytecode: Bytes,
}

impl ContractCode {
    pub fn new(name: impl Into<String>, bytecode: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytecode: bytecode.into(),
        }
    }

    /// Load the creation bytecode from a compiled hardhat artifact
    /// (`{ "contractName": .., "bytecode": "0x.." }`).
    pub fn from_artifact_file(path: &std::path::Path) -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CompiledArtifact {
            contract_name: String,
            bytecode: Bytes,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiled artifact {}", path.display()))?;
        let artifact: CompiledArtifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse compiled artifact {}", path.display()))?;

        Ok(Self::new(artifact.contract_name, artifact.bytecode))
    }
}

/// What a unit is about to deploy, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescription {
    /// Role of the account submitting the deployment.
    pub from: String,
    pub code: ContractCode,
    /// Constructor arguments, fully resolved.
    pub args: Vec<Value>,
    /// Salt for a deterministic (CREATE2) deployment.
    pub salt: Option<B256>,
}

impl UnitDescription {
    pub fn args_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_args(&self.args)
    }

    pub fn code_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_code(&self.code.bytecode)
    }
}

/// The logic behind a unit.
#[async_trait]
pub trait UnitScript: Send + Sync {
    /// Describe the deployment. Must not have side effects: it runs on every
    /// execution, including ones that end up reusing an existing artifact.
    fn describe(&self, ctx: &UnitContext<'_>) -> Result<UnitDescription, DeployError>;

    /// Perform the deployment of a contract expected at `predicted`.
    ///
    /// `predicted` is computed once per unit, before the first attempt, so a
    /// retried attempt can find the contract a lost response already created.
    async fn deploy(
        &self,
        ctx: &UnitContext<'_>,
        description: &UnitDescription,
        predicted: Address,
    ) -> Result<Deployed, DeployError> {
        deploy_contract(ctx, description, predicted).await
    }

    /// Account roles the deployment submits from or passes as arguments.
    fn roles(&self) -> Vec<String> {
        Vec::new()
    }
}

fn deploy_request(from: Address, description: &UnitDescription) -> DeployRequest {
    DeployRequest {
        from,
        contract: description.code.name.clone(),
        bytecode: description.code.bytecode.clone(),
        args: description.args.clone(),
        salt: description.salt,
    }
}

/// Address `description` will be deployed at.
///
/// Deterministic deployments derive it from the salt and creation code. Plain
/// deployments derive it from the sender and its current nonce.
pub async fn predict_address(
    ctx: &UnitContext<'_>,
    description: &UnitDescription,
) -> Result<Address, DeployError> {
    let from = ctx.accounts().resolve(&description.from)?;

    if let Some(predicted) = deploy_request(from, description).predicted_address() {
        return Ok(predicted);
    }

    let nonce = ctx
        .chain()
        .nonce(from)
        .await
        .map_err(|e| DeployError::from_client(format!("nonce of {from}"), e))?;

    Ok(from.create(nonce))
}

/// Submit `description` through the context's chain client.
///
/// Code already present at `predicted` is adopted instead of deployed again.
pub async fn deploy_contract(
    ctx: &UnitContext<'_>,
    description: &UnitDescription,
    predicted: Address,
) -> Result<Deployed, DeployError> {
    let from = ctx.accounts().resolve(&description.from)?;
    let operation = format!("deploy {}", ctx.unit_id());

    let existing = ctx
        .chain()
        .code_hash(predicted)
        .await
        .map_err(|e| DeployError::from_client(&operation, e))?;

    if existing.is_some() {
        tracing::info!(
            unit = %ctx.unit_id(),
            address = %predicted,
            "Code already present at predicted address"
        );
        return Ok(Deployed {
            address: predicted,
            transaction_hash: None,
        });
    }

    let deployed = ctx
        .chain()
        .deploy(&deploy_request(from, description))
        .await
        .map_err(|e| DeployError::from_client(&operation, e))?;

    if deployed.address != predicted {
        tracing::warn!(
            unit = %ctx.unit_id(),
            predicted = %predicted,
            address = %deployed.address,
            "Contract deployed away from its predicted address"
        );
    }

    tracing::info!(
        unit = %ctx.unit_id(),
        contract = %description.code.name,
        address = %deployed.address,
        "Contract deployed"
    );

    Ok(deployed)
}

/// The common script: deploy a contract with declared constructor arguments.
#[derive(Debug, Clone)]
pub struct ContractDeployment {
    code: ContractCode,
    from: String,
    args: Vec<Arg>,
    salt: Option<B256>,
}

impl ContractDeployment {
    pub fn new(code: ContractCode) -> Self {
        Self {
            code,
            from: "deployer".to_string(),
            args: Vec::new(),
            salt: None,
        }
    }

    /// Role of the deploying account (defaults to `deployer`).
    pub fn from(mut self, role: impl Into<String>) -> Self {
        self.from = role.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Deploy through the deterministic deployment proxy with a zero salt.
    pub fn deterministic(self) -> Self {
        self.salt(B256::ZERO)
    }

    pub fn salt(mut self, salt: B256) -> Self {
        self.salt = Some(salt);
        self
    }
}

#[async_trait]
impl UnitScript for ContractDeployment {
    fn describe(&self, ctx: &UnitContext<'_>) -> Result<UnitDescription, DeployError> {
        let args = self
            .args
            .iter()
            .map(|arg| arg.resolve(ctx))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UnitDescription {
            from: self.from.clone(),
            code: self.code.clone(),
            args,
            salt: self.salt,
        })
    }

    fn roles(&self) -> Vec<String> {
        std::iter::once(self.from.as_str())
            .chain(self.args.iter().filter_map(Arg::role))
            .map(str::to_string)
            .collect()
    }
}

/// A named deployment step producing one artifact.
#[derive(Clone)]
pub struct DeploymentUnit {
    pub(crate) id: UnitId,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) dependencies: Vec<UnitId>,
    pub(crate) script: Arc<dyn UnitScript>,
    pub(crate) actions: Vec<Arc<dyn Action>>,
}

impl DeploymentUnit {
    pub fn new(id: impl Into<UnitId>, script: impl UnitScript + 'static) -> Self {
        let id = id.into();
        Self {
            // Units are tagged with their own id, as hardhat-deploy scripts are.
            tags: BTreeSet::from([id.to_string()]),
            id,
            dependencies: Vec::new(),
            script: Arc::new(script),
            actions: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Append a post-deployment action. Actions run in the order they are added.
    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn dependencies(&self) -> &[UnitId] {
        &self.dependencies
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    pub fn script(&self) -> &dyn UnitScript {
        self.script.as_ref()
    }

    /// Stable key of the action at `ordinal`.
    pub fn action_key(&self, ordinal: usize) -> Option<String> {
        self.actions
            .get(ordinal)
            .map(|action| action_key(ordinal, action.name()))
    }
}

impl fmt::Debug for DeploymentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentUnit")
            .field("id", &self.id)
            .field("tags", &self.tags)
            .field("dependencies", &self.dependencies)
            .field("actions", &self.actions.len())
            .finish()
    }
}
