//! Smart contract accounts.
//!
//! [`to_smart_contract_account`] turns an [`AccountImpl`] (the encoders and
//! signer of one account contract) into a [`SmartContractAccount`]: a
//! versioned handle that knows its address, its entry point and whether it is
//! deployed, and that produces user operation structs for the pipeline.

pub mod simple;

use crate::deferred::{conditional, DeferredValue};
use crate::deployment::{DeploymentCache, DeploymentState};
use crate::entrypoint::{EntryPointDef, EntryPointVersion, SENDER_ADDRESS_RESULT};
use crate::erc6492;
use crate::error::{AccountError, Result};
use crate::provider::ChainReader;
use crate::types::{
    AccountOp, UpgradeToAndCallParams, UserOperationCallData, UserOperationStruct,
    UserOperationStructV060, UserOperationStructV070,
};
use async_trait::async_trait;
use ethers::abi::{decode, Abi, ParamType, Token};
use ethers::types::{transaction::eip712::TypedData, Address, Bytes, H256, U256};
use futures::future::FutureExt;
use std::sync::Arc;
use tracing::debug;

/// EIP-1967 implementation slot: `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`.
pub const PROXY_IMPLEMENTATION_SLOT: [u8; 32] = [
    0x36, 0x08, 0x94, 0xa1, 0x3b, 0xa1, 0xa3, 0x21, 0x06, 0x67, 0xc8, 0x28, 0x49, 0x2d, 0xb9, 0x8d,
    0xca, 0x3e, 0x20, 0x76, 0xcc, 0x37, 0x35, 0xa9, 0x20, 0xa3, 0xca, 0x50, 0x5d, 0x38, 0x2b, 0xbc,
];

/// What a concrete account contract contributes: its init code, its call
/// encoders and its signer.
#[async_trait]
pub trait AccountImpl: Send + Sync {
    /// Short name of the account implementation, used in errors.
    fn source(&self) -> &str;

    /// `factory (20 bytes) || factory calldata`.
    async fn get_account_init_code(&self) -> Result<Bytes>;

    /// A signature that passes validation shape checks, for gas estimation.
    fn get_dummy_signature(&self) -> Bytes;

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes>;

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Bytes>;

    fn encode_execute(&self, op: &AccountOp) -> Result<Bytes>;

    fn encode_batch_execute(&self, _ops: &[AccountOp]) -> Result<Bytes> {
        Err(AccountError::BatchExecutionNotSupported(
            self.source().to_string(),
        ))
    }

    fn encode_upgrade_to_and_call(&self, _params: &UpgradeToAndCallParams) -> Result<Bytes> {
        Err(AccountError::UpgradesNotSupported(self.source().to_string()))
    }

    async fn sign_user_operation_hash(&self, hash: H256) -> Result<Bytes> {
        self.sign_message(hash.as_bytes()).await
    }
}

pub struct ToSmartContractAccountParams {
    pub chain_id: u64,
    /// Defaults to the chain's default entry point.
    pub entry_point: Option<EntryPointDef>,
    pub reader: Arc<dyn ChainReader>,
    pub account: Arc<dyn AccountImpl>,
    /// Skips counterfactual address derivation when known.
    pub account_address: Option<Address>,
}

struct AccountCore {
    address: Address,
    entry_point: EntryPointDef,
    entry_point_abi: Abi,
    factory_address: Address,
    reader: Arc<dyn ChainReader>,
    account: Arc<dyn AccountImpl>,
    deployment: DeploymentCache,
}

impl AccountCore {
    async fn get_init_code(&self) -> Result<Bytes> {
        if self.deployment.is_deployed() {
            return Ok(Bytes::new());
        }

        let code = self.reader.get_code(self.address).await?;
        let state = self.deployment.observe_code_len(code.len());
        debug!(account = ?self.address, code_len = code.len(), ?state, "checked account bytecode");

        match state {
            DeploymentState::Deployed => Ok(Bytes::new()),
            _ => self.account.get_account_init_code().await,
        }
    }

    async fn is_account_deployed(&self) -> Result<bool> {
        Ok(self.get_init_code().await?.is_empty())
    }

    async fn get_nonce(&self, key: U256) -> Result<U256> {
        if !self.is_account_deployed().await? {
            return Ok(U256::zero());
        }

        let function = self.entry_point_abi.function("getNonce")?;
        let data = function.encode_input(&[Token::Address(self.address), Token::Uint(key)])?;
        let out = self
            .reader
            .call(self.entry_point.address, data.into())
            .await?;
        function
            .decode_output(&out)?
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| AccountError::Decode("getNonce returned no value".to_string()))
    }

    /// Factory calldata from a freshly built init code.
    async fn get_factory_data(&self) -> Result<Bytes> {
        let init_code = self.account.get_account_init_code().await?;
        let (_, calldata) = split_init_code(&init_code)?;
        Ok(Bytes::from(calldata.to_vec()))
    }

    async fn wrap_6492(&self, is_deployed: bool, signature: Bytes) -> Result<Bytes> {
        if is_deployed {
            return Ok(signature);
        }
        let init_code = self.account.get_account_init_code().await?;
        let (factory, calldata) = split_init_code(&init_code)?;
        Ok(erc6492::wrap(false, signature, factory, calldata))
    }
}

/// Account bound to an entry point v0.6.
#[derive(Clone)]
pub struct AccountV060 {
    core: Arc<AccountCore>,
}

/// Account bound to an entry point v0.7.
#[derive(Clone)]
pub struct AccountV070 {
    core: Arc<AccountCore>,
}

impl AccountV060 {
    fn user_operation_struct(&self, call_data: Bytes, nonce_key: U256) -> UserOperationStructV060 {
        let core = &self.core;
        let nonce = {
            let core = core.clone();
            DeferredValue::pending(async move { core.get_nonce(nonce_key).await })
        };
        let init_code = {
            let core = core.clone();
            DeferredValue::pending(async move { core.get_init_code().await })
        };

        UserOperationStructV060 {
            sender: core.address,
            nonce,
            init_code,
            call_data: call_data.into(),
            call_gas_limit: U256::zero().into(),
            verification_gas_limit: U256::zero().into(),
            pre_verification_gas: U256::zero().into(),
            max_fee_per_gas: U256::zero().into(),
            max_priority_fee_per_gas: U256::zero().into(),
            paymaster_and_data: Bytes::new().into(),
            signature: core.account.get_dummy_signature().into(),
        }
    }
}

impl AccountV070 {
    fn user_operation_struct(&self, call_data: Bytes, nonce_key: U256) -> UserOperationStructV070 {
        let core = &self.core;
        let nonce = {
            let core = core.clone();
            DeferredValue::pending(async move { core.get_nonce(nonce_key).await })
        };

        // Both factory fields hang off one bytecode check.
        let needs_factory = {
            let core = core.clone();
            async move { Ok::<_, AccountError>(!core.is_account_deployed().await?) }
                .boxed()
                .shared()
        };
        let factory = conditional(
            DeferredValue::pending(needs_factory.clone()),
            DeferredValue::Resolved(core.factory_address),
        );
        let factory_data = {
            let core = core.clone();
            conditional(
                DeferredValue::pending(needs_factory),
                DeferredValue::pending(async move { core.get_factory_data().await }),
            )
        };

        UserOperationStructV070 {
            sender: core.address,
            nonce,
            factory,
            factory_data,
            call_data: call_data.into(),
            call_gas_limit: U256::zero().into(),
            verification_gas_limit: U256::zero().into(),
            pre_verification_gas: U256::zero().into(),
            max_fee_per_gas: U256::zero().into(),
            max_priority_fee_per_gas: U256::zero().into(),
            paymaster: None.into(),
            paymaster_verification_gas_limit: None.into(),
            paymaster_post_op_gas_limit: None.into(),
            paymaster_data: None.into(),
            signature: core.account.get_dummy_signature().into(),
        }
    }
}

/// A smart account bound to one entry point version.
#[derive(Clone)]
pub enum SmartContractAccount {
    V060(AccountV060),
    V070(AccountV070),
}

impl SmartContractAccount {
    fn core(&self) -> &AccountCore {
        match self {
            Self::V060(a) => &a.core,
            Self::V070(a) => &a.core,
        }
    }

    pub fn address(&self) -> Address {
        self.core().address
    }

    pub fn entry_point(&self) -> &EntryPointDef {
        &self.core().entry_point
    }

    pub fn source(&self) -> &str {
        self.core().account.source()
    }

    pub fn reader(&self) -> Arc<dyn ChainReader> {
        self.core().reader.clone()
    }

    pub fn deployment_state(&self) -> DeploymentState {
        self.core().deployment.get()
    }

    /// Empty once the account has code on chain, the account init code otherwise.
    pub async fn get_init_code(&self) -> Result<Bytes> {
        self.core().get_init_code().await
    }

    pub async fn is_account_deployed(&self) -> Result<bool> {
        self.core().is_account_deployed().await
    }

    /// Entry point nonce for `key`; zero without a query while the account is not deployed.
    pub async fn get_nonce(&self, key: U256) -> Result<U256> {
        self.core().get_nonce(key).await
    }

    pub fn get_factory_address(&self) -> Address {
        self.core().factory_address
    }

    pub async fn get_factory_data(&self) -> Result<Bytes> {
        self.core().get_factory_data().await
    }

    pub fn get_dummy_signature(&self) -> Bytes {
        self.core().account.get_dummy_signature()
    }

    pub async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        self.core().account.sign_message(message).await
    }

    pub async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Bytes> {
        self.core().account.sign_typed_data(typed_data).await
    }

    pub async fn sign_message_with_6492(&self, message: &[u8]) -> Result<Bytes> {
        let core = self.core();
        let (is_deployed, signature) = futures::try_join!(
            core.is_account_deployed(),
            core.account.sign_message(message)
        )?;
        core.wrap_6492(is_deployed, signature).await
    }

    pub async fn sign_typed_data_with_6492(&self, typed_data: &TypedData) -> Result<Bytes> {
        let core = self.core();
        let (is_deployed, signature) = futures::try_join!(
            core.is_account_deployed(),
            core.account.sign_typed_data(typed_data)
        )?;
        core.wrap_6492(is_deployed, signature).await
    }

    pub async fn sign_user_operation_hash(&self, hash: H256) -> Result<Bytes> {
        self.core().account.sign_user_operation_hash(hash).await
    }

    pub fn encode_execute(&self, op: &AccountOp) -> Result<Bytes> {
        self.core().account.encode_execute(op)
    }

    pub fn encode_batch_execute(&self, ops: &[AccountOp]) -> Result<Bytes> {
        self.core().account.encode_batch_execute(ops)
    }

    pub fn encode_upgrade_to_and_call(&self, params: &UpgradeToAndCallParams) -> Result<Bytes> {
        self.core().account.encode_upgrade_to_and_call(params)
    }

    pub fn encode_call_data(&self, call: &UserOperationCallData) -> Result<Bytes> {
        match call {
            UserOperationCallData::Single(op) => self.encode_execute(op),
            UserOperationCallData::Batch(ops) => self.encode_batch_execute(ops),
            UserOperationCallData::Raw(data) => Ok(data.clone()),
        }
    }

    /// Reads the EIP-1967 implementation slot of the account proxy.
    pub async fn get_implementation_address(&self) -> Result<Address> {
        let core = self.core();
        let slot = H256::from(PROXY_IMPLEMENTATION_SLOT);
        let value = core
            .reader
            .get_storage_at(core.address, slot)
            .await?
            .ok_or_else(|| AccountError::StorageSlotRead {
                slot,
                descriptor: "Proxy Implementation Address".to_string(),
            })?;
        Ok(Address::from_slice(&value.as_bytes()[12..]))
    }

    /// A fresh user operation struct with every network-bound field deferred.
    pub fn user_operation_struct(&self, call_data: Bytes, nonce_key: U256) -> UserOperationStruct {
        match self {
            Self::V060(a) => UserOperationStruct::V060(a.user_operation_struct(call_data, nonce_key)),
            Self::V070(a) => UserOperationStruct::V070(a.user_operation_struct(call_data, nonce_key)),
        }
    }
}

impl std::fmt::Debug for SmartContractAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartContractAccount")
            .field("address", &self.address())
            .field("source", &self.source())
            .field("entry_point", self.entry_point())
            .field("deployment", &self.deployment_state())
            .finish()
    }
}

pub async fn to_smart_contract_account(
    params: ToSmartContractAccountParams,
) -> Result<SmartContractAccount> {
    let ToSmartContractAccountParams {
        chain_id,
        entry_point,
        reader,
        account,
        account_address,
    } = params;

    let entry_point = entry_point.unwrap_or_else(|| EntryPointDef::default_for_chain(chain_id));
    if entry_point.chain_id != chain_id {
        return Err(AccountError::InvalidEntryPoint {
            chain_id,
            version: entry_point.version.to_string(),
        });
    }
    let entry_point_abi = entry_point.abi()?;

    let init_code = account.get_account_init_code().await?;
    let (factory_address, _) = split_init_code(&init_code)?;

    let address = match account_address {
        Some(address) => address,
        None => get_account_address(reader.as_ref(), &entry_point, init_code).await?,
    };
    debug!(account = ?address, factory = ?factory_address, entry_point = %entry_point.version, "smart account ready");

    let core = Arc::new(AccountCore {
        address,
        entry_point,
        entry_point_abi,
        factory_address,
        reader,
        account,
        deployment: DeploymentCache::new(),
    });

    Ok(match core.entry_point.version {
        EntryPointVersion::V060 => SmartContractAccount::V060(AccountV060 { core }),
        EntryPointVersion::V070 => SmartContractAccount::V070(AccountV070 { core }),
    })
}

/// Counterfactual address from `EntryPoint.getSenderAddress`, which always
/// reverts with `SenderAddressResult(address)`.
pub async fn get_account_address(
    reader: &dyn ChainReader,
    entry_point: &EntryPointDef,
    init_code: Bytes,
) -> Result<Address> {
    let data = entry_point
        .abi()?
        .function("getSenderAddress")?
        .encode_input(&[Token::Bytes(init_code.to_vec())])?;

    match reader.call(entry_point.address, data.into()).await {
        Ok(_) => Err(AccountError::CounterfactualAddress),
        Err(err) if err.invalid_url => Err(AccountError::InvalidRpcUrl),
        Err(err) => {
            let address = err
                .revert_data
                .as_deref()
                .and_then(decode_sender_address_result);
            debug!(?address, error = %err.message, "getSenderAddress reverted");
            address.ok_or(AccountError::CounterfactualAddress)
        }
    }
}

fn decode_sender_address_result(data: &[u8]) -> Option<Address> {
    let selector = ethers::utils::id(SENDER_ADDRESS_RESULT);
    if data.len() < 4 || data[..4] != selector[..] {
        return None;
    }
    decode(&[ParamType::Address], &data[4..])
        .ok()?
        .into_iter()
        .next()?
        .into_address()
}

/// The factory address leading an init code.
pub fn parse_factory_address_from_init_code(init_code: &[u8]) -> Result<Address> {
    Ok(split_init_code(init_code)?.0)
}

fn split_init_code(init_code: &[u8]) -> Result<(Address, &[u8])> {
    if init_code.len() < 20 {
        return Err(AccountError::Decode(format!(
            "init code too short for a factory address ({} bytes)",
            init_code.len()
        )));
    }
    Ok((Address::from_slice(&init_code[..20]), &init_code[20..]))
}
