//! In-memory chain and bundler doubles shared by the unit tests.

use crate::account::simple::SimpleAccount;
use crate::account::{to_smart_contract_account, SmartContractAccount, ToSmartContractAccountParams};
use crate::bundler::{BundlerRpc, GasEstimates, UserOperationReceipt};
use crate::entrypoint::{EntryPointDef, EntryPointVersion, SENDER_ADDRESS_RESULT};
use crate::error::{AccountError, Result};
use crate::provider::{CallError, ChainReader, FeeData};
use crate::types::UserOperationRequest;
use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;
use serde_json::Value;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const OWNER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

pub fn sample_wallet() -> LocalWallet {
    LocalWallet::from_str(OWNER_KEY).unwrap()
}

pub const FACTORY: Address = Address::repeat_byte(0xfa);

#[derive(Default)]
pub struct MockReader {
    code: Mutex<Bytes>,
    storage: Mutex<Option<H256>>,
    sender: Option<Address>,
    invalid_url: bool,
    nonce: U256,
    fees: FeeData,
    plugin_manifest: Option<Bytes>,
    pub code_calls: AtomicUsize,
    pub call_calls: AtomicUsize,
    pub fee_calls: AtomicUsize,
}

impl MockReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// `getSenderAddress` reverts with `SenderAddressResult(sender)`.
    pub fn with_sender(mut self, sender: Address) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_invalid_url(mut self) -> Self {
        self.invalid_url = true;
        self
    }

    pub fn with_nonce(mut self, nonce: U256) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_fees(mut self, fees: FeeData) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_plugin_manifest(mut self, manifest: Bytes) -> Self {
        self.plugin_manifest = Some(manifest);
        self
    }

    pub fn set_code(&self, code: Vec<u8>) {
        *self.code.lock().unwrap() = code.into();
    }

    pub fn set_storage(&self, value: Option<H256>) {
        *self.storage.lock().unwrap() = value;
    }
}

#[async_trait]
impl ChainReader for MockReader {
    async fn get_code(&self, _address: Address) -> Result<Bytes> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.code.lock().unwrap().clone())
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes, CallError> {
        self.call_calls.fetch_add(1, Ordering::SeqCst);
        if self.invalid_url {
            return Err(CallError {
                invalid_url: true,
                message: "builder error: relative URL without a base".into(),
                ..Default::default()
            });
        }

        let selector = &data[..4.min(data.len())];
        if selector == id("getSenderAddress(bytes)") {
            let revert_data = self.sender.map(|sender| {
                let mut out = id(SENDER_ADDRESS_RESULT).to_vec();
                out.extend(encode(&[Token::Address(sender)]));
                Bytes::from(out)
            });
            return Err(CallError {
                revert_data,
                invalid_url: false,
                message: "execution reverted".into(),
            });
        }
        if selector == id("getNonce(address,uint192)") {
            return Ok(encode(&[Token::Uint(self.nonce)]).into());
        }
        if selector == id("pluginManifest()") {
            if let Some(manifest) = &self.plugin_manifest {
                return Ok(manifest.clone());
            }
        }
        Err(CallError {
            message: "execution reverted".into(),
            ..Default::default()
        })
    }

    async fn get_storage_at(&self, _address: Address, _slot: H256) -> Result<Option<H256>> {
        Ok(*self.storage.lock().unwrap())
    }

    async fn fee_data(&self) -> Result<FeeData> {
        self.fee_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fees)
    }
}

#[derive(Default)]
pub struct MockBundler {
    pub estimate_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub receipt_calls: AtomicUsize,
    pub estimated: Mutex<Vec<UserOperationRequest>>,
    pub sent: Mutex<Vec<UserOperationRequest>>,
    pub state_overrides: Mutex<Vec<Option<Value>>>,
    /// Popped front-first per receipt poll; empty means "not yet included".
    pub receipts: Mutex<VecDeque<Option<UserOperationReceipt>>>,
    pub fail_estimate: bool,
    pub entry_points: Vec<Address>,
}

impl MockBundler {
    pub const USER_OP_HASH: H256 = H256::repeat_byte(0x0a);
    pub const TX_HASH: H256 = H256::repeat_byte(0x0b);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_estimates() -> Self {
        Self {
            fail_estimate: true,
            ..Self::default()
        }
    }

    pub fn estimates() -> GasEstimates {
        GasEstimates {
            call_gas_limit: U256::from(50_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(45_000),
            paymaster_verification_gas_limit: None,
        }
    }

    pub fn included_receipt() -> UserOperationReceipt {
        UserOperationReceipt {
            user_op_hash: Self::USER_OP_HASH,
            success: true,
            transaction_hash: Self::TX_HASH,
            raw: Value::Null,
        }
    }

    pub fn push_receipt(&self, receipt: Option<UserOperationReceipt>) {
        self.receipts.lock().unwrap().push_back(receipt);
    }
}

#[async_trait]
impl BundlerRpc for MockBundler {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperationRequest,
        _entry_point: Address,
        state_override: Option<&Value>,
    ) -> Result<GasEstimates> {
        self.estimate_calls.fetch_add(1, Ordering::SeqCst);
        self.estimated.lock().unwrap().push(op.clone());
        self.state_overrides
            .lock()
            .unwrap()
            .push(state_override.cloned());
        if self.fail_estimate {
            return Err(AccountError::Bundler("estimation reverted".into()));
        }
        Ok(Self::estimates())
    }

    async fn send_user_operation(
        &self,
        op: &UserOperationRequest,
        _entry_point: Address,
    ) -> Result<H256> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(op.clone());
        Ok(Self::USER_OP_HASH)
    }

    async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        Ok(self.entry_points.clone())
    }

    async fn get_user_operation_receipt(
        &self,
        _user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.receipts.lock().unwrap().pop_front().flatten())
    }
}

/// A SimpleAccount at a fixed address that already has code.
pub async fn deployed_account(reader: Arc<MockReader>, version: EntryPointVersion) -> SmartContractAccount {
    reader.set_code(vec![0x60, 0x80]);
    simple_account(reader, version, Some(Address::repeat_byte(0xab))).await
}

pub async fn simple_account(
    reader: Arc<MockReader>,
    version: EntryPointVersion,
    account_address: Option<Address>,
) -> SmartContractAccount {
    let account = SimpleAccount::new(sample_wallet(), FACTORY, U256::zero(), version).unwrap();
    to_smart_contract_account(ToSmartContractAccountParams {
        chain_id: 1,
        entry_point: Some(EntryPointDef::new(version, 1)),
        reader,
        account: Arc::new(account),
        account_address,
    })
    .await
    .unwrap()
}
