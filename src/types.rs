use crate::deferred::DeferredValue;
use crate::entrypoint::EntryPointVersion;
use crate::error::Result;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// One call executed by the smart account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountOp {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

impl AccountOp {
    pub fn new(target: Address, data: Bytes) -> Self {
        Self {
            target,
            value: U256::zero(),
            data,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// What the user operation executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserOperationCallData {
    Single(AccountOp),
    Batch(Vec<AccountOp>),
    /// Already encoded account call data.
    Raw(Bytes),
}

impl From<AccountOp> for UserOperationCallData {
    fn from(op: AccountOp) -> Self {
        Self::Single(op)
    }
}

impl From<Vec<AccountOp>> for UserOperationCallData {
    fn from(ops: Vec<AccountOp>) -> Self {
        Self::Batch(ops)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeToAndCallParams {
    pub upgrade_to_address: Address,
    pub upgrade_to_init_data: Bytes,
}

/// Caller-supplied values that win over whatever a middleware stage computes.
#[derive(Clone, Debug, Default)]
pub struct UserOperationOverrides {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    /// v0.6: the full `paymasterAndData`; v0.7: `paymaster || verificationGas(16) || postOpGas(16) || data`.
    pub paymaster_and_data: Option<Bytes>,
    /// v0.7 paymaster fields; wins over `paymaster_and_data` when both are set.
    pub paymaster_data: Option<PaymasterFields>,
    pub nonce_key: Option<U256>,
    /// Passed through to `eth_estimateUserOperationGas`.
    pub state_override: Option<serde_json::Value>,
}

impl UserOperationOverrides {
    /// Writes the paymaster override into `uo`; `false` when there is none.
    pub fn apply_paymaster(&self, uo: &mut UserOperationStruct) -> bool {
        if let Some(fields) = &self.paymaster_data {
            uo.set_paymaster(fields.clone());
            return true;
        }
        if let Some(data) = &self.paymaster_and_data {
            uo.set_paymaster_and_data(data.clone());
            return true;
        }
        false
    }
}

/// v0.6 user operation under construction.
#[derive(Debug)]
pub struct UserOperationStructV060 {
    pub sender: Address,
    pub nonce: DeferredValue<U256>,
    pub init_code: DeferredValue<Bytes>,
    pub call_data: DeferredValue<Bytes>,
    pub call_gas_limit: DeferredValue<U256>,
    pub verification_gas_limit: DeferredValue<U256>,
    pub pre_verification_gas: DeferredValue<U256>,
    pub max_fee_per_gas: DeferredValue<U256>,
    pub max_priority_fee_per_gas: DeferredValue<U256>,
    pub paymaster_and_data: DeferredValue<Bytes>,
    pub signature: DeferredValue<Bytes>,
}

/// v0.7 user operation under construction.
#[derive(Debug)]
pub struct UserOperationStructV070 {
    pub sender: Address,
    pub nonce: DeferredValue<U256>,
    pub factory: DeferredValue<Option<Address>>,
    pub factory_data: DeferredValue<Option<Bytes>>,
    pub call_data: DeferredValue<Bytes>,
    pub call_gas_limit: DeferredValue<U256>,
    pub verification_gas_limit: DeferredValue<U256>,
    pub pre_verification_gas: DeferredValue<U256>,
    pub max_fee_per_gas: DeferredValue<U256>,
    pub max_priority_fee_per_gas: DeferredValue<U256>,
    pub paymaster: DeferredValue<Option<Address>>,
    pub paymaster_verification_gas_limit: DeferredValue<Option<U256>>,
    pub paymaster_post_op_gas_limit: DeferredValue<Option<U256>>,
    pub paymaster_data: DeferredValue<Option<Bytes>>,
    pub signature: DeferredValue<Bytes>,
}

/// A partially built user operation; the variant is fixed by the account's entry point.
#[derive(Debug)]
pub enum UserOperationStruct {
    V060(UserOperationStructV060),
    V070(UserOperationStructV070),
}

impl UserOperationStruct {
    pub fn version(&self) -> EntryPointVersion {
        match self {
            Self::V060(_) => EntryPointVersion::V060,
            Self::V070(_) => EntryPointVersion::V070,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            Self::V060(uo) => uo.sender,
            Self::V070(uo) => uo.sender,
        }
    }

    pub fn set_gas_limits(&mut self, call: U256, verification: U256, pre_verification: U256) {
        let (c, v, p) = match self {
            Self::V060(uo) => (
                &mut uo.call_gas_limit,
                &mut uo.verification_gas_limit,
                &mut uo.pre_verification_gas,
            ),
            Self::V070(uo) => (
                &mut uo.call_gas_limit,
                &mut uo.verification_gas_limit,
                &mut uo.pre_verification_gas,
            ),
        };
        *c = call.into();
        *v = verification.into();
        *p = pre_verification.into();
    }

    pub fn set_fees(&mut self, max_fee_per_gas: U256, max_priority_fee_per_gas: U256) {
        match self {
            Self::V060(uo) => {
                uo.max_fee_per_gas = max_fee_per_gas.into();
                uo.max_priority_fee_per_gas = max_priority_fee_per_gas.into();
            }
            Self::V070(uo) => {
                uo.max_fee_per_gas = max_fee_per_gas.into();
                uo.max_priority_fee_per_gas = max_priority_fee_per_gas.into();
            }
        }
    }

    /// Sets the paymaster fields from a v0.6-style `paymasterAndData` blob.
    ///
    /// On v0.7 the blob is split into its packed parts; an empty blob clears them.
    pub fn set_paymaster_and_data(&mut self, paymaster_and_data: Bytes) {
        match self {
            Self::V060(uo) => uo.paymaster_and_data = paymaster_and_data.into(),
            Self::V070(uo) => {
                let unpacked = unpack_paymaster_and_data(&paymaster_and_data);
                uo.paymaster = unpacked.map(|p| p.paymaster).into();
                uo.paymaster_verification_gas_limit =
                    unpacked.map(|p| p.verification_gas_limit).into();
                uo.paymaster_post_op_gas_limit = unpacked.map(|p| p.post_op_gas_limit).into();
                uo.paymaster_data = unpacked.map(|p| Bytes::from(p.data.to_vec())).into();
            }
        }
    }

    /// Sets v0.7 paymaster fields directly. On v0.6 they are folded into
    /// `paymasterAndData` as the address followed by the data.
    pub fn set_paymaster(&mut self, fields: PaymasterFields) {
        match self {
            Self::V060(uo) => {
                let mut packed = Vec::with_capacity(20 + fields.data.len());
                packed.extend_from_slice(fields.paymaster.as_bytes());
                packed.extend_from_slice(&fields.data);
                uo.paymaster_and_data = Bytes::from(packed).into();
            }
            Self::V070(uo) => {
                uo.paymaster = Some(fields.paymaster).into();
                uo.paymaster_data = Some(fields.data).into();
                // A final paymaster response may omit limits already set from stub data.
                if let Some(limit) = fields.verification_gas_limit {
                    uo.paymaster_verification_gas_limit = Some(limit).into();
                }
                if let Some(limit) = fields.post_op_gas_limit {
                    uo.paymaster_post_op_gas_limit = Some(limit).into();
                }
            }
        }
    }

    /// v0.7 only; v0.6 folds paymaster gas into `verificationGasLimit`.
    pub fn set_paymaster_verification_gas_limit(&mut self, limit: U256) {
        if let Self::V070(uo) = self {
            uo.paymaster_verification_gas_limit = Some(limit).into();
        }
    }

    pub fn set_signature(&mut self, signature: Bytes) {
        match self {
            Self::V060(uo) => uo.signature = signature.into(),
            Self::V070(uo) => uo.signature = signature.into(),
        }
    }

    /// Resolves every field in place and returns a concrete snapshot.
    ///
    /// Fields stay resolved afterwards, so later stages and the final pass
    /// reuse the cached values.
    pub async fn resolve_all(&mut self) -> Result<UserOperationRequest> {
        match self {
            Self::V060(uo) => {
                let (
                    nonce,
                    init_code,
                    call_data,
                    call_gas_limit,
                    verification_gas_limit,
                    pre_verification_gas,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    paymaster_and_data,
                    signature,
                ) = futures::try_join!(
                    uo.nonce.resolve(),
                    uo.init_code.resolve(),
                    uo.call_data.resolve(),
                    uo.call_gas_limit.resolve(),
                    uo.verification_gas_limit.resolve(),
                    uo.pre_verification_gas.resolve(),
                    uo.max_fee_per_gas.resolve(),
                    uo.max_priority_fee_per_gas.resolve(),
                    uo.paymaster_and_data.resolve(),
                    uo.signature.resolve(),
                )?;
                Ok(UserOperationRequest::V060(UserOperationV060 {
                    sender: uo.sender,
                    nonce,
                    init_code,
                    call_data,
                    call_gas_limit,
                    verification_gas_limit,
                    pre_verification_gas,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    paymaster_and_data,
                    signature,
                }))
            }
            Self::V070(uo) => {
                let (
                    nonce,
                    factory,
                    factory_data,
                    call_data,
                    call_gas_limit,
                    verification_gas_limit,
                    pre_verification_gas,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    paymaster,
                    paymaster_verification_gas_limit,
                    paymaster_post_op_gas_limit,
                    paymaster_data,
                    signature,
                ) = futures::try_join!(
                    uo.nonce.resolve(),
                    uo.factory.resolve(),
                    uo.factory_data.resolve(),
                    uo.call_data.resolve(),
                    uo.call_gas_limit.resolve(),
                    uo.verification_gas_limit.resolve(),
                    uo.pre_verification_gas.resolve(),
                    uo.max_fee_per_gas.resolve(),
                    uo.max_priority_fee_per_gas.resolve(),
                    uo.paymaster.resolve(),
                    uo.paymaster_verification_gas_limit.resolve(),
                    uo.paymaster_post_op_gas_limit.resolve(),
                    uo.paymaster_data.resolve(),
                    uo.signature.resolve(),
                )?;
                Ok(UserOperationRequest::V070(UserOperationV070 {
                    sender: uo.sender,
                    nonce,
                    factory,
                    factory_data,
                    call_data,
                    call_gas_limit,
                    verification_gas_limit,
                    pre_verification_gas,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    paymaster,
                    paymaster_verification_gas_limit,
                    paymaster_post_op_gas_limit,
                    paymaster_data,
                    signature,
                }))
            }
        }
    }

    /// Final resolution pass: consumes the struct, leaving no pending field behind.
    pub async fn resolve_properties(mut self) -> Result<UserOperationRequest> {
        self.resolve_all().await
    }
}

/// v0.7 paymaster fields, also the unpacked form of a v0.7 `paymasterAndData`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: Option<U256>,
    pub post_op_gas_limit: Option<U256>,
    pub data: Bytes,
}

#[derive(Clone, Copy)]
struct UnpackedPaymaster<'a> {
    paymaster: Address,
    verification_gas_limit: U256,
    post_op_gas_limit: U256,
    data: &'a [u8],
}

fn unpack_paymaster_and_data(raw: &[u8]) -> Option<UnpackedPaymaster<'_>> {
    if raw.len() < 20 {
        return None;
    }
    let paymaster = Address::from_slice(&raw[..20]);
    if raw.len() < 52 {
        return Some(UnpackedPaymaster {
            paymaster,
            verification_gas_limit: U256::zero(),
            post_op_gas_limit: U256::zero(),
            data: &raw[20..],
        });
    }
    Some(UnpackedPaymaster {
        paymaster,
        verification_gas_limit: U256::from_big_endian(&raw[20..36]),
        post_op_gas_limit: U256::from_big_endian(&raw[36..52]),
        data: &raw[52..],
    })
}

/// Fully resolved v0.6 user operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperationV060 {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperationV060 {
    fn pack_without_signature(&self) -> Vec<u8> {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
    }
}

/// Fully resolved v0.7 user operation, in the unpacked RPC shape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperationV070 {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<Address>,
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster: Option<Address>,
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
}

impl UserOperationV070 {
    /// `factory || factoryData`, empty when the account is deployed.
    pub fn init_code(&self) -> Bytes {
        match (self.factory, self.factory_data.as_ref()) {
            (Some(factory), data) => {
                let data = data.map(|d| &d[..]).unwrap_or_default();
                let mut v = Vec::with_capacity(20 + data.len());
                v.extend_from_slice(factory.as_bytes());
                v.extend_from_slice(data);
                Bytes::from(v)
            }
            (None, _) => Bytes::new(),
        }
    }

    /// `paymaster || verificationGasLimit(16) || postOpGasLimit(16) || paymasterData`.
    pub fn paymaster_and_data(&self) -> Bytes {
        let Some(paymaster) = self.paymaster else {
            return Bytes::new();
        };
        let data = self
            .paymaster_data
            .as_ref()
            .map(|d| &d[..])
            .unwrap_or_default();
        let mut v = Vec::with_capacity(52 + data.len());
        v.extend_from_slice(paymaster.as_bytes());
        v.extend_from_slice(&low_u128_bytes(
            self.paymaster_verification_gas_limit.unwrap_or_default(),
        ));
        v.extend_from_slice(&low_u128_bytes(
            self.paymaster_post_op_gas_limit.unwrap_or_default(),
        ));
        v.extend_from_slice(data);
        Bytes::from(v)
    }

    fn pack_without_signature(&self) -> Vec<u8> {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(self.init_code()).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::FixedBytes(pack_u128_pair(
                self.verification_gas_limit,
                self.call_gas_limit,
            )),
            Token::Uint(self.pre_verification_gas),
            Token::FixedBytes(pack_u128_pair(
                self.max_priority_fee_per_gas,
                self.max_fee_per_gas,
            )),
            Token::FixedBytes(keccak256(self.paymaster_and_data()).to_vec()),
        ])
    }
}

fn low_u128_bytes(v: U256) -> [u8; 16] {
    let mut word = [0u8; 32];
    v.to_big_endian(&mut word);
    let mut out = [0u8; 16];
    out.copy_from_slice(&word[16..]);
    out
}

fn pack_u128_pair(high: U256, low: U256) -> Vec<u8> {
    let mut v = Vec::with_capacity(32);
    v.extend_from_slice(&low_u128_bytes(high));
    v.extend_from_slice(&low_u128_bytes(low));
    v
}

/// A user operation ready for the bundler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserOperationRequest {
    V060(UserOperationV060),
    V070(UserOperationV070),
}

impl UserOperationRequest {
    pub fn version(&self) -> EntryPointVersion {
        match self {
            Self::V060(_) => EntryPointVersion::V060,
            Self::V070(_) => EntryPointVersion::V070,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            Self::V060(op) => op.sender,
            Self::V070(op) => op.sender,
        }
    }

    pub fn call_data(&self) -> &Bytes {
        match self {
            Self::V060(op) => &op.call_data,
            Self::V070(op) => &op.call_data,
        }
    }

    pub fn signature(&self) -> &Bytes {
        match self {
            Self::V060(op) => &op.signature,
            Self::V070(op) => &op.signature,
        }
    }

    pub fn set_signature(&mut self, signature: Bytes) {
        match self {
            Self::V060(op) => op.signature = signature,
            Self::V070(op) => op.signature = signature,
        }
    }

    /// Whether a paymaster filled in sponsorship data.
    pub fn has_paymaster_data(&self) -> bool {
        match self {
            Self::V060(op) => !op.paymaster_and_data.is_empty(),
            Self::V070(op) => op
                .paymaster_data
                .as_ref()
                .map(|d| !d.is_empty())
                .unwrap_or(false),
        }
    }

    /// ERC-4337 `userOpHash`: `keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))`.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed = match self {
            Self::V060(op) => op.pack_without_signature(),
            Self::V070(op) => op.pack_without_signature(),
        };
        let op_hash = keccak256(packed);
        H256::from(keccak256(encode(&[
            Token::FixedBytes(op_hash.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ])))
    }
}
