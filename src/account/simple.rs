use super::{to_smart_contract_account, AccountImpl, SmartContractAccount, ToSmartContractAccountParams};
use crate::entrypoint::{EntryPointDef, EntryPointVersion};
use crate::error::{AccountError, Result};
use crate::provider::ChainReader;
use crate::signer::SmartAccountSigner;
use crate::types::{AccountOp, UpgradeToAndCallParams};
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, Token};
use ethers::types::{transaction::eip712::TypedData, Address, Bytes, U256};
use std::sync::Arc;

/// SimpleAccountFactory deployed alongside entry point v0.6.
const SIMPLE_ACCOUNT_FACTORY_V060: [u8; 20] = [
    0x94, 0x06, 0xcc, 0x61, 0x85, 0xa3, 0x46, 0x90, 0x62, 0x96, 0x84, 0x07, 0x46, 0x12, 0x5a, 0x0e,
    0x44, 0x97, 0x64, 0x54,
];

/// SimpleAccountFactory deployed alongside entry point v0.7.
const SIMPLE_ACCOUNT_FACTORY_V070: [u8; 20] = [
    0x91, 0xe6, 0x0e, 0x06, 0x13, 0x81, 0x04, 0x49, 0xd0, 0x98, 0xb0, 0xb5, 0xec, 0x8b, 0x51, 0xa0,
    0xfe, 0x8c, 0x89, 0x85,
];

const FACTORY_ABI: &[&str] = &[
    "function createAccount(address owner, uint256 salt) returns (address)",
];

const ACCOUNT_ABI_V060: &[&str] = &[
    "function execute(address dest, uint256 value, bytes func)",
    "function executeBatch(address[] dest, bytes[] func)",
    "function upgradeToAndCall(address newImplementation, bytes data)",
];

const ACCOUNT_ABI_V070: &[&str] = &[
    "function execute(address dest, uint256 value, bytes func)",
    "function executeBatch(address[] dest, uint256[] value, bytes[] func)",
    "function upgradeToAndCall(address newImplementation, bytes data)",
];

pub fn default_factory_address(version: EntryPointVersion) -> Address {
    match version {
        EntryPointVersion::V060 => Address::from(SIMPLE_ACCOUNT_FACTORY_V060),
        EntryPointVersion::V070 => Address::from(SIMPLE_ACCOUNT_FACTORY_V070),
    }
}

/// Signature with valid ECDSA shape (low `s`, `v = 28`) that recovers to no known key.
pub fn dummy_signature() -> Bytes {
    let mut sig = [0u8; 65];
    sig[..15].fill(0xff);
    sig[15] = 0xf0;
    sig[32] = 0x7a;
    sig[33..64].fill(0xaa);
    sig[64] = 0x1c;
    Bytes::from(sig.to_vec())
}

/// eth-infinitism `SimpleAccount`, deployed by `SimpleAccountFactory.createAccount(owner, salt)`.
pub struct SimpleAccount<S> {
    signer: S,
    factory: Address,
    salt: U256,
    version: EntryPointVersion,
    factory_abi: Abi,
    account_abi: Abi,
}

impl<S: SmartAccountSigner> SimpleAccount<S> {
    pub fn new(
        signer: S,
        factory: Address,
        salt: U256,
        version: EntryPointVersion,
    ) -> Result<Self> {
        let account_abi = match version {
            EntryPointVersion::V060 => AbiParser::default().parse(ACCOUNT_ABI_V060)?,
            EntryPointVersion::V070 => AbiParser::default().parse(ACCOUNT_ABI_V070)?,
        };
        Ok(Self {
            signer,
            factory,
            salt,
            version,
            factory_abi: AbiParser::default().parse(FACTORY_ABI)?,
            account_abi,
        })
    }

    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    fn encode(&self, name: &str, args: &[Token]) -> Result<Bytes> {
        let data = self.account_abi.function(name)?.encode_input(args)?;
        Ok(data.into())
    }
}

#[async_trait]
impl<S: SmartAccountSigner + 'static> AccountImpl for SimpleAccount<S> {
    fn source(&self) -> &str {
        "SimpleAccount"
    }

    async fn get_account_init_code(&self) -> Result<Bytes> {
        let calldata = self.factory_abi.function("createAccount")?.encode_input(&[
            Token::Address(self.signer.address()),
            Token::Uint(self.salt),
        ])?;

        let mut v = Vec::with_capacity(20 + calldata.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(&calldata);
        Ok(Bytes::from(v))
    }

    fn get_dummy_signature(&self) -> Bytes {
        dummy_signature()
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        self.signer.sign_message(message).await
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Bytes> {
        self.signer.sign_typed_data(typed_data).await
    }

    fn encode_execute(&self, op: &AccountOp) -> Result<Bytes> {
        self.encode(
            "execute",
            &[
                Token::Address(op.target),
                Token::Uint(op.value),
                Token::Bytes(op.data.to_vec()),
            ],
        )
    }

    fn encode_batch_execute(&self, ops: &[AccountOp]) -> Result<Bytes> {
        let dest = Token::Array(ops.iter().map(|op| Token::Address(op.target)).collect());
        let func = Token::Array(ops.iter().map(|op| Token::Bytes(op.data.to_vec())).collect());

        match self.version {
            EntryPointVersion::V060 => {
                if ops.iter().any(|op| !op.value.is_zero()) {
                    return Err(AccountError::BatchExecutionNotSupported(
                        self.source().to_string(),
                    ));
                }
                self.encode("executeBatch", &[dest, func])
            }
            EntryPointVersion::V070 => {
                let value = Token::Array(ops.iter().map(|op| Token::Uint(op.value)).collect());
                self.encode("executeBatch", &[dest, value, func])
            }
        }
    }

    fn encode_upgrade_to_and_call(&self, params: &UpgradeToAndCallParams) -> Result<Bytes> {
        self.encode(
            "upgradeToAndCall",
            &[
                Token::Address(params.upgrade_to_address),
                Token::Bytes(params.upgrade_to_init_data.to_vec()),
            ],
        )
    }
}

/// Builds a [`SmartContractAccount`] over a [`SimpleAccount`] owned by `signer`.
pub async fn create_simple_smart_account<S: SmartAccountSigner + 'static>(
    signer: S,
    factory: Option<Address>,
    salt: U256,
    entry_point: EntryPointDef,
    reader: Arc<dyn ChainReader>,
    account_address: Option<Address>,
) -> Result<SmartContractAccount> {
    let version = entry_point.version;
    let factory = factory.unwrap_or_else(|| default_factory_address(version));
    let account = SimpleAccount::new(signer, factory, salt, version)?;

    to_smart_contract_account(ToSmartContractAccountParams {
        chain_id: entry_point.chain_id,
        entry_point: Some(entry_point),
        reader,
        account: Arc::new(account),
        account_address,
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_wallet;
    use ethers::abi::{decode, ParamType};

    fn account(version: EntryPointVersion) -> SimpleAccount<ethers::signers::LocalWallet> {
        SimpleAccount::new(sample_wallet(), Address::repeat_byte(0xfa), U256::from(7), version)
            .unwrap()
    }

    #[test]
    fn dummy_signature_shape() {
        let sig = dummy_signature();
        assert_eq!(sig.len(), 65);
        assert_eq!(sig[15], 0xf0);
        assert!(sig[16..32].iter().all(|b| *b == 0));
        assert_eq!(sig[32], 0x7a);
        assert_eq!(sig[64], 0x1c);
    }

    #[tokio::test]
    async fn init_code_calls_create_account() {
        let acct = account(EntryPointVersion::V060);
        let init = acct.get_account_init_code().await.unwrap();
        assert_eq!(&init[..20], Address::repeat_byte(0xfa).as_bytes());
        assert_eq!(&init[20..24], &ethers::utils::id("createAccount(address,uint256)"));

        let args = decode(&[ParamType::Address, ParamType::Uint(256)], &init[24..]).unwrap();
        assert_eq!(args[0], Token::Address(acct.owner()));
        assert_eq!(args[1], Token::Uint(U256::from(7)));
    }

    #[test]
    fn execute_encoding() {
        let acct = account(EntryPointVersion::V060);
        let op = AccountOp::new(Address::repeat_byte(0x01), Bytes::from(vec![0xab]))
            .with_value(U256::from(5));
        let data = acct.encode_execute(&op).unwrap();
        assert_eq!(&data[..4], &ethers::utils::id("execute(address,uint256,bytes)"));
    }

    #[test]
    fn batch_encoding_follows_version() {
        let ops = vec![
            AccountOp::new(Address::repeat_byte(0x01), Bytes::from(vec![0x01])),
            AccountOp::new(Address::repeat_byte(0x02), Bytes::new()),
        ];

        let v6 = account(EntryPointVersion::V060).encode_batch_execute(&ops).unwrap();
        assert_eq!(&v6[..4], &ethers::utils::id("executeBatch(address[],bytes[])"));

        let v7 = account(EntryPointVersion::V070).encode_batch_execute(&ops).unwrap();
        assert_eq!(
            &v7[..4],
            &ethers::utils::id("executeBatch(address[],uint256[],bytes[])")
        );

        let with_value = vec![ops[0].clone().with_value(U256::one())];
        assert!(matches!(
            account(EntryPointVersion::V060).encode_batch_execute(&with_value),
            Err(AccountError::BatchExecutionNotSupported(_))
        ));
    }

    #[test]
    fn upgrade_encoding() {
        let data = account(EntryPointVersion::V070)
            .encode_upgrade_to_and_call(&UpgradeToAndCallParams {
                upgrade_to_address: Address::repeat_byte(0x09),
                upgrade_to_init_data: Bytes::new(),
            })
            .unwrap();
        assert_eq!(&data[..4], &ethers::utils::id("upgradeToAndCall(address,bytes)"));
    }
}
