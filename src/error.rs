use ethers::types::H256;
use thiserror::Error;

/// Errors surfaced by accounts, the middleware pipeline and the client actions.
///
/// Transport failures are carried as strings so the error stays `Clone`; a
/// [`crate::deferred::DeferredValue`] caches a failed resolution by cloning it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    /// Entry point version tag outside of the supported set.
    #[error("unsupported entry point version: {0}")]
    UnsupportedVersion(String),

    /// Entry point definition could not be used on this chain.
    #[error("invalid entry point: version {version} is not supported on chain {chain_id}")]
    InvalidEntryPoint { chain_id: u64, version: String },

    /// The RPC endpoint is malformed.
    #[error("invalid RPC url")]
    InvalidRpcUrl,

    /// `getSenderAddress` did not revert with a `SenderAddressResult`.
    #[error("failed to get counterfactual address")]
    CounterfactualAddress,

    #[error("upgrades are not supported by {0}")]
    UpgradesNotSupported(String),

    #[error("batch execution is not supported by {0}")]
    BatchExecutionNotSupported(String),

    /// A storage read returned no data.
    #[error("failed to read storage slot {slot:?} ({descriptor})")]
    StorageSlotRead { slot: H256, descriptor: String },

    /// No account passed to an action and none bound to the client.
    #[error("no account found: pass an account or bind one to the client")]
    AccountNotFound,

    #[error("transaction is missing the `to` address")]
    TransactionMissingTo,

    /// A user operation built for one entry point was handed to an account of another.
    #[error("account uses entry point v{expected}, user operation was built for v{actual}")]
    EntryPointMismatch { expected: String, actual: String },

    #[error("user operation {0:?} was not included after all retries")]
    ReceiptTimeout(H256),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("bundler error: {0}")]
    Bundler(String),

    #[error("paymaster error: {0}")]
    Paymaster(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("abi error: {0}")]
    Abi(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<ethers::abi::Error> for AccountError {
    fn from(err: ethers::abi::Error) -> Self {
        Self::Abi(err.to_string())
    }
}

impl From<ethers::abi::ParseError> for AccountError {
    fn from(err: ethers::abi::ParseError) -> Self {
        Self::Abi(err.to_string())
    }
}

pub type Result<T, E = AccountError> = std::result::Result<T, E>;
