use crate::error::{AccountError, Result};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, MiddlewareError, Provider};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, TransactionRequest, H256,
    U256,
};
use std::{sync::Arc, time::Duration};

/// A failed `eth_call`.
///
/// Reverts are expected control flow for some reads (`getSenderAddress`), so
/// the revert payload is kept alongside the message.
#[derive(Clone, Debug, Default)]
pub struct CallError {
    pub revert_data: Option<Bytes>,
    /// The endpoint itself is unusable.
    pub invalid_url: bool,
    pub message: String,
}

impl From<CallError> for AccountError {
    fn from(err: CallError) -> Self {
        if err.invalid_url {
            AccountError::InvalidRpcUrl
        } else {
            AccountError::Provider(err.message)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeData {
    pub base_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// On-chain reads the account and the default middleware need.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_code(&self, address: Address) -> Result<Bytes>;

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, CallError>;

    /// `None` when the node answers `null`.
    async fn get_storage_at(&self, address: Address, slot: H256) -> Result<Option<H256>>;

    async fn fee_data(&self) -> Result<FeeData>;
}

/// [`ChainReader`] over any ethers middleware.
#[derive(Debug, Clone)]
pub struct RpcReader<M> {
    client: Arc<M>,
}

impl RpcReader<Provider<Http>> {
    pub fn from_url(url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|_| AccountError::InvalidRpcUrl)?
            .interval(Duration::from_millis(350));
        Ok(Self::new(Arc::new(provider)))
    }
}

impl<M: Middleware + 'static> RpcReader<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Arc<M> {
        self.client.clone()
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainReader for RpcReader<M> {
    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.client
            .get_code(address, None)
            .await
            .map_err(|e| AccountError::Provider(format!("eth_getCode failed: {e}")))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, CallError> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.client.call(&tx, None).await.map_err(|err| {
            let message = err.to_string();
            CallError {
                revert_data: err.as_error_response().and_then(|e| e.as_revert_data()),
                invalid_url: is_invalid_url(&message),
                message,
            }
        })
    }

    async fn get_storage_at(&self, address: Address, slot: H256) -> Result<Option<H256>> {
        self.client
            .provider()
            .request::<_, Option<H256>>("eth_getStorageAt", (address, slot, "latest"))
            .await
            .map_err(|e| AccountError::Provider(format!("eth_getStorageAt failed: {e}")))
    }

    async fn fee_data(&self) -> Result<FeeData> {
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| AccountError::Provider(format!("eth_getBlockByNumber failed: {e}")))?;
        let base_fee_per_gas = block
            .and_then(|b| b.base_fee_per_gas)
            .unwrap_or_default();

        // Not every node implements eth_maxPriorityFeePerGas; fall back to the legacy price.
        let max_priority_fee_per_gas = match self
            .client
            .provider()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(fee) => fee,
            Err(e) => {
                tracing::debug!(error = %e, "eth_maxPriorityFeePerGas unavailable, using eth_gasPrice");
                self.client
                    .get_gas_price()
                    .await
                    .map_err(|e| AccountError::Provider(format!("eth_gasPrice failed: {e}")))?
            }
        };

        Ok(FeeData {
            base_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }
}

fn is_invalid_url(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("invalid url")
        || message.contains("relative url without a base")
        || message.contains("builder error")
}
