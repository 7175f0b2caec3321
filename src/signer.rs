use crate::error::{AccountError, Result};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{transaction::eip712::TypedData, Address, Bytes};

/// Key material that owns a smart account.
#[async_trait]
pub trait SmartAccountSigner: Send + Sync {
    fn address(&self) -> Address;

    /// EIP-191 personal message signature.
    async fn sign_message(&self, message: &[u8]) -> Result<Bytes>;

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Bytes>;
}

#[async_trait]
impl SmartAccountSigner for LocalWallet {
    fn address(&self) -> Address {
        Signer::address(self)
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        let sig = Signer::sign_message(self, message)
            .await
            .map_err(|e| AccountError::Signer(e.to_string()))?;
        Ok(Bytes::from(sig.to_vec()))
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Bytes> {
        let sig = Signer::sign_typed_data(self, typed_data)
            .await
            .map_err(|e| AccountError::Signer(e.to_string()))?;
        Ok(Bytes::from(sig.to_vec()))
    }
}
