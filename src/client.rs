//! User operation actions over a bundler.

use crate::account::SmartContractAccount;
use crate::bundler::{BundlerRpc, GasEstimates};
use crate::error::{AccountError, Result};
use crate::middleware::{FeeOptions, MiddlewareContext, MiddlewareStack};
use crate::plugin::{encode_install_plugin, InstallPluginParams};
use crate::types::{
    AccountOp, UpgradeToAndCallParams, UserOperationCallData, UserOperationOverrides,
    UserOperationRequest,
};
use ethers::types::{Address, NameOrAddress, TransactionRequest, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receipt polling schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryOptions {
    pub tx_max_retries: u32,
    pub tx_retry_interval_ms: u64,
    pub tx_retry_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            tx_max_retries: 5,
            tx_retry_interval_ms: 2_000,
            tx_retry_multiplier: 1.5,
        }
    }
}

impl RetryOptions {
    /// Delay before poll number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self.tx_retry_interval_ms as f64 * self.tx_retry_multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64)
    }
}

/// What to execute and how, for one user operation.
#[derive(Clone, Debug)]
pub struct SendUserOperationParameters {
    pub uo: UserOperationCallData,
    pub overrides: UserOperationOverrides,
    /// Falls back to the client's account.
    pub account: Option<SmartContractAccount>,
}

impl SendUserOperationParameters {
    pub fn new(uo: impl Into<UserOperationCallData>) -> Self {
        Self {
            uo: uo.into(),
            overrides: UserOperationOverrides::default(),
            account: None,
        }
    }

    pub fn with_overrides(mut self, overrides: UserOperationOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_account(mut self, account: SmartContractAccount) -> Self {
        self.account = Some(account);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendUserOperationResult {
    pub hash: H256,
    pub request: UserOperationRequest,
}

#[derive(Clone)]
pub struct SmartAccountClient {
    bundler: Arc<dyn BundlerRpc>,
    middleware: MiddlewareStack,
    fee_options: FeeOptions,
    retry: RetryOptions,
    account: Option<SmartContractAccount>,
}

impl SmartAccountClient {
    pub fn new(bundler: Arc<dyn BundlerRpc>, middleware: MiddlewareStack) -> Self {
        Self {
            bundler,
            middleware,
            fee_options: FeeOptions::default(),
            retry: RetryOptions::default(),
            account: None,
        }
    }

    pub fn with_account(mut self, account: SmartContractAccount) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_fee_options(mut self, fee_options: FeeOptions) -> Self {
        self.fee_options = fee_options;
        self
    }

    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn account(&self) -> Option<&SmartContractAccount> {
        self.account.as_ref()
    }

    pub fn middleware(&self) -> &MiddlewareStack {
        &self.middleware
    }

    fn resolve_account<'a>(
        &'a self,
        account: Option<&'a SmartContractAccount>,
    ) -> Result<&'a SmartContractAccount> {
        account
            .or(self.account.as_ref())
            .ok_or(AccountError::AccountNotFound)
    }

    /// Runs the pipeline; the result still carries the dummy signature.
    pub async fn build_user_operation(
        &self,
        args: &SendUserOperationParameters,
    ) -> Result<UserOperationRequest> {
        let account = self.resolve_account(args.account.as_ref())?;
        let call_data = account.encode_call_data(&args.uo)?;
        let uo = account.user_operation_struct(
            call_data,
            args.overrides.nonce_key.unwrap_or_default(),
        );

        let ctx = MiddlewareContext {
            overrides: &args.overrides,
            fee_options: &self.fee_options,
            account,
        };
        self.middleware.run(uo, &ctx).await
    }

    /// Bundler gas estimate for the operation as it would be sent now,
    /// without fee, paymaster or custom stages.
    pub async fn estimate_user_operation_gas(
        &self,
        args: &SendUserOperationParameters,
    ) -> Result<GasEstimates> {
        let account = self.resolve_account(args.account.as_ref())?;
        let call_data = account.encode_call_data(&args.uo)?;
        let mut uo = account.user_operation_struct(
            call_data,
            args.overrides.nonce_key.unwrap_or_default(),
        );
        args.overrides.apply_paymaster(&mut uo);

        let request = uo.resolve_properties().await?;
        self.bundler
            .estimate_user_operation_gas(
                &request,
                account.entry_point().address,
                args.overrides.state_override.as_ref(),
            )
            .await
    }

    pub async fn sign_user_operation(
        &self,
        mut request: UserOperationRequest,
        account: Option<&SmartContractAccount>,
    ) -> Result<UserOperationRequest> {
        let account = self.resolve_account(account)?;
        let entry_point = account.entry_point();
        if request.version() != entry_point.version {
            return Err(AccountError::EntryPointMismatch {
                expected: entry_point.version.to_string(),
                actual: request.version().to_string(),
            });
        }

        let hash = request.hash(entry_point.address, entry_point.chain_id);
        let signature = account.sign_user_operation_hash(hash).await?;
        request.set_signature(signature);
        Ok(request)
    }

    /// Builds, signs and submits; returns once the bundler accepted the operation.
    pub async fn send_user_operation(
        &self,
        args: &SendUserOperationParameters,
    ) -> Result<SendUserOperationResult> {
        let account = self.resolve_account(args.account.as_ref())?;
        let request = self.build_user_operation(args).await?;
        let request = self.sign_user_operation(request, Some(account)).await?;

        let hash = self
            .bundler
            .send_user_operation(&request, account.entry_point().address)
            .await?;
        info!(user_op_hash = ?hash, sender = ?request.sender(), "user operation sent");
        Ok(SendUserOperationResult { hash, request })
    }

    /// Sends a plain transaction request as a user operation and waits for
    /// the bundle transaction hash.
    pub async fn send_transaction(
        &self,
        tx: &TransactionRequest,
        overrides: UserOperationOverrides,
        account: Option<SmartContractAccount>,
    ) -> Result<H256> {
        self.resolve_account(account.as_ref())?;
        let target = match &tx.to {
            Some(NameOrAddress::Address(to)) => *to,
            _ => return Err(AccountError::TransactionMissingTo),
        };
        let op = AccountOp {
            target,
            value: tx.value.unwrap_or_default(),
            data: tx.data.clone().unwrap_or_default(),
        };

        let args = SendUserOperationParameters {
            uo: op.into(),
            overrides,
            account,
        };
        let sent = self.send_user_operation(&args).await?;
        self.wait_for_user_operation_transaction(sent.hash).await
    }

    /// Polls the bundler for the receipt with exponential backoff.
    pub async fn wait_for_user_operation_transaction(&self, hash: H256) -> Result<H256> {
        for attempt in 0..self.retry.tx_max_retries {
            tokio::time::sleep(self.retry.delay(attempt)).await;

            match self.bundler.get_user_operation_receipt(hash).await {
                Ok(Some(receipt)) => {
                    info!(user_op_hash = ?hash, tx_hash = ?receipt.transaction_hash, success = receipt.success, "user operation included");
                    return Ok(receipt.transaction_hash);
                }
                Ok(None) => debug!(user_op_hash = ?hash, attempt, "receipt not yet available"),
                // transient errors are common on free-tier bundlers; keep polling
                Err(e) => warn!(error = %e, attempt, "bundler receipt poll error"),
            }
        }
        Err(AccountError::ReceiptTimeout(hash))
    }

    /// Whether the paymaster stages sponsor this operation. Never fails once
    /// an account is known: any pipeline error means "not eligible".
    pub async fn check_gas_sponsorship_eligibility(
        &self,
        args: &SendUserOperationParameters,
    ) -> Result<bool> {
        self.resolve_account(args.account.as_ref())?;
        match self.build_user_operation(args).await {
            Ok(request) => Ok(request.has_paymaster_data()),
            Err(e) => {
                debug!(error = %e, "sponsorship check failed");
                Ok(false)
            }
        }
    }

    pub async fn get_supported_entry_points(&self) -> Result<Vec<Address>> {
        self.bundler.supported_entry_points().await
    }

    /// Sends `upgradeToAndCall`. Returns the bundle transaction hash when
    /// `wait_for_tx` is set, the user operation hash otherwise.
    pub async fn upgrade_account(
        &self,
        upgrade_to: &UpgradeToAndCallParams,
        overrides: UserOperationOverrides,
        account: Option<SmartContractAccount>,
        wait_for_tx: bool,
    ) -> Result<H256> {
        let resolved = self.resolve_account(account.as_ref())?;
        let call_data = resolved.encode_upgrade_to_and_call(upgrade_to)?;

        let args = SendUserOperationParameters {
            uo: UserOperationCallData::Raw(call_data),
            overrides,
            account,
        };
        let sent = self.send_user_operation(&args).await?;
        if wait_for_tx {
            self.wait_for_user_operation_transaction(sent.hash).await
        } else {
            Ok(sent.hash)
        }
    }

    pub async fn install_plugin(
        &self,
        params: &InstallPluginParams,
        overrides: UserOperationOverrides,
        account: Option<SmartContractAccount>,
    ) -> Result<SendUserOperationResult> {
        let resolved = self.resolve_account(account.as_ref())?;
        let call_data = encode_install_plugin(resolved.reader().as_ref(), params).await?;

        let args = SendUserOperationParameters {
            uo: UserOperationCallData::Raw(call_data),
            overrides,
            account,
        };
        self.send_user_operation(&args).await
    }
}

impl From<&crate::config::ClientOptions> for RetryOptions {
    fn from(opts: &crate::config::ClientOptions) -> Self {
        Self {
            tx_max_retries: opts.tx_max_retries,
            tx_retry_interval_ms: opts.tx_retry_interval_ms,
            tx_retry_multiplier: opts.tx_retry_multiplier,
        }
    }
}

impl From<&crate::config::ClientOptions> for FeeOptions {
    fn from(opts: &crate::config::ClientOptions) -> Self {
        Self {
            min_priority_fee_per_bid: U256::from(opts.min_priority_fee_per_bid),
            max_priority_fee_per_gas_estimate_buffer: opts.max_priority_fee_per_gas_estimate_buffer,
        }
    }
}
