use crate::encoding::{fmt_address, fmt_h256, parse_address, parse_h256, parse_u256_quantity, user_op_to_json};
use crate::error::AccountError;
use crate::types::UserOperationRequest;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    /// Only reported for v0.7 operations with a paymaster.
    pub paymaster_verification_gas_limit: Option<U256>,
}

#[derive(Debug, Clone)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    /// Hash of the bundle transaction that included the operation.
    pub transaction_hash: H256,
    pub raw: Value,
}

/// ERC-4337 bundler JSON-RPC surface used by the client.
#[async_trait]
pub trait BundlerRpc: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        state_override: Option<&Value>,
    ) -> crate::Result<GasEstimates>;

    async fn send_user_operation(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
    ) -> crate::Result<H256>;

    async fn supported_entry_points(&self) -> crate::Result<Vec<Address>>;

    /// `None` while the operation is not yet included.
    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> crate::Result<Option<UserOperationReceipt>>;
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    async fn estimate(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        state_override: Option<&Value>,
    ) -> Result<GasEstimates> {
        let mut params = vec![user_op_to_json(op), Value::String(fmt_address(entry_point))];
        if let Some(state_override) = state_override {
            params.push(state_override.clone());
        }
        let res = self
            .rpc("eth_estimateUserOperationGas", Value::Array(params))
            .await
            .context("eth_estimateUserOperationGas failed")?;
        parse_gas_estimates(&res)
    }

    async fn send(&self, op: &UserOperationRequest, entry_point: Address) -> Result<H256> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    async fn entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc("eth_supportedEntryPoints", serde_json::json!([]))
            .await
            .context("eth_supportedEntryPoints failed")?;
        res.as_array()
            .ok_or_else(|| anyhow!("expected an array of entry points, got {res}"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| anyhow!("entry point is not a string: {v}"))
                    .and_then(parse_address)
            })
            .collect()
    }

    async fn receipt(&self, user_op_hash: H256) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self
            .rpc("eth_getUserOperationReceipt", params)
            .await
            .context("eth_getUserOperationReceipt failed")?;
        if res.is_null() {
            return Ok(None);
        }
        parse_receipt(res).map(Some)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, url = %self.url, "bundler request");
        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body));
        }

        if let Some(err) = body.get("error") {
            return Err(anyhow!("RPC error: {}", err));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("missing result field"))
    }
}

fn bundler_error(err: anyhow::Error) -> AccountError {
    AccountError::Bundler(format!("{err:#}"))
}

#[async_trait]
impl BundlerRpc for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        state_override: Option<&Value>,
    ) -> crate::Result<GasEstimates> {
        self.estimate(op, entry_point, state_override)
            .await
            .map_err(bundler_error)
    }

    async fn send_user_operation(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
    ) -> crate::Result<H256> {
        self.send(op, entry_point).await.map_err(bundler_error)
    }

    async fn supported_entry_points(&self) -> crate::Result<Vec<Address>> {
        self.entry_points().await.map_err(bundler_error)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> crate::Result<Option<UserOperationReceipt>> {
        self.receipt(user_op_hash).await.map_err(bundler_error)
    }
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u256_quantity(s)
}

fn parse_gas_estimates(res: &Value) -> Result<GasEstimates> {
    let paymaster_verification_gas_limit = match res.get("paymasterVerificationGasLimit") {
        Some(Value::String(s)) => Some(parse_u256_quantity(s)?),
        _ => None,
    };
    Ok(GasEstimates {
        call_gas_limit: parse_u256_field(res, "callGasLimit")?,
        verification_gas_limit: parse_u256_field(res, "verificationGasLimit")?,
        pre_verification_gas: parse_u256_field(res, "preVerificationGas")?,
        paymaster_verification_gas_limit,
    })
}

fn parse_receipt(res: Value) -> Result<UserOperationReceipt> {
    let user_op_hash = res
        .get("userOpHash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("receipt missing userOpHash"))
        .and_then(parse_h256)?;
    let transaction_hash = res
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("receipt missing receipt.transactionHash"))
        .and_then(parse_h256)?;
    let success = res.get("success").and_then(|v| v.as_bool()).unwrap_or(false);

    Ok(UserOperationReceipt {
        user_op_hash,
        success,
        transaction_hash,
        raw: res,
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}
