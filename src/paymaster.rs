use crate::encoding::{self, parse_address, parse_bytes, parse_u256_quantity};
use crate::entrypoint::EntryPointVersion;
use crate::error::AccountError;
use crate::middleware::{MiddlewareContext, UserOperationMiddleware};
use crate::types::{PaymasterFields, UserOperationRequest, UserOperationStruct};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;
use std::sync::Arc;

/// Sponsorship policy sent as the ERC-7677 `context` object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymasterPolicy {
    pub policy_id: String,
    pub webhook_data: Option<String>,
}

/// Paymaster data in the shape of the operation's entry point version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymasterResponse {
    V060(Bytes),
    V070(PaymasterFields),
}

impl PaymasterResponse {
    fn apply_to(self, uo: &mut UserOperationStruct) {
        match self {
            Self::V060(data) => uo.set_paymaster_and_data(data),
            Self::V070(fields) => uo.set_paymaster(fields),
        }
    }
}

/// ERC-7677 paymaster web service surface used by the paymaster stages.
#[async_trait]
pub trait PaymasterRpc: Send + Sync {
    async fn get_paymaster_stub_data(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        chain_id: u64,
        policy: &PaymasterPolicy,
    ) -> crate::Result<PaymasterResponse>;

    async fn get_paymaster_data(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        chain_id: u64,
        policy: &PaymasterPolicy,
    ) -> crate::Result<PaymasterResponse>;
}

/// Minimal ERC-7677 paymaster web service client
/// (`pm_getPaymasterStubData` and `pm_getPaymasterData`).
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    url: String,
    http: reqwest::Client,
}

impl PaymasterClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    async fn request(
        &self,
        method: &str,
        op: &UserOperationRequest,
        entry_point: Address,
        chain_id: u64,
        policy: &PaymasterPolicy,
    ) -> Result<PaymasterResponse> {
        let params = build_params(op, entry_point, chain_id, policy);
        let res = self
            .rpc(method, params)
            .await
            .with_context(|| format!("{method} RPC failed"))?;
        parse_paymaster_response(&res, op.version())
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, url = %self.url, "paymaster request");
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

fn paymaster_error(err: anyhow::Error) -> AccountError {
    AccountError::Paymaster(format!("{err:#}"))
}

#[async_trait]
impl PaymasterRpc for PaymasterClient {
    async fn get_paymaster_stub_data(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        chain_id: u64,
        policy: &PaymasterPolicy,
    ) -> crate::Result<PaymasterResponse> {
        self.request("pm_getPaymasterStubData", op, entry_point, chain_id, policy)
            .await
            .map_err(paymaster_error)
    }

    async fn get_paymaster_data(
        &self,
        op: &UserOperationRequest,
        entry_point: Address,
        chain_id: u64,
        policy: &PaymasterPolicy,
    ) -> crate::Result<PaymasterResponse> {
        self.request("pm_getPaymasterData", op, entry_point, chain_id, policy)
            .await
            .map_err(paymaster_error)
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Stub,
    Final,
}

/// A pipeline stage backed by an ERC-7677 paymaster.
///
/// Install [`Erc7677Paymaster::stub`] in the dummy paymaster slot and
/// [`Erc7677Paymaster::data`] in the paymaster slot.
pub struct Erc7677Paymaster {
    client: Arc<dyn PaymasterRpc>,
    policy: PaymasterPolicy,
    phase: Phase,
}

impl Erc7677Paymaster {
    pub fn stub(client: Arc<dyn PaymasterRpc>, policy: PaymasterPolicy) -> Arc<Self> {
        Arc::new(Self {
            client,
            policy,
            phase: Phase::Stub,
        })
    }

    pub fn data(client: Arc<dyn PaymasterRpc>, policy: PaymasterPolicy) -> Arc<Self> {
        Arc::new(Self {
            client,
            policy,
            phase: Phase::Final,
        })
    }
}

#[async_trait]
impl UserOperationMiddleware for Erc7677Paymaster {
    async fn apply(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> crate::Result<UserOperationStruct> {
        if ctx.overrides.apply_paymaster(&mut uo) {
            return Ok(uo);
        }

        let request = uo.resolve_all().await?;
        let entry_point = ctx.account.entry_point();
        let response = match self.phase {
            Phase::Stub => {
                self.client
                    .get_paymaster_stub_data(&request, entry_point.address, entry_point.chain_id, &self.policy)
                    .await
            }
            Phase::Final => {
                self.client
                    .get_paymaster_data(&request, entry_point.address, entry_point.chain_id, &self.policy)
                    .await
            }
        }?;

        response.apply_to(&mut uo);
        Ok(uo)
    }
}

fn build_params(
    op: &UserOperationRequest,
    entry_point: Address,
    chain_id: u64,
    policy: &PaymasterPolicy,
) -> Value {
    let mut ctx = serde_json::json!({
        "policyId": policy.policy_id,
    });

    if let Some(wd) = &policy.webhook_data {
        if let Some(obj) = ctx.as_object_mut() {
            obj.insert("webhookData".to_string(), Value::String(wd.clone()));
        }
    }

    serde_json::json!([
        encoding::user_op_to_json(op),
        encoding::fmt_address(entry_point),
        encoding::fmt_u256(U256::from(chain_id)),
        ctx
    ])
}

fn parse_paymaster_response(result: &Value, version: EntryPointVersion) -> Result<PaymasterResponse> {
    match version {
        EntryPointVersion::V060 => parse_v06_paymaster_and_data(result).map(PaymasterResponse::V060),
        EntryPointVersion::V070 => parse_v07_paymaster_fields(result).map(PaymasterResponse::V070),
    }
}

/// Top-level fields per ERC-7677, or nested under a per-version key as some providers do.
fn versioned<'a>(result: &'a Value, top_level_key: &str, nested: [&str; 2]) -> Option<&'a Value> {
    if result.get(top_level_key).is_some() {
        return Some(result);
    }
    nested.iter().find_map(|key| result.get(*key))
}

fn parse_v06_paymaster_and_data(result: &Value) -> Result<Bytes> {
    let v06 = versioned(
        result,
        "paymasterAndData",
        ["entrypointV06Response", "entryPointV06Response"],
    )
    .ok_or_else(|| {
        anyhow!(
            "missing paymasterAndData (expected top-level paymasterAndData or entrypointV06Response.paymasterAndData)"
        )
    })?;

    let s = v06
        .get("paymasterAndData")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing paymasterAndData field"))?;
    parse_bytes(s).context("invalid hex in paymasterAndData")
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

fn parse_v07_paymaster_fields(result: &Value) -> Result<PaymasterFields> {
    let v07 = versioned(
        result,
        "paymaster",
        ["entrypointV07Response", "entryPointV07Response"],
    )
    .ok_or_else(|| {
        anyhow!("missing paymaster (expected top-level paymaster or entrypointV07Response.paymaster)")
    })?;

    let paymaster = str_field(v07, "paymaster")
        .ok_or_else(|| anyhow!("missing paymaster field"))
        .and_then(parse_address)?;
    let data = match str_field(v07, "paymasterData") {
        Some(s) => parse_bytes(s).context("invalid hex in paymasterData")?,
        None => Bytes::new(),
    };
    let verification_gas_limit = str_field(v07, "paymasterVerificationGasLimit")
        .map(parse_u256_quantity)
        .transpose()?;
    let post_op_gas_limit = str_field(v07, "paymasterPostOpGasLimit")
        .map(parse_u256_quantity)
        .transpose()?;

    Ok(PaymasterFields {
        paymaster,
        verification_gas_limit,
        post_op_gas_limit,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{FeeOptions, MiddlewareStack};
    use crate::test_utils::{deployed_account, MockBundler, MockReader};
    use crate::types::UserOperationOverrides;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PM_DATA: &str = "0xdeadbeef";
    const PM_ADDR: &str = "0x2222222222222222222222222222222222222222";

    fn expected_bytes() -> Bytes {
        Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])
    }

    #[test]
    fn parse_paymaster_and_data_shapes() {
        for res in [
            json!({ "paymasterAndData": PM_DATA }),
            json!({ "entrypointV06Response": { "paymasterAndData": PM_DATA } }),
            json!({ "entryPointV06Response": { "paymasterAndData": PM_DATA } }),
        ] {
            assert_eq!(parse_v06_paymaster_and_data(&res).unwrap(), expected_bytes());
        }
    }

    #[test]
    fn parse_paymaster_and_data_missing_fields() {
        let res = json!({ "entrypointV07Response": { "paymasterAndData": PM_DATA } });
        assert!(parse_v06_paymaster_and_data(&res).is_err());
    }

    #[test]
    fn parse_v07_fields() {
        let res = json!({
            "paymaster": PM_ADDR,
            "paymasterData": PM_DATA,
            "paymasterVerificationGasLimit": "0x1000",
            "paymasterPostOpGasLimit": "0x10",
        });
        let fields = parse_v07_paymaster_fields(&res).unwrap();
        assert_eq!(fields.paymaster, Address::repeat_byte(0x22));
        assert_eq!(fields.data, expected_bytes());
        assert_eq!(fields.verification_gas_limit, Some(U256::from(0x1000)));
        assert_eq!(fields.post_op_gas_limit, Some(U256::from(0x10)));
    }

    #[test]
    fn parse_v07_nested_without_limits() {
        let res = json!({ "entrypointV07Response": { "paymaster": PM_ADDR, "paymasterData": PM_DATA } });
        let fields = parse_v07_paymaster_fields(&res).unwrap();
        assert_eq!(fields.verification_gas_limit, None);
        assert_eq!(fields.data, expected_bytes());

        assert!(parse_v07_paymaster_fields(&json!({ "paymasterAndData": PM_DATA })).is_err());
    }

    #[test]
    fn params_carry_policy_context() {
        let op = UserOperationRequest::V060(Default::default());
        let params = build_params(
            &op,
            Address::repeat_byte(0xee),
            84532,
            &PaymasterPolicy {
                policy_id: "pol".into(),
                webhook_data: Some("hook".into()),
            },
        );
        assert_eq!(params[2], "0x14a34");
        assert_eq!(params[3], json!({ "policyId": "pol", "webhookData": "hook" }));
    }

    /// Stub data carries gas limits, final data does not.
    #[derive(Default)]
    struct FixedPaymaster {
        stub_calls: AtomicUsize,
        data_calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymasterRpc for FixedPaymaster {
        async fn get_paymaster_stub_data(
            &self,
            _op: &UserOperationRequest,
            _entry_point: Address,
            _chain_id: u64,
            _policy: &PaymasterPolicy,
        ) -> crate::Result<PaymasterResponse> {
            self.stub_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PaymasterResponse::V070(PaymasterFields {
                paymaster: Address::repeat_byte(0x22),
                verification_gas_limit: Some(U256::from(0x1000)),
                post_op_gas_limit: Some(U256::from(0x10)),
                data: Bytes::from(vec![0x01]),
            }))
        }

        async fn get_paymaster_data(
            &self,
            _op: &UserOperationRequest,
            _entry_point: Address,
            _chain_id: u64,
            _policy: &PaymasterPolicy,
        ) -> crate::Result<PaymasterResponse> {
            self.data_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PaymasterResponse::V070(PaymasterFields {
                paymaster: Address::repeat_byte(0x22),
                verification_gas_limit: None,
                post_op_gas_limit: None,
                data: expected_bytes(),
            }))
        }
    }

    fn sponsored_stack(
        reader: Arc<MockReader>,
        bundler: Arc<MockBundler>,
        pm: Arc<FixedPaymaster>,
    ) -> MiddlewareStack {
        let policy = PaymasterPolicy {
            policy_id: "pol".into(),
            webhook_data: None,
        };
        MiddlewareStack::new(reader, bundler)
            .with_dummy_paymaster_and_data(Erc7677Paymaster::stub(pm.clone(), policy.clone()))
            .with_paymaster_and_data(Erc7677Paymaster::data(pm, policy))
    }

    #[tokio::test]
    async fn final_data_keeps_limits_from_stub() {
        let reader = Arc::new(MockReader::new());
        let bundler = Arc::new(MockBundler::new());
        let pm = Arc::new(FixedPaymaster::default());
        let account = deployed_account(reader.clone(), EntryPointVersion::V070).await;
        let stack = sponsored_stack(reader, bundler.clone(), pm.clone());

        let overrides = UserOperationOverrides::default();
        let fee_options = FeeOptions::default();
        let ctx = MiddlewareContext {
            overrides: &overrides,
            fee_options: &fee_options,
            account: &account,
        };
        let uo = account.user_operation_struct(Bytes::new(), U256::zero());
        let UserOperationRequest::V070(op) = stack.run(uo, &ctx).await.unwrap() else {
            panic!("expected v0.7");
        };

        assert_eq!(op.paymaster, Some(Address::repeat_byte(0x22)));
        assert_eq!(op.paymaster_data, Some(expected_bytes()));
        assert_eq!(op.paymaster_verification_gas_limit, Some(U256::from(0x1000)));
        assert_eq!(op.paymaster_post_op_gas_limit, Some(U256::from(0x10)));
        assert_eq!(pm.stub_calls.load(Ordering::SeqCst), 1);
        assert_eq!(pm.data_calls.load(Ordering::SeqCst), 1);

        // gas was estimated against the stub data
        let estimated = bundler.estimated.lock().unwrap()[0].clone();
        let UserOperationRequest::V070(estimated) = &estimated else {
            panic!("expected v0.7");
        };
        assert_eq!(estimated.paymaster_data, Some(Bytes::from(vec![0x01])));
    }

    #[tokio::test]
    async fn paymaster_override_skips_the_service() {
        let reader = Arc::new(MockReader::new());
        let bundler = Arc::new(MockBundler::new());
        let pm = Arc::new(FixedPaymaster::default());
        let account = deployed_account(reader.clone(), EntryPointVersion::V070).await;
        let stack = sponsored_stack(reader, bundler, pm.clone());

        let fields = PaymasterFields {
            paymaster: Address::repeat_byte(0x33),
            verification_gas_limit: Some(U256::from(7)),
            post_op_gas_limit: Some(U256::from(8)),
            data: Bytes::from(vec![0x09]),
        };
        let overrides = UserOperationOverrides {
            paymaster_and_data: Some(Bytes::from(vec![0x44; 20])),
            paymaster_data: Some(fields.clone()),
            ..Default::default()
        };
        let fee_options = FeeOptions::default();
        let ctx = MiddlewareContext {
            overrides: &overrides,
            fee_options: &fee_options,
            account: &account,
        };
        let uo = account.user_operation_struct(Bytes::new(), U256::zero());
        let UserOperationRequest::V070(op) = stack.run(uo, &ctx).await.unwrap() else {
            panic!("expected v0.7");
        };

        assert_eq!(op.paymaster, Some(fields.paymaster));
        assert_eq!(op.paymaster_data, Some(fields.data));
        assert_eq!(op.paymaster_verification_gas_limit, Some(U256::from(7)));
        assert_eq!(op.paymaster_post_op_gas_limit, Some(U256::from(8)));
        assert_eq!(pm.stub_calls.load(Ordering::SeqCst), 0);
        assert_eq!(pm.data_calls.load(Ordering::SeqCst), 0);
    }
}
