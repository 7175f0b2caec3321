use crate::types::{UserOperationRequest, UserOperationV060, UserOperationV070};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// Bundler wire shape for either entry point version.
pub fn user_op_to_json(op: &UserOperationRequest) -> Value {
    match op {
        UserOperationRequest::V060(op) => v060_to_json(op),
        UserOperationRequest::V070(op) => v070_to_json(op),
    }
}

fn v060_to_json(op: &UserOperationV060) -> Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

/// Optional v0.7 fields are left out entirely when unset.
fn v070_to_json(op: &UserOperationV070) -> Value {
    let mut out = Map::new();
    let mut put = |key: &str, value: String| {
        out.insert(key.to_string(), Value::String(value));
    };

    put("sender", fmt_address(op.sender));
    put("nonce", fmt_u256(op.nonce));
    if let Some(factory) = op.factory {
        put("factory", fmt_address(factory));
        put(
            "factoryData",
            op.factory_data
                .as_ref()
                .map(fmt_bytes)
                .unwrap_or_else(|| "0x".to_string()),
        );
    }
    put("callData", fmt_bytes(&op.call_data));
    put("callGasLimit", fmt_u256(op.call_gas_limit));
    put("verificationGasLimit", fmt_u256(op.verification_gas_limit));
    put("preVerificationGas", fmt_u256(op.pre_verification_gas));
    put("maxFeePerGas", fmt_u256(op.max_fee_per_gas));
    put("maxPriorityFeePerGas", fmt_u256(op.max_priority_fee_per_gas));
    if let Some(paymaster) = op.paymaster {
        put("paymaster", fmt_address(paymaster));
        if let Some(limit) = op.paymaster_verification_gas_limit {
            put("paymasterVerificationGasLimit", fmt_u256(limit));
        }
        if let Some(limit) = op.paymaster_post_op_gas_limit {
            put("paymasterPostOpGasLimit", fmt_u256(limit));
        }
        put(
            "paymasterData",
            op.paymaster_data
                .as_ref()
                .map(fmt_bytes)
                .unwrap_or_else(|| "0x".to_string()),
        );
    }
    put("signature", fmt_bytes(&op.signature));

    Value::Object(out)
}

pub fn parse_u256_quantity(s: &str) -> anyhow::Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

pub fn parse_h256(s: &str) -> anyhow::Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

pub fn parse_bytes(s: &str) -> anyhow::Result<Bytes> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(Bytes::from(hex::decode(s)?))
}

pub fn parse_address(s: &str) -> anyhow::Result<Address> {
    s.parse::<Address>()
        .map_err(|e| anyhow::anyhow!("invalid address {s}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v060_never_carries_factory_fields() {
        let json = user_op_to_json(&UserOperationRequest::V060(UserOperationV060 {
            init_code: Bytes::from(vec![0xfa; 24]),
            ..Default::default()
        }));
        assert!(json.get("initCode").is_some());
        assert!(json.get("factory").is_none());
        assert!(json.get("paymaster").is_none());
        assert_eq!(json["nonce"], "0x0");
    }

    #[test]
    fn v070_never_carries_init_code() {
        let json = user_op_to_json(&UserOperationRequest::V070(UserOperationV070 {
            factory: Some(Address::repeat_byte(0xfa)),
            factory_data: Some(Bytes::from(vec![0x01])),
            call_gas_limit: U256::from(0x1234),
            ..Default::default()
        }));
        assert!(json.get("initCode").is_none());
        assert!(json.get("paymasterAndData").is_none());
        assert_eq!(json["factoryData"], "0x01");
        assert_eq!(json["callGasLimit"], "0x1234");
        assert!(json.get("paymaster").is_none());
    }

    #[test]
    fn v070_deployed_account_omits_factory() {
        let json = user_op_to_json(&UserOperationRequest::V070(UserOperationV070 {
            paymaster: Some(Address::repeat_byte(0x22)),
            paymaster_verification_gas_limit: Some(U256::from(1)),
            ..Default::default()
        }));
        assert!(json.get("factory").is_none());
        assert!(json.get("factoryData").is_none());
        assert_eq!(json["paymasterVerificationGasLimit"], "0x1");
        assert_eq!(json["paymasterData"], "0x");
        assert!(json.get("paymasterPostOpGasLimit").is_none());
    }

    #[test]
    fn quantities_parse_with_and_without_prefix() {
        assert_eq!(parse_u256_quantity("0x10").unwrap(), U256::from(16));
        assert_eq!(parse_u256_quantity("ff").unwrap(), U256::from(255));
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert!(parse_h256("0x1234").is_err());
    }
}
