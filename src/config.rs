use crate::entrypoint::{lookup, EntryPointDef};
use crate::paymaster::PaymasterPolicy;
use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub bundler: String,
    #[serde(default = "default_entry_point_version")]
    pub entry_point_version: String,
    #[serde(default)]
    pub entry_point_address: Option<String>,
    #[serde(default)]
    pub factory: Option<String>,
    #[serde(default)]
    pub paymaster: Option<PaymasterConfigRaw>,
    #[serde(default)]
    pub opts: ClientOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterConfigRaw {
    pub url: String,
    pub policy_id: String,
    #[serde(default)]
    pub webhook_data: Option<String>,
}

/// Fee and receipt-polling knobs; every field falls back to its default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    pub tx_max_retries: u32,
    pub tx_retry_interval_ms: u64,
    pub tx_retry_multiplier: f64,
    pub min_priority_fee_per_bid: u64,
    pub max_priority_fee_per_gas_estimate_buffer: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tx_max_retries: 5,
            tx_retry_interval_ms: 2_000,
            tx_retry_multiplier: 1.5,
            min_priority_fee_per_bid: 100_000_000,
            max_priority_fee_per_gas_estimate_buffer: 33,
        }
    }
}

fn default_entry_point_version() -> String {
    "0.6.0".to_string()
}

#[derive(Debug, Clone)]
pub struct PaymasterConfig {
    pub url: String,
    pub policy: PaymasterPolicy,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: EntryPointDef,
    /// `None` selects the default SimpleAccountFactory for the entry point.
    pub factory: Option<Address>,
    pub paymaster: Option<PaymasterConfig>,
    pub opts: ClientOptions,
}

pub fn load_config(path: &Path, rpc_override: Option<String>) -> Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config json at {}", path.display()))?;
    let raw: ClientConfigRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config json at {}", path.display()))?;
    resolve(raw, rpc_override)
}

fn resolve(raw: ClientConfigRaw, rpc_override: Option<String>) -> Result<ClientConfig> {
    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let mut entry_point = lookup(&raw.entry_point_version, raw.chain_id)
        .with_context(|| format!("invalid entryPointVersion {}", raw.entry_point_version))?;
    if let Some(addr) = raw.entry_point_address.as_deref() {
        entry_point = entry_point.with_address(parse_addr(addr).context("invalid entryPointAddress")?);
    }

    let factory = raw
        .factory
        .as_deref()
        .map(|f| parse_addr(f).context("invalid factory address"))
        .transpose()?;

    let paymaster = raw.paymaster.map(|pm| PaymasterConfig {
        url: pm.url,
        policy: PaymasterPolicy {
            policy_id: pm.policy_id,
            webhook_data: pm.webhook_data,
        },
    });

    Ok(ClientConfig {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url: raw.bundler,
        entry_point,
        factory,
        paymaster,
        opts: raw.opts,
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
