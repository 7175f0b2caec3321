//! ERC-6900 plugin installation payloads.

use crate::error::{AccountError, Result};
use crate::provider::ChainReader;
use ethers::abi::{AbiParser, Token};
use ethers::types::{Address, Bytes, H256};
use ethers::utils::{id, keccak256};

const INSTALL_PLUGIN_ABI: &[&str] = &[
    "function installPlugin(address plugin, bytes32 manifestHash, bytes pluginInstallData, bytes21[] dependencies)",
];

/// `plugin address (20 bytes) || function id (1 byte)`.
pub type FunctionReference = [u8; 21];

pub fn function_reference(plugin: Address, function_id: u8) -> FunctionReference {
    let mut out = [0u8; 21];
    out[..20].copy_from_slice(plugin.as_bytes());
    out[20] = function_id;
    out
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallPluginParams {
    pub plugin_address: Address,
    /// Read from the plugin's `pluginManifest()` when absent.
    pub manifest_hash: Option<H256>,
    pub plugin_init_data: Bytes,
    pub dependencies: Vec<FunctionReference>,
}

/// keccak256 of the ABI-encoded `pluginManifest()` return value.
pub async fn fetch_manifest_hash(reader: &dyn ChainReader, plugin: Address) -> Result<H256> {
    let manifest = reader
        .call(plugin, Bytes::from(id("pluginManifest()").to_vec()))
        .await?;
    if manifest.is_empty() {
        return Err(AccountError::Decode(format!(
            "plugin {plugin:?} returned an empty manifest"
        )));
    }
    Ok(H256::from(keccak256(&manifest)))
}

/// Account call data for `installPlugin`.
pub async fn encode_install_plugin(
    reader: &dyn ChainReader,
    params: &InstallPluginParams,
) -> Result<Bytes> {
    let manifest_hash = match params.manifest_hash {
        Some(hash) => hash,
        None => fetch_manifest_hash(reader, params.plugin_address).await?,
    };

    let abi = AbiParser::default().parse(INSTALL_PLUGIN_ABI)?;
    let data = abi.function("installPlugin")?.encode_input(&[
        Token::Address(params.plugin_address),
        Token::FixedBytes(manifest_hash.as_bytes().to_vec()),
        Token::Bytes(params.plugin_init_data.to_vec()),
        Token::Array(
            params
                .dependencies
                .iter()
                .map(|dep| Token::FixedBytes(dep.to_vec()))
                .collect(),
        ),
    ])?;
    Ok(data.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockReader;
    use ethers::abi::{decode, ParamType};
    use std::sync::atomic::Ordering;

    fn params() -> InstallPluginParams {
        InstallPluginParams {
            plugin_address: Address::repeat_byte(0x9a),
            manifest_hash: None,
            plugin_init_data: Bytes::from(vec![0x01]),
            dependencies: vec![function_reference(Address::repeat_byte(0x9b), 3)],
        }
    }

    #[tokio::test]
    async fn manifest_hash_is_read_when_missing() {
        let manifest = Bytes::from(vec![0x00, 0x20, 0x42]);
        let reader = MockReader::new().with_plugin_manifest(manifest.clone());

        let data = encode_install_plugin(&reader, &params()).await.unwrap();
        assert_eq!(
            &data[..4],
            &id("installPlugin(address,bytes32,bytes,bytes21[])")
        );

        let tokens = decode(
            &[
                ParamType::Address,
                ParamType::FixedBytes(32),
                ParamType::Bytes,
                ParamType::Array(Box::new(ParamType::FixedBytes(21))),
            ],
            &data[4..],
        )
        .unwrap();
        assert_eq!(tokens[1], Token::FixedBytes(keccak256(&manifest).to_vec()));
        let Token::Array(deps) = &tokens[3] else {
            panic!("dependencies should be an array");
        };
        assert_eq!(deps[0], Token::FixedBytes(function_reference(Address::repeat_byte(0x9b), 3).to_vec()));
        assert_eq!(reader.call_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_manifest_hash_skips_the_read() {
        let reader = MockReader::new();
        let mut p = params();
        p.manifest_hash = Some(H256::repeat_byte(0x55));
        encode_install_plugin(&reader, &p).await.unwrap();
        assert_eq!(reader.call_calls.load(Ordering::SeqCst), 0);
    }
}
