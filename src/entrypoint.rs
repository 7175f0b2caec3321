use crate::error::{AccountError, Result};
use ethers::abi::{Abi, AbiParser};
use ethers::types::Address;
use std::{fmt, str::FromStr};

/// Canonical EntryPoint v0.6.0 deployment (same address on every supported chain).
const ENTRY_POINT_V060: [u8; 20] = [
    0x5f, 0xf1, 0x37, 0xd4, 0xb0, 0xfd, 0xcd, 0x49, 0xdc, 0xa3, 0x0c, 0x7c, 0xf5, 0x7e, 0x57, 0x8a,
    0x02, 0x6d, 0x27, 0x89,
];

/// Canonical EntryPoint v0.7.0 deployment.
const ENTRY_POINT_V070: [u8; 20] = [
    0x00, 0x00, 0x00, 0x00, 0x71, 0x72, 0x7d, 0xe2, 0x2e, 0x5e, 0x9d, 0x8b, 0xaf, 0x0e, 0xda, 0xc6,
    0xf3, 0x7d, 0xa0, 0x32,
];

/// Methods the core reads from the entry point. Identical selectors on both versions.
const ENTRY_POINT_ABI: &[&str] = &[
    "function getNonce(address sender, uint192 key) view returns (uint256 nonce)",
    "function getSenderAddress(bytes initCode)",
];

/// `error SenderAddressResult(address sender)`, raised by `getSenderAddress`.
pub const SENDER_ADDRESS_RESULT: &str = "SenderAddressResult(address)";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryPointVersion {
    V060,
    V070,
}

impl EntryPointVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V060 => "0.6.0",
            Self::V070 => "0.7.0",
        }
    }

    /// Field names of the user operation struct sent to the bundler.
    pub fn user_operation_fields(&self) -> &'static [&'static str] {
        match self {
            Self::V060 => &[
                "sender",
                "nonce",
                "initCode",
                "callData",
                "callGasLimit",
                "verificationGasLimit",
                "preVerificationGas",
                "maxFeePerGas",
                "maxPriorityFeePerGas",
                "paymasterAndData",
                "signature",
            ],
            Self::V070 => &[
                "sender",
                "nonce",
                "factory",
                "factoryData",
                "callData",
                "callGasLimit",
                "verificationGasLimit",
                "preVerificationGas",
                "maxFeePerGas",
                "maxPriorityFeePerGas",
                "paymaster",
                "paymasterVerificationGasLimit",
                "paymasterPostOpGasLimit",
                "paymasterData",
                "signature",
            ],
        }
    }

    fn canonical_address(&self) -> Address {
        match self {
            Self::V060 => Address::from(ENTRY_POINT_V060),
            Self::V070 => Address::from(ENTRY_POINT_V070),
        }
    }
}

impl fmt::Display for EntryPointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryPointVersion {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('v') {
            "0.6" | "0.6.0" => Ok(Self::V060),
            "0.7" | "0.7.0" => Ok(Self::V070),
            _ => Err(AccountError::UnsupportedVersion(s.to_string())),
        }
    }
}

/// An entry point deployment: version, address and the chain it lives on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPointDef {
    pub version: EntryPointVersion,
    pub address: Address,
    pub chain_id: u64,
}

impl EntryPointDef {
    pub fn new(version: EntryPointVersion, chain_id: u64) -> Self {
        Self {
            version,
            address: version.canonical_address(),
            chain_id,
        }
    }

    /// Entry point used when the caller does not pick one.
    pub fn default_for_chain(chain_id: u64) -> Self {
        Self::new(EntryPointVersion::V060, chain_id)
    }

    /// Points the definition at a non-canonical deployment (devnets, forks).
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    pub fn abi(&self) -> Result<Abi> {
        Ok(AbiParser::default().parse(ENTRY_POINT_ABI)?)
    }
}

/// Looks up the entry point for a version tag such as `"0.7.0"` or `"v0.6"`.
pub fn lookup(tag: &str, chain_id: u64) -> Result<EntryPointDef> {
    let version = tag.parse::<EntryPointVersion>()?;
    Ok(EntryPointDef::new(version, chain_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_versions() {
        let v6 = lookup("v0.6", 1).unwrap();
        assert_eq!(v6.version, EntryPointVersion::V060);
        assert_eq!(
            v6.address,
            "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
                .parse::<Address>()
                .unwrap()
        );

        let v7 = lookup("0.7.0", 8453).unwrap();
        assert_eq!(v7.version, EntryPointVersion::V070);
        assert_eq!(v7.chain_id, 8453);
        assert_eq!(
            v7.address,
            "0x0000000071727De22E5E9d8BAf0edAc6f37da032"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn lookup_rejects_unknown_versions() {
        for tag in ["0.5.0", "v0.8", "", "latest"] {
            assert_eq!(
                lookup(tag, 1).unwrap_err(),
                AccountError::UnsupportedVersion(tag.to_string())
            );
        }
    }

    #[test]
    fn struct_layout_follows_version() {
        let v6 = EntryPointVersion::V060.user_operation_fields();
        assert!(v6.contains(&"initCode"));
        assert!(!v6.contains(&"factory"));

        let v7 = EntryPointVersion::V070.user_operation_fields();
        assert!(v7.contains(&"factory") && v7.contains(&"factoryData"));
        assert!(!v7.contains(&"initCode"));
    }

    #[test]
    fn abi_exposes_core_methods() {
        let abi = EntryPointDef::default_for_chain(1).abi().unwrap();
        assert!(abi.function("getNonce").is_ok());
        assert!(abi.function("getSenderAddress").is_ok());
    }
}
