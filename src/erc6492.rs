//! ERC-6492 signatures for accounts that are not deployed yet.
//!
//! A wrapped signature is `abi.encode(factory, factoryCalldata, signature)`
//! followed by the 32-byte magic suffix. Verifiers that see the suffix deploy
//! the account through the factory before checking the inner signature.

use crate::error::{AccountError, Result};
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes};

pub const ERC6492_MAGIC: [u8; 32] = [
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Erc6492Signature {
    pub factory: Address,
    pub factory_calldata: Bytes,
    pub signature: Bytes,
}

pub fn wrap_signature_with_6492(
    factory: Address,
    factory_calldata: &[u8],
    signature: &[u8],
) -> Bytes {
    let mut out = encode(&[
        Token::Address(factory),
        Token::Bytes(factory_calldata.to_vec()),
        Token::Bytes(signature.to_vec()),
    ]);
    out.extend_from_slice(&ERC6492_MAGIC);
    Bytes::from(out)
}

/// Returns `signature` untouched for a deployed account, the wrapped form otherwise.
pub fn wrap(
    is_deployed: bool,
    signature: Bytes,
    factory: Address,
    factory_calldata: &[u8],
) -> Bytes {
    if is_deployed {
        signature
    } else {
        wrap_signature_with_6492(factory, factory_calldata, &signature)
    }
}

pub fn is_wrapped(signature: &[u8]) -> bool {
    signature.len() > ERC6492_MAGIC.len() && signature.ends_with(&ERC6492_MAGIC)
}

/// Splits a wrapped signature; `None` when the magic suffix is absent.
pub fn parse(signature: &[u8]) -> Result<Option<Erc6492Signature>> {
    if !is_wrapped(signature) {
        return Ok(None);
    }
    let body = &signature[..signature.len() - ERC6492_MAGIC.len()];
    let mut tokens = decode(
        &[ParamType::Address, ParamType::Bytes, ParamType::Bytes],
        body,
    )
    .map_err(|e| AccountError::Decode(format!("malformed ERC-6492 signature: {e}")))?
    .into_iter();

    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(Token::Address(factory)), Some(Token::Bytes(calldata)), Some(Token::Bytes(sig))) => {
            Ok(Some(Erc6492Signature {
                factory,
                factory_calldata: calldata.into(),
                signature: sig.into(),
            }))
        }
        _ => Err(AccountError::Decode(
            "malformed ERC-6492 signature".to_string(),
        )),
    }
}
