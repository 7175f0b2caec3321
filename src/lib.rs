//! ERC-4337 smart contract accounts and the user operation pipeline.
//!
//! The usual flow: build a [`SmartContractAccount`] (for example with
//! [`account::simple::create_simple_smart_account`]), bind it to a
//! [`SmartAccountClient`] together with a bundler and a [`MiddlewareStack`],
//! then send [`AccountOp`]s as user operations.

pub mod account;
pub mod bundler;
pub mod client;
pub mod config;
pub mod deferred;
pub mod deployment;
pub mod encoding;
pub mod entrypoint;
pub mod erc6492;
pub mod error;
pub mod middleware;
pub mod paymaster;
pub mod plugin;
pub mod provider;
pub mod signer;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use account::{to_smart_contract_account, AccountImpl, SmartContractAccount, ToSmartContractAccountParams};
pub use bundler::{BundlerClient, BundlerRpc};
pub use client::{RetryOptions, SendUserOperationParameters, SmartAccountClient};
pub use entrypoint::{EntryPointDef, EntryPointVersion};
pub use error::{AccountError, Result};
pub use middleware::{FeeOptions, MiddlewareContext, MiddlewareStack, UserOperationMiddleware};
pub use provider::{ChainReader, RpcReader};
pub use types::{AccountOp, UserOperationCallData, UserOperationOverrides, UserOperationRequest};
