//! The user operation pipeline.
//!
//! A fresh struct from [`SmartContractAccount::user_operation_struct`] goes
//! through six stages, always in this order:
//!
//! 1. dummy paymaster data (so gas estimation sees a realistically sized op)
//! 2. fee estimation
//! 3. gas estimation
//! 4. custom
//! 5. real paymaster data (signed against the final gas numbers)
//! 6. simulation
//!
//! and a final resolution pass turns it into a [`UserOperationRequest`].

use crate::account::SmartContractAccount;
use crate::bundler::BundlerRpc;
use crate::error::Result;
use crate::provider::ChainReader;
use crate::types::{UserOperationOverrides, UserOperationRequest, UserOperationStruct};
use async_trait::async_trait;
use ethers::types::{Bytes, U256};
use std::sync::Arc;
use tracing::debug;

/// Fee tuning for the default fee estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeOptions {
    /// Floor for `maxPriorityFeePerGas`, in wei.
    pub min_priority_fee_per_bid: U256,
    /// Percent added on top of the node's priority fee estimate.
    pub max_priority_fee_per_gas_estimate_buffer: u64,
}

impl Default for FeeOptions {
    fn default() -> Self {
        Self {
            min_priority_fee_per_bid: U256::from(100_000_000u64),
            max_priority_fee_per_gas_estimate_buffer: 33,
        }
    }
}

impl FeeOptions {
    pub fn priority_fee(&self, estimate: U256) -> U256 {
        let percent = U256::from(100u64) + U256::from(self.max_priority_fee_per_gas_estimate_buffer);
        let buffered = estimate.saturating_mul(percent) / U256::from(100u64);
        buffered.max(self.min_priority_fee_per_bid)
    }
}

/// Read-only inputs shared by every stage of one build.
pub struct MiddlewareContext<'a> {
    pub overrides: &'a UserOperationOverrides,
    pub fee_options: &'a FeeOptions,
    pub account: &'a SmartContractAccount,
}

#[async_trait]
pub trait UserOperationMiddleware: Send + Sync {
    async fn apply(
        &self,
        uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct>;
}

/// Passes the struct through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl UserOperationMiddleware for Noop {
    async fn apply(
        &self,
        uo: UserOperationStruct,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        Ok(uo)
    }
}

/// Empty paymaster fields, or the caller's override.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyPaymasterAndData;

#[async_trait]
impl UserOperationMiddleware for DummyPaymasterAndData {
    async fn apply(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        if !ctx.overrides.apply_paymaster(&mut uo) {
            uo.set_paymaster_and_data(Bytes::new());
        }
        Ok(uo)
    }
}

/// Applies the caller's paymaster override, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymasterAndDataOverride;

#[async_trait]
impl UserOperationMiddleware for PaymasterAndDataOverride {
    async fn apply(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        ctx.overrides.apply_paymaster(&mut uo);
        Ok(uo)
    }
}

/// Prices the operation from the latest base fee and the node's priority fee.
pub struct DefaultFeeEstimator {
    reader: Arc<dyn ChainReader>,
}

impl DefaultFeeEstimator {
    pub fn new(reader: Arc<dyn ChainReader>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl UserOperationMiddleware for DefaultFeeEstimator {
    async fn apply(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let overrides = ctx.overrides;
        let (max_fee_per_gas, max_priority_fee_per_gas) =
            match (overrides.max_fee_per_gas, overrides.max_priority_fee_per_gas) {
                (Some(max_fee), Some(priority)) => (max_fee, priority),
                (max_fee, priority) => {
                    let fees = self.reader.fee_data().await?;
                    let priority = priority
                        .unwrap_or_else(|| ctx.fee_options.priority_fee(fees.max_priority_fee_per_gas));
                    let max_fee = max_fee.unwrap_or(fees.base_fee_per_gas + priority);
                    (max_fee, priority)
                }
            };

        debug!(%max_fee_per_gas, %max_priority_fee_per_gas, "fees estimated");
        uo.set_fees(max_fee_per_gas, max_priority_fee_per_gas);
        Ok(uo)
    }
}

/// Asks the bundler for gas limits; skipped when every limit is overridden.
pub struct DefaultGasEstimator {
    bundler: Arc<dyn BundlerRpc>,
}

impl DefaultGasEstimator {
    pub fn new(bundler: Arc<dyn BundlerRpc>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl UserOperationMiddleware for DefaultGasEstimator {
    async fn apply(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let overrides = ctx.overrides;
        if let (Some(call), Some(verification), Some(pre_verification)) = (
            overrides.call_gas_limit,
            overrides.verification_gas_limit,
            overrides.pre_verification_gas,
        ) {
            uo.set_gas_limits(call, verification, pre_verification);
            return Ok(uo);
        }

        let request = uo.resolve_all().await?;
        let estimates = self
            .bundler
            .estimate_user_operation_gas(
                &request,
                ctx.account.entry_point().address,
                overrides.state_override.as_ref(),
            )
            .await?;
        debug!(
            call_gas_limit = %estimates.call_gas_limit,
            verification_gas_limit = %estimates.verification_gas_limit,
            pre_verification_gas = %estimates.pre_verification_gas,
            "gas estimated"
        );

        uo.set_gas_limits(
            overrides.call_gas_limit.unwrap_or(estimates.call_gas_limit),
            overrides
                .verification_gas_limit
                .unwrap_or(estimates.verification_gas_limit),
            overrides
                .pre_verification_gas
                .unwrap_or(estimates.pre_verification_gas),
        );
        if let (Some(limit), UserOperationRequest::V070(op)) =
            (estimates.paymaster_verification_gas_limit, &request)
        {
            if op.paymaster.is_some() {
                uo.set_paymaster_verification_gas_limit(limit);
            }
        }
        Ok(uo)
    }
}

/// The six pipeline stages. Each slot can be replaced; the order cannot.
#[derive(Clone)]
pub struct MiddlewareStack {
    pub dummy_paymaster_and_data: Arc<dyn UserOperationMiddleware>,
    pub fee_estimator: Arc<dyn UserOperationMiddleware>,
    pub gas_estimator: Arc<dyn UserOperationMiddleware>,
    pub custom: Arc<dyn UserOperationMiddleware>,
    pub paymaster_and_data: Arc<dyn UserOperationMiddleware>,
    pub user_operation_simulator: Arc<dyn UserOperationMiddleware>,
}

impl MiddlewareStack {
    /// Default stages backed by `reader` for fees and `bundler` for gas.
    pub fn new(reader: Arc<dyn ChainReader>, bundler: Arc<dyn BundlerRpc>) -> Self {
        Self {
            dummy_paymaster_and_data: Arc::new(DummyPaymasterAndData),
            fee_estimator: Arc::new(DefaultFeeEstimator::new(reader)),
            gas_estimator: Arc::new(DefaultGasEstimator::new(bundler)),
            custom: Arc::new(Noop),
            paymaster_and_data: Arc::new(PaymasterAndDataOverride),
            user_operation_simulator: Arc::new(Noop),
        }
    }

    pub fn with_dummy_paymaster_and_data(mut self, stage: Arc<dyn UserOperationMiddleware>) -> Self {
        self.dummy_paymaster_and_data = stage;
        self
    }

    pub fn with_fee_estimator(mut self, stage: Arc<dyn UserOperationMiddleware>) -> Self {
        self.fee_estimator = stage;
        self
    }

    pub fn with_gas_estimator(mut self, stage: Arc<dyn UserOperationMiddleware>) -> Self {
        self.gas_estimator = stage;
        self
    }

    pub fn with_custom(mut self, stage: Arc<dyn UserOperationMiddleware>) -> Self {
        self.custom = stage;
        self
    }

    pub fn with_paymaster_and_data(mut self, stage: Arc<dyn UserOperationMiddleware>) -> Self {
        self.paymaster_and_data = stage;
        self
    }

    pub fn with_user_operation_simulator(mut self, stage: Arc<dyn UserOperationMiddleware>) -> Self {
        self.user_operation_simulator = stage;
        self
    }

    fn stages(&self) -> [(&'static str, &Arc<dyn UserOperationMiddleware>); 6] {
        [
            ("dummy_paymaster_and_data", &self.dummy_paymaster_and_data),
            ("fee_estimator", &self.fee_estimator),
            ("gas_estimator", &self.gas_estimator),
            ("custom", &self.custom),
            ("paymaster_and_data", &self.paymaster_and_data),
            ("user_operation_simulator", &self.user_operation_simulator),
        ]
    }

    /// Runs every stage in order, then resolves whatever is still pending.
    pub async fn run(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationRequest> {
        for (name, stage) in self.stages() {
            debug!(stage = name, "running middleware");
            uo = stage.apply(uo, ctx).await?;
        }
        uo.resolve_properties().await
    }
}

/// Replaces the paymaster fields with a fixed blob. Handy for tests and for
/// paymasters that hand out static data.
#[derive(Debug, Clone, Default)]
pub struct StaticPaymasterAndData(pub Bytes);

#[async_trait]
impl UserOperationMiddleware for StaticPaymasterAndData {
    async fn apply(
        &self,
        mut uo: UserOperationStruct,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        uo.set_paymaster_and_data(self.0.clone());
        Ok(uo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrypoint::EntryPointVersion;
    use crate::provider::FeeData;
    use crate::test_utils::{deployed_account, MockBundler, MockReader};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Records its name and the paymaster data size it sees.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, usize)>>>,
    }

    #[async_trait]
    impl UserOperationMiddleware for Recorder {
        async fn apply(
            &self,
            mut uo: UserOperationStruct,
            _ctx: &MiddlewareContext<'_>,
        ) -> Result<UserOperationStruct> {
            let seen = match uo.resolve_all().await? {
                UserOperationRequest::V060(op) => op.paymaster_and_data.len(),
                UserOperationRequest::V070(op) => op.paymaster_and_data().len(),
            };
            self.log.lock().unwrap().push((self.name, seen));
            Ok(uo)
        }
    }

    fn recording_stack(
        reader: Arc<MockReader>,
        bundler: Arc<MockBundler>,
        log: &Arc<Mutex<Vec<(&'static str, usize)>>>,
    ) -> MiddlewareStack {
        let rec = |name| -> Arc<dyn UserOperationMiddleware> {
            Arc::new(Recorder {
                name,
                log: log.clone(),
            })
        };
        MiddlewareStack::new(reader, bundler)
            .with_dummy_paymaster_and_data(Arc::new(StaticPaymasterAndData(Bytes::from(
                vec![0x77; 100],
            ))))
            .with_fee_estimator(rec("fee"))
            .with_gas_estimator(rec("gas"))
            .with_custom(rec("custom"))
            .with_paymaster_and_data(rec("paymaster"))
            .with_user_operation_simulator(rec("simulator"))
    }

    #[tokio::test]
    async fn stages_run_in_fixed_order() {
        let reader = Arc::new(MockReader::new());
        let bundler = Arc::new(MockBundler::new());
        let account = deployed_account(reader.clone(), EntryPointVersion::V060).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = recording_stack(reader, bundler, &log);

        let overrides = UserOperationOverrides::default();
        let fee_options = FeeOptions::default();
        let ctx = MiddlewareContext {
            overrides: &overrides,
            fee_options: &fee_options,
            account: &account,
        };
        let uo = account.user_operation_struct(Bytes::from(vec![0x01]), U256::zero());
        let request = stack.run(uo, &ctx).await.unwrap();

        // Every stage after the dummy fill already sees the 100-byte stub.
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("fee", 100),
                ("gas", 100),
                ("custom", 100),
                ("paymaster", 100),
                ("simulator", 100),
            ]
        );
        assert!(request.has_paymaster_data());
    }

    #[tokio::test]
    async fn default_stack_fills_fees_and_gas() {
        let reader = Arc::new(MockReader::new().with_fees(FeeData {
            base_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(300_000_000u64),
        }));
        let bundler = Arc::new(MockBundler::new());
        let account = deployed_account(reader.clone(), EntryPointVersion::V060).await;
        let stack = MiddlewareStack::new(reader, bundler.clone());

        let overrides = UserOperationOverrides {
            call_gas_limit: Some(U256::from(99)),
            ..Default::default()
        };
        let fee_options = FeeOptions::default();
        let ctx = MiddlewareContext {
            overrides: &overrides,
            fee_options: &fee_options,
            account: &account,
        };
        let uo = account.user_operation_struct(Bytes::from(vec![0x01]), U256::zero());
        let UserOperationRequest::V060(op) = stack.run(uo, &ctx).await.unwrap() else {
            panic!("expected v0.6");
        };

        // 0.3 gwei plus the 33% buffer
        assert_eq!(op.max_priority_fee_per_gas, U256::from(399_000_000u64));
        assert_eq!(op.max_fee_per_gas, U256::from(1_399_000_000u64));
        assert_eq!(op.call_gas_limit, U256::from(99));
        assert_eq!(op.verification_gas_limit, MockBundler::estimates().verification_gas_limit);
        assert!(op.paymaster_and_data.is_empty());
        assert_eq!(bundler.estimate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_gas_overrides_skip_the_bundler() {
        let reader = Arc::new(MockReader::new());
        let bundler = Arc::new(MockBundler::new());
        let account = deployed_account(reader.clone(), EntryPointVersion::V070).await;
        let stack = MiddlewareStack::new(reader.clone(), bundler.clone());

        let overrides = UserOperationOverrides {
            call_gas_limit: Some(U256::from(1)),
            verification_gas_limit: Some(U256::from(2)),
            pre_verification_gas: Some(U256::from(3)),
            max_fee_per_gas: Some(U256::from(4)),
            max_priority_fee_per_gas: Some(U256::from(5)),
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

        assert_eq!(op.pre_verification_gas, U256::from(3));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(5));
        assert_eq!(bundler.estimate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(reader.fee_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn priority_fee_respects_floor() {
        let opts = FeeOptions::default();
        assert_eq!(opts.priority_fee(U256::from(1)), U256::from(100_000_000u64));
        assert_eq!(opts.priority_fee(U256::from(1_000_000_000u64)), U256::from(1_330_000_000u64));
    }

    #[test]
    fn priority_fee_saturates_on_huge_inputs() {
        let opts = FeeOptions {
            max_priority_fee_per_gas_estimate_buffer: u64::MAX,
            ..FeeOptions::default()
        };
        assert_eq!(opts.priority_fee(U256::MAX / 2), U256::MAX / U256::from(100u64));
        assert_eq!(
            FeeOptions::default().priority_fee(U256::MAX / 2),
            U256::MAX / U256::from(100u64)
        );
    }
}
