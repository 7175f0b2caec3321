use aa_userop::account::simple::create_simple_smart_account;
use aa_userop::bundler::{BundlerClient, BundlerRpc};
use aa_userop::config::{load_config, ClientConfig};
use aa_userop::encoding::{self, parse_bytes};
use aa_userop::middleware::MiddlewareStack;
use aa_userop::paymaster::{Erc7677Paymaster, PaymasterClient, PaymasterRpc};
use aa_userop::provider::{ChainReader, RpcReader};
use aa_userop::{AccountOp, SendUserOperationParameters, SmartAccountClient, SmartContractAccount};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

// In --json mode stdout carries a single JSON object; human-readable lines go to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "aa-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(AccountArgs),

    /// Estimate gas for a call executed by the smart account.
    Estimate(CallArgs),

    /// Build, sign and send a user operation executing one call.
    Send(SendArgs),

    /// Check whether the configured paymaster sponsors a call.
    Sponsored(CallArgs),

    /// List the entry points the bundler supports.
    Entrypoints(EntrypointsArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Client config (chain, RPC, bundler, entry point, factory, paymaster).
    #[arg(long, default_value = "config/base-sepolia.json")]
    config: PathBuf,

    /// Override the chain RPC URL (otherwise uses the config JSON).
    #[arg(long, env = "AA_USEROP_RPC_URL")]
    rpc: Option<String>,

    /// Print a single JSON object to stdout; all other output goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Smart account owner private key.
    #[arg(long, env = "AA_USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CallArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Call target.
    #[arg(long)]
    to: String,

    /// Value in wei (decimal).
    #[arg(long, default_value = "0")]
    value: String,

    /// Call data (hex).
    #[arg(long, default_value = "0x")]
    data: String,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    call: CallArgs,

    /// Sponsor gas through the ERC-7677 paymaster from the config.
    #[arg(long, default_value_t = false)]
    sponsor_gas: bool,

    /// Build and sign, but do not send.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Do not wait for the bundle transaction.
    #[arg(long, default_value_t = false)]
    no_wait: bool,
}

#[derive(Args, Debug)]
struct EntrypointsArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

impl CallArgs {
    fn to_params(&self) -> Result<SendUserOperationParameters> {
        let target = Address::from_str(&self.to).context("invalid --to address")?;
        let value = U256::from_dec_str(&self.value).context("invalid --value")?;
        let data = parse_bytes(&self.data).context("invalid --data hex")?;
        Ok(SendUserOperationParameters::new(
            AccountOp::new(target, data).with_value(value),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Estimate(args) => cmd_estimate(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Sponsored(args) => cmd_sponsored(args).await,
        Command::Entrypoints(args) => cmd_entrypoints(args).await,
    }
}

struct Session {
    cfg: ClientConfig,
    owner: Address,
    account: SmartContractAccount,
    client: SmartAccountClient,
}

async fn connect(args: &ConfigArgs) -> Result<(ClientConfig, RpcReader<Provider<Http>>)> {
    let cfg = load_config(&args.config, args.rpc.clone())?;
    let reader = RpcReader::from_url(&cfg.rpc_url).context("invalid RPC url")?;

    let chain_id = reader.client().get_chainid().await?.as_u64();
    if chain_id != cfg.chain_id {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            cfg.chain_id,
            chain_id
        ));
    }
    Ok((cfg, reader))
}

async fn open_session(common: &CommonArgs, sponsor_gas: bool) -> Result<Session> {
    let (cfg, reader) = connect(&common.config).await?;

    let wallet = LocalWallet::from_str(&common.owner_private_key)
        .context("invalid owner private key")?
        .with_chain_id(cfg.chain_id);
    let owner = wallet.address();

    let reader: Arc<dyn ChainReader> = Arc::new(reader);
    let account = create_simple_smart_account(
        wallet,
        cfg.factory,
        U256::from(common.salt),
        cfg.entry_point.clone(),
        reader.clone(),
        None,
    )
    .await
    .context("failed to derive smart account")?;

    let bundler: Arc<dyn BundlerRpc> = Arc::new(BundlerClient::new(cfg.bundler_url.clone()));
    let mut stack = MiddlewareStack::new(reader, bundler.clone());
    if sponsor_gas {
        let pm = cfg
            .paymaster
            .clone()
            .ok_or_else(|| anyhow!("gas sponsorship requires a `paymaster` section in the config"))?;
        let pm_client: Arc<dyn PaymasterRpc> = Arc::new(PaymasterClient::new(pm.url));
        stack = stack
            .with_dummy_paymaster_and_data(Erc7677Paymaster::stub(pm_client.clone(), pm.policy.clone()))
            .with_paymaster_and_data(Erc7677Paymaster::data(pm_client, pm.policy));
    }

    let client = SmartAccountClient::new(bundler, stack)
        .with_account(account.clone())
        .with_fee_options((&cfg.opts).into())
        .with_retry_options((&cfg.opts).into());

    Ok(Session {
        cfg,
        owner,
        account,
        client,
    })
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let machine_mode = args.common.config.json;
    let s = open_session(&args.common, false).await?;
    let deployed = s.account.is_account_deployed().await?;

    if machine_mode {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(s.owner),
            "smartAccount": encoding::fmt_address(s.account.address()),
            "isDeployed": deployed,
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", s.cfg.chain_id);
    outln!(machine_mode, "entryPoint:     {} (v{})", s.account.entry_point().address, s.account.entry_point().version);
    outln!(machine_mode, "factory:        {}", s.account.get_factory_address());
    outln!(machine_mode, "owner:          {}", s.owner);
    outln!(machine_mode, "smartAccount:   {}", s.account.address());
    outln!(machine_mode, "isDeployed:     {}", deployed);

    Ok(())
}

async fn cmd_estimate(args: CallArgs) -> Result<()> {
    let machine_mode = args.common.config.json;
    let s = open_session(&args.common, false).await?;
    let est = s
        .client
        .estimate_user_operation_gas(&args.to_params()?)
        .await
        .context("bundler gas estimate failed")?;

    if machine_mode {
        let mut out = serde_json::json!({
            "callGasLimit": encoding::fmt_u256(est.call_gas_limit),
            "verificationGasLimit": encoding::fmt_u256(est.verification_gas_limit),
            "preVerificationGas": encoding::fmt_u256(est.pre_verification_gas),
        });
        if let (Some(limit), Some(obj)) = (est.paymaster_verification_gas_limit, out.as_object_mut()) {
            obj.insert(
                "paymasterVerificationGasLimit".to_string(),
                encoding::fmt_u256(limit).into(),
            );
        }
        println!("{}", out);
    }

    outln!(machine_mode, "callGasLimit:          {}", est.call_gas_limit);
    outln!(machine_mode, "verificationGasLimit:  {}", est.verification_gas_limit);
    outln!(machine_mode, "preVerificationGas:    {}", est.pre_verification_gas);
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let machine_mode = args.call.common.config.json;
    let s = open_session(&args.call.common, args.sponsor_gas).await?;
    let params = args.call.to_params()?;

    if args.dry_run {
        let request = s.client.build_user_operation(&params).await?;
        let request = s.client.sign_user_operation(request, None).await?;
        outln!(
            machine_mode,
            "\nUserOperation (final):\n{}",
            serde_json::to_string_pretty(&encoding::user_op_to_json(&request))?
        );
        outln!(machine_mode, "\n--dry-run set: not sending user operation.");
        if machine_mode {
            println!("{}", encoding::user_op_to_json(&request));
        }
        return Ok(());
    }

    let sent = s
        .client
        .send_user_operation(&params)
        .await
        .context("bundler send failed")?;
    outln!(
        machine_mode,
        "\nUserOperation (final):\n{}",
        serde_json::to_string_pretty(&encoding::user_op_to_json(&sent.request))?
    );
    outln!(machine_mode, "\nuserOpHash: {}", encoding::fmt_h256(sent.hash));

    let tx_hash = if args.no_wait {
        outln!(machine_mode, "--no-wait set: not waiting for receipt.");
        None
    } else {
        let tx_hash = s
            .client
            .wait_for_user_operation_transaction(sent.hash)
            .await
            .context("failed waiting for userOp receipt")?;
        outln!(machine_mode, "txHash:     {}", encoding::fmt_h256(tx_hash));
        Some(tx_hash)
    };

    if machine_mode {
        let out = serde_json::json!({
            "userOpHash": encoding::fmt_h256(sent.hash),
            "txHash": tx_hash.map(encoding::fmt_h256),
        });
        println!("{}", out);
    }
    Ok(())
}

async fn cmd_sponsored(args: CallArgs) -> Result<()> {
    let machine_mode = args.common.config.json;
    let s = open_session(&args.common, true).await?;
    let eligible = s
        .client
        .check_gas_sponsorship_eligibility(&args.to_params()?)
        .await?;

    if machine_mode {
        println!("{}", serde_json::json!({ "eligible": eligible }));
    }
    outln!(machine_mode, "sponsorship eligible: {}", eligible);
    Ok(())
}

async fn cmd_entrypoints(args: EntrypointsArgs) -> Result<()> {
    let machine_mode = args.config.json;
    let (cfg, _reader) = connect(&args.config).await?;
    let bundler = BundlerClient::new(cfg.bundler_url.clone());
    let supported = bundler.supported_entry_points().await?;
    let configured = supported.contains(&cfg.entry_point.address);

    if machine_mode {
        let out = serde_json::json!({
            "entryPoints": supported.iter().copied().map(encoding::fmt_address).collect::<Vec<_>>(),
            "configuredSupported": configured,
        });
        println!("{}", out);
    }

    for ep in &supported {
        outln!(machine_mode, "{}", ep);
    }
    if !configured {
        tracing::warn!(
            entry_point = ?cfg.entry_point.address,
            version = %cfg.entry_point.version,
            "configured entry point is not supported by the bundler"
        );
    }
    Ok(())
}
