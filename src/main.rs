mod bundler;
mod chain;
mod config;
mod encoding;
mod error;
mod jsonrpc;
mod paymaster;
mod pipeline;
mod server;
mod types;

use anyhow::{anyhow, Context, Result};
use bundler::HttpBundlerClient;
use chain::HttpChainClient;
use clap::Parser;
use config::RelayConfig;
use ethers::providers::{Http, Middleware, Provider};
use jsonrpsee::server::ServerBuilder;
use paymaster::HttpPaymasterClient;
use pipeline::{GaslessPipeline, PipelineSettings, RelayClients};
use server::{RelayApiServer, RelayServer};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(
    name = "gasless-relay",
    version,
    about = "Type-0 gasless transaction relay: sponsors and submits ERC-4337 UserOperations"
)]
struct Args {
    /// Listen address for the JSON-RPC server (HTTP + WebSocket).
    #[arg(long, env = "GASLESS_RELAY_LISTEN", default_value = "127.0.0.1:3000")]
    listen: String,

    /// Chain JSON-RPC endpoint (nonce reads and the EntryPoint hash call).
    #[arg(long, env = "GASLESS_RELAY_RPC_URL", default_value = config::DEFAULT_RPC_URL)]
    rpc_url: String,

    /// ERC-4337 bundler endpoint.
    #[arg(long, env = "GASLESS_RELAY_BUNDLER_URL", default_value = config::DEFAULT_BUNDLER_URL)]
    bundler_url: String,

    /// Paymaster web service endpoint.
    #[arg(long, env = "GASLESS_RELAY_PAYMASTER_URL", default_value = config::DEFAULT_PAYMASTER_URL)]
    paymaster_url: String,

    /// EntryPoint v0.6 contract address.
    #[arg(long, env = "GASLESS_RELAY_ENTRY_POINT", default_value = config::DEFAULT_ENTRY_POINT)]
    entry_point: String,

    /// Refuse to start when the RPC reports a different chain id.
    #[arg(long, env = "GASLESS_RELAY_CHAIN_ID")]
    chain_id: Option<u64>,

    /// Paymaster api key. Recommended: set via env var PAYMASTER_API_KEY.
    #[arg(long, env = "PAYMASTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Receipt poll interval in milliseconds.
    #[arg(long, env = "GASLESS_RELAY_RECEIPT_POLL_MS", default_value_t = 1500)]
    receipt_poll_ms: u64,

    /// Receipt wait budget in seconds; 0 waits indefinitely.
    #[arg(long, env = "GASLESS_RELAY_RECEIPT_WAIT_SECS", default_value_t = 180)]
    receipt_wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig::from_cli(
        args.listen,
        args.rpc_url,
        args.bundler_url,
        args.paymaster_url,
        args.entry_point,
        args.chain_id,
        args.api_key,
        args.receipt_poll_ms,
        args.receipt_wait_secs,
    )?;

    let provider = Arc::new(
        Provider::<Http>::try_from(config.rpc_url.as_str())
            .with_context(|| format!("invalid chain rpc url '{}'", config.rpc_url))?,
    );

    let chain_id = provider
        .get_chainid()
        .await
        .context("failed to read the chain id from the rpc endpoint")?
        .as_u64();
    if let Some(expected) = config.expected_chain_id {
        if chain_id != expected {
            return Err(anyhow!(
                "chainId mismatch: expected {expected}, RPC returned {chain_id}"
            ));
        }
    }

    let clients = RelayClients {
        chain: Arc::new(HttpChainClient::new(provider.clone())),
        bundler: Arc::new(HttpBundlerClient::new(
            config.bundler_url.clone(),
            provider.clone(),
            config.entry_point,
        )),
        paymaster: Arc::new(HttpPaymasterClient::new(
            config.paymaster_url.clone(),
            config.entry_point,
        )),
    };
    let (events, _) = broadcast::channel(64);
    let pipeline = Arc::new(GaslessPipeline::new(
        clients,
        PipelineSettings {
            entry_point: config.entry_point,
            chain_id,
            api_key: config.api_key.clone(),
            receipt_poll_interval: config.receipt_poll_interval,
            receipt_wait_budget: config.receipt_wait_budget,
        },
        events,
    ));

    tracing::info!(
        listen = %config.listen,
        chain_id,
        entry_point = %config.entry_point,
        bundler = %config.bundler_url,
        paymaster = %config.paymaster_url,
        "starting gasless relay"
    );

    let rpc_server = ServerBuilder::default()
        .build(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let handle = rpc_server.start(RelayServer::new(pipeline).into_rpc());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    handle.stop()?;
    handle.stopped().await;

    Ok(())
}
