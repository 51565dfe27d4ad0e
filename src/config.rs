use anyhow::{anyhow, bail, Context, Result};
use ethers::types::Address;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RPC_URL: &str = "https://rpc-testnet.nerochain.io";
pub const DEFAULT_BUNDLER_URL: &str = "https://bundler-testnet.nerochain.io/";
pub const DEFAULT_PAYMASTER_URL: &str = "https://paymaster-testnet.nerochain.io";
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub rpc_url: String,
    pub bundler_url: String,
    pub paymaster_url: String,
    pub entry_point: Address,

    /// Refuse to start when the RPC reports a different chain id.
    pub expected_chain_id: Option<u64>,

    pub api_key: Option<String>,

    pub receipt_poll_interval: Duration,

    /// Total time to wait for a receipt after submission. Zero disables the
    /// budget and waits indefinitely.
    pub receipt_wait_budget: Duration,
}

impl RelayConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli(
        listen: String,
        rpc_url: String,
        bundler_url: String,
        paymaster_url: String,
        entry_point: String,
        expected_chain_id: Option<u64>,
        api_key: Option<String>,
        receipt_poll_ms: u64,
        receipt_wait_secs: u64,
    ) -> Result<Self> {
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address '{listen}'"))?;
        let entry_point = Address::from_str(&entry_point)
            .map_err(|e| anyhow!("invalid EntryPoint address '{entry_point}': {e}"))?;

        if rpc_url.trim().is_empty() {
            bail!("chain rpc url must not be empty");
        }
        if bundler_url.trim().is_empty() {
            bail!("bundler url must not be empty");
        }
        if paymaster_url.trim().is_empty() {
            bail!("paymaster url must not be empty");
        }

        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!(
                "RPC URL looks like it may contain an API key; prefer passing it via GASLESS_RELAY_RPC_URL instead of committing it."
            );
        }

        let api_key = api_key.filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!(
                "no paymaster api key configured; sponsorship requests go out anonymously"
            );
        }

        let receipt_poll_interval = Duration::from_millis(receipt_poll_ms.max(1));
        let receipt_wait_budget = Duration::from_secs(receipt_wait_secs);
        if !receipt_wait_budget.is_zero() && receipt_poll_interval > receipt_wait_budget {
            tracing::warn!(
                poll_ms = receipt_poll_ms,
                budget_secs = receipt_wait_secs,
                "receipt poll interval exceeds the wait budget; at most one poll will run"
            );
        }

        Ok(Self {
            listen,
            rpc_url,
            bundler_url,
            paymaster_url,
            entry_point,
            expected_chain_id,
            api_key,
            receipt_poll_interval,
            receipt_wait_budget,
        })
    }
}
