use crate::jsonrpc::RpcError;
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, U256};
use std::sync::Arc;

/// Base-chain reads the pipeline needs: one transaction-count lookup per
/// run, nothing else.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn transaction_count(&self, sender: Address) -> Result<U256, RpcError>;
}

#[derive(Debug, Clone)]
pub struct HttpChainClient {
    provider: Arc<Provider<Http>>,
}

impl HttpChainClient {
    pub fn new(provider: Arc<Provider<Http>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChainReader for HttpChainClient {
    async fn transaction_count(&self, sender: Address) -> Result<U256, RpcError> {
        self.provider
            .get_transaction_count(sender, None)
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }
}
