//! Bundler and EntryPoint clients.
//!
//! Gas estimation, submission and receipt polling go to the bundler's
//! JSON-RPC endpoint. The canonical `userOpHash` is served by the
//! EntryPoint contract itself through a plain `eth_call`.

use crate::jsonrpc::{JsonRpcHttp, RpcError};
use crate::types::{GasEstimate, UserOperation};
use async_trait::async_trait;
use ethers::abi::Abi;
use ethers::contract::Contract;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, H256};
use serde_json::Value;
use std::sync::Arc;

/// Minimal EntryPoint v0.6 fragment, just enough to ask the contract for
/// the hash it will enforce at validation time.
const ENTRY_POINT_ABI: &str = r#"[
  {
    "inputs": [
      {
        "components": [
          { "internalType": "address", "name": "sender", "type": "address" },
          { "internalType": "uint256", "name": "nonce", "type": "uint256" },
          { "internalType": "bytes", "name": "initCode", "type": "bytes" },
          { "internalType": "bytes", "name": "callData", "type": "bytes" },
          { "internalType": "uint256", "name": "callGasLimit", "type": "uint256" },
          { "internalType": "uint256", "name": "verificationGasLimit", "type": "uint256" },
          { "internalType": "uint256", "name": "preVerificationGas", "type": "uint256" },
          { "internalType": "uint256", "name": "maxFeePerGas", "type": "uint256" },
          { "internalType": "uint256", "name": "maxPriorityFeePerGas", "type": "uint256" },
          { "internalType": "bytes", "name": "paymasterAndData", "type": "bytes" },
          { "internalType": "bytes", "name": "signature", "type": "bytes" }
        ],
        "internalType": "struct UserOperation",
        "name": "userOp",
        "type": "tuple"
      }
    ],
    "name": "getUserOpHash",
    "outputs": [{ "internalType": "bytes32", "name": "", "type": "bytes32" }],
    "stateMutability": "view",
    "type": "function"
  }
]"#;

/// Bundler-side operations the pipeline consumes.
#[async_trait]
pub trait EntryPointBundler: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
    ) -> Result<GasEstimate, RpcError>;

    /// The hash the EntryPoint will verify the signature against.
    async fn user_operation_hash(&self, op: &UserOperation) -> Result<H256, RpcError>;

    async fn send_user_operation(&self, op: &UserOperation) -> Result<H256, RpcError>;

    /// One receipt probe. `None` while the operation is still pending.
    async fn user_operation_receipt(&self, user_op_hash: H256) -> Result<Option<Value>, RpcError>;
}

pub struct HttpBundlerClient {
    rpc: JsonRpcHttp,
    provider: Arc<Provider<Http>>,
    entry_point: Address,
}

impl HttpBundlerClient {
    pub fn new(url: String, provider: Arc<Provider<Http>>, entry_point: Address) -> Self {
        Self {
            rpc: JsonRpcHttp::new(url),
            provider,
            entry_point,
        }
    }
}

#[async_trait]
impl EntryPointBundler for HttpBundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
    ) -> Result<GasEstimate, RpcError> {
        let res = self
            .rpc
            .call(
                "eth_estimateUserOperationGas",
                serde_json::json!([op, self.entry_point]),
            )
            .await?;
        parse_gas_estimate(&res)
    }

    async fn user_operation_hash(&self, op: &UserOperation) -> Result<H256, RpcError> {
        let abi: Abi = serde_json::from_str(ENTRY_POINT_ABI)
            .map_err(|e| RpcError::Malformed(format!("EntryPoint ABI: {e}")))?;
        let entry_point = Contract::new(self.entry_point, abi, self.provider.clone());
        entry_point
            .method::<_, H256>("getUserOpHash", (op.as_abi_tuple(),))
            .map_err(|e| RpcError::Provider(e.to_string()))?
            .call()
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }

    async fn send_user_operation(&self, op: &UserOperation) -> Result<H256, RpcError> {
        let res = self
            .rpc
            .call(
                "eth_sendUserOperation",
                serde_json::json!([op, self.entry_point]),
            )
            .await?;
        parse_user_op_hash(&res)
    }

    async fn user_operation_receipt(&self, user_op_hash: H256) -> Result<Option<Value>, RpcError> {
        let res = self
            .rpc
            .call("eth_getUserOperationReceipt", serde_json::json!([user_op_hash]))
            .await?;
        if res.is_null() {
            Ok(None)
        } else {
            Ok(Some(res))
        }
    }
}

fn parse_gas_estimate(res: &Value) -> Result<GasEstimate, RpcError> {
    serde_json::from_value(res.clone())
        .map_err(|e| RpcError::Malformed(format!("gas estimate: {e}")))
}

/// Most bundlers return the userOp hash as a bare JSON string; some wrap it
/// in an object under `result`, `userOpHash` or `userOperationHash`. Accept
/// all of those shapes.
fn parse_user_op_hash(res: &Value) -> Result<H256, RpcError> {
    let hash = res
        .as_str()
        .or_else(|| res.get("result").and_then(Value::as_str))
        .or_else(|| res.get("userOpHash").and_then(Value::as_str))
        .or_else(|| res.get("userOperationHash").and_then(Value::as_str))
        .ok_or_else(|| RpcError::Malformed(format!("unexpected userOpHash shape: {res}")))?;
    crate::encoding::parse_h256(hash).map_err(|e| RpcError::Malformed(e.to_string()))
}

/// Pull the on-chain transaction hash out of a userOp receipt. The standard
/// shape nests it under `receipt.transactionHash`; some bundlers flatten it
/// to the top level.
pub fn extract_transaction_hash(receipt: &Value) -> Option<H256> {
    let hash = receipt
        .pointer("/receipt/transactionHash")
        .and_then(Value::as_str)
        .or_else(|| receipt.get("transactionHash").and_then(Value::as_str))?;
    crate::encoding::parse_h256(hash).ok()
}
