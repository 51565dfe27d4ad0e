//! JSON-RPC request surface.
//!
//! One jsonrpsee listener serves HTTP and WebSocket under the `relay`
//! namespace. Pipeline failures are reported inside the reply envelope
//! (`success: false` plus the failed stage), not as JSON-RPC errors;
//! transport-level errors remain the transport's business.

use crate::encoding;
use crate::error::{PipelineError, Stage};
use crate::pipeline::GaslessPipeline;
use crate::types::{
    now_unix, EstimateRequest, EstimatedDraft, ExecuteRequest, GasEstimate, GaslessReceipt,
    SponsorshipData, TransactionBroadcast, Type0, UserOperation,
};
use ethers::types::{Address, H256};
use jsonrpsee::core::{async_trait, RpcResult, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{PendingSubscriptionSink, SubscriptionMessage};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub const SERVICE_NAME: &str = "gasless-relay";

#[rpc(server, namespace = "relay")]
pub trait RelayApi {
    /// Full gasless execute: validate, build, sponsor, sign, submit and
    /// wait for the receipt.
    #[method(name = "executeGasless")]
    async fn execute_gasless(&self, request: ExecuteRequest) -> RpcResult<ExecuteReply>;

    /// Sponsorship for a caller-assembled draft.
    #[method(name = "sponsorUserOperation")]
    async fn sponsor_user_operation(&self, user_op: UserOperation) -> RpcResult<SponsorReply>;

    /// Dry run: drafts the operation and reports the gas fields it would
    /// carry, without sponsoring or submitting anything.
    #[method(name = "estimateGas")]
    async fn estimate_gas(&self, request: EstimateRequest) -> RpcResult<EstimateReply>;

    /// The relay keeps no per-operation state; submitted operations are
    /// reported as pending. Kept for callers that expect the route.
    #[method(name = "transactionStatus")]
    async fn transaction_status(&self, user_op_hash: String) -> RpcResult<StatusReply>;

    #[method(name = "health")]
    async fn health(&self) -> RpcResult<HealthReply>;

    #[method(name = "info")]
    async fn info(&self) -> RpcResult<InfoReply>;

    /// Streams one event per terminal pipeline outcome.
    #[subscription(
        name = "subscribeTransactionEvents" => "transactionEvent",
        unsubscribe = "unsubscribeTransactionEvents",
        item = TransactionBroadcast
    )]
    async fn subscribe_transaction_events(&self) -> SubscriptionResult;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReply {
    pub success: bool,
    #[serde(rename = "type")]
    pub class: Type0,
    pub gasless: bool,
    pub gas_sponsored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_op_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate_source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl ExecuteReply {
    fn confirmed(outcome: GaslessReceipt) -> Self {
        Self {
            success: true,
            class: Type0,
            gasless: true,
            gas_sponsored: true,
            user_op_hash: Some(outcome.user_op_hash),
            transaction_hash: Some(outcome.transaction_hash),
            estimate_source: Some(outcome.estimate.source()),
            hash_source: Some(outcome.op_hash.source()),
            receipt: Some(outcome.receipt),
            stage: None,
            error: None,
            timestamp: now_unix(),
        }
    }

    fn failed(err: &PipelineError) -> Self {
        Self {
            success: false,
            class: Type0,
            gasless: true,
            gas_sponsored: false,
            user_op_hash: None,
            transaction_hash: None,
            estimate_source: None,
            hash_source: None,
            receipt: None,
            stage: Some(err.stage()),
            error: Some(err.to_string()),
            timestamp: now_unix(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorReply {
    pub success: bool,
    #[serde(rename = "type")]
    pub class: Type0,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsor_data: Option<SponsorshipData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl SponsorReply {
    fn granted(data: SponsorshipData) -> Self {
        Self {
            success: true,
            class: Type0,
            sponsor_data: Some(data),
            stage: None,
            error: None,
            timestamp: now_unix(),
        }
    }

    fn failed(err: &PipelineError) -> Self {
        Self {
            success: false,
            class: Type0,
            sponsor_data: None,
            stage: Some(err.stage()),
            error: Some(err.to_string()),
            timestamp: now_unix(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateReply {
    pub success: bool,
    #[serde(rename = "type")]
    pub class: Type0,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_estimate: Option<GasEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate_source: Option<&'static str>,
    /// The drafted, unsigned operation the estimate applies to; feeds
    /// `relay_sponsorUserOperation` directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_op: Option<UserOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl EstimateReply {
    fn estimated(draft: EstimatedDraft) -> Self {
        Self {
            success: true,
            class: Type0,
            gas_estimate: Some(draft.estimate.values().clone()),
            estimate_source: Some(draft.estimate.source()),
            user_op: Some(draft.operation),
            stage: None,
            error: None,
            timestamp: now_unix(),
        }
    }

    fn failed(err: &PipelineError) -> Self {
        Self {
            success: false,
            class: Type0,
            gas_estimate: None,
            estimate_source: None,
            user_op: None,
            stage: Some(err.stage()),
            error: Some(err.to_string()),
            timestamp: now_unix(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub success: bool,
    #[serde(rename = "type")]
    pub class: Type0,
    pub gasless: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_op_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReply {
    fn pending(user_op_hash: H256) -> Self {
        Self {
            success: true,
            class: Type0,
            gasless: true,
            status: "pending",
            user_op_hash: Some(user_op_hash),
            error: None,
        }
    }

    fn rejected(error: String) -> Self {
        Self {
            success: false,
            class: Type0,
            gasless: true,
            status: "unknown",
            user_op_hash: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReply {
    pub status: &'static str,
    pub service: &'static str,
    pub uptime_secs: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoReply {
    pub service: &'static str,
    pub version: &'static str,
    pub chain_id: u64,
    pub entry_point: Address,
}

pub struct RelayServer {
    pipeline: Arc<GaslessPipeline>,
    started: Instant,
}

impl RelayServer {
    pub fn new(pipeline: Arc<GaslessPipeline>) -> Self {
        Self {
            pipeline,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl RelayApiServer for RelayServer {
    async fn execute_gasless(&self, request: ExecuteRequest) -> RpcResult<ExecuteReply> {
        tracing::info!(sender = %request.sender, target = %request.target, "executeGasless request");
        match self.pipeline.run(request).await {
            Ok(outcome) => Ok(ExecuteReply::confirmed(outcome)),
            Err(err) => {
                tracing::warn!(error = %err, stage = ?err.stage(), "executeGasless failed");
                Ok(ExecuteReply::failed(&err))
            }
        }
    }

    async fn sponsor_user_operation(&self, user_op: UserOperation) -> RpcResult<SponsorReply> {
        tracing::debug!(sender = %user_op.sender, "sponsorUserOperation request");
        match self.pipeline.sponsor_draft(&user_op).await {
            Ok(data) => Ok(SponsorReply::granted(data)),
            Err(err) => {
                tracing::warn!(error = %err, "sponsorship request failed");
                Ok(SponsorReply::failed(&err))
            }
        }
    }

    async fn estimate_gas(&self, request: EstimateRequest) -> RpcResult<EstimateReply> {
        tracing::debug!(sender = %request.sender, target = %request.target, "estimateGas request");
        match self.pipeline.estimate_draft(&request).await {
            Ok(draft) => Ok(EstimateReply::estimated(draft)),
            Err(err) => {
                tracing::warn!(error = %err, "estimateGas failed");
                Ok(EstimateReply::failed(&err))
            }
        }
    }

    async fn transaction_status(&self, user_op_hash: String) -> RpcResult<StatusReply> {
        match encoding::parse_h256(&user_op_hash) {
            Ok(hash) => Ok(StatusReply::pending(hash)),
            Err(err) => Ok(StatusReply::rejected(err.to_string())),
        }
    }

    async fn health(&self) -> RpcResult<HealthReply> {
        Ok(HealthReply {
            status: "ok",
            service: SERVICE_NAME,
            uptime_secs: self.started.elapsed().as_secs(),
            timestamp: now_unix(),
        })
    }

    async fn info(&self) -> RpcResult<InfoReply> {
        let settings = self.pipeline.settings();
        Ok(InfoReply {
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            chain_id: settings.chain_id,
            entry_point: settings.entry_point,
        })
    }

    async fn subscribe_transaction_events(
        &self,
        pending: PendingSubscriptionSink,
    ) -> SubscriptionResult {
        let sink = pending.accept().await?;
        let mut events = self.pipeline.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sink.closed() => return,
                    next = events.recv() => {
                        let event = match next {
                            Ok(event) => event,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "transaction event subscriber lagged");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        };
                        let msg = match SubscriptionMessage::from_json(&event) {
                            Ok(msg) => msg,
                            Err(err) => {
                                tracing::warn!(error = %err, "transaction event does not serialize");
                                return;
                            }
                        };
                        if sink.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}
