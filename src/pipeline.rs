//! The construction-and-sponsorship pipeline.
//!
//! One run drives a draft through
//! Drafted -> NonceSet -> GasEstimated -> Sponsored -> Hashed -> Signed ->
//! Submitted -> Confirmed, with exactly one side effect per stage: one
//! nonce read, one gas estimate, one sponsorship call, one hash fetch
//! (plus at most one local recomputation), one signature, one submission,
//! one receipt wait. There are no retries; every failure is terminal for
//! the run that hit it.

use crate::bundler::{extract_transaction_hash, EntryPointBundler};
use crate::chain::ChainReader;
use crate::encoding;
use crate::error::{PipelineError, SponsorError, Stage};
use crate::paymaster::PaymasterSponsor;
use crate::types::{
    now_unix, CallIntent, EstimateOutcome, EstimateRequest, EstimatedDraft, ExecuteRequest,
    GasEstimate, GaslessReceipt, OpHash, SponsorshipContext, SponsorshipData,
    TransactionBroadcast, Type0, UserOperation,
};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// The three injected client handles every run borrows.
#[derive(Clone)]
pub struct RelayClients {
    pub chain: Arc<dyn ChainReader>,
    pub bundler: Arc<dyn EntryPointBundler>,
    pub paymaster: Arc<dyn PaymasterSponsor>,
}

/// Pipeline knobs that do not vary per request.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub entry_point: Address,
    pub chain_id: u64,
    pub api_key: Option<String>,
    /// Receipt poll cadence.
    pub receipt_poll_interval: Duration,
    /// Total receipt wait budget; zero waits forever.
    pub receipt_wait_budget: Duration,
}

pub struct GaslessPipeline {
    clients: RelayClients,
    settings: PipelineSettings,
    events: broadcast::Sender<TransactionBroadcast>,
}

impl GaslessPipeline {
    pub fn new(
        clients: RelayClients,
        settings: PipelineSettings,
        events: broadcast::Sender<TransactionBroadcast>,
    ) -> Self {
        Self {
            clients,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionBroadcast> {
        self.events.subscribe()
    }

    /// Full gasless execute. The request's key material lives only inside
    /// this call and is dropped with it. Dropping the returned future
    /// before submission leaves no on-chain effect; dropping it afterwards
    /// only detaches the local receipt wait.
    pub async fn run(&self, request: ExecuteRequest) -> Result<GaslessReceipt, PipelineError> {
        let intent = encoding::validate_execute_request(&request)?;
        let outcome = self.drive(&intent, &request.private_key).await;
        self.publish_terminal(intent.sender, &outcome);
        outcome
    }

    /// Estimate-only entry point. Stops after the gas fields are applied;
    /// no sponsorship, no signature, no submission.
    pub async fn estimate_draft(
        &self,
        request: &EstimateRequest,
    ) -> Result<EstimatedDraft, PipelineError> {
        let intent = encoding::validate_estimate_request(request)?;
        let (operation, estimate) = self.build_estimated_draft(&intent).await?;
        Ok(EstimatedDraft {
            operation,
            estimate,
        })
    }

    /// Sponsorship-only entry point for callers that assemble their own
    /// operations.
    pub async fn sponsor_draft(
        &self,
        op: &UserOperation,
    ) -> Result<SponsorshipData, PipelineError> {
        self.request_sponsorship(op).await
    }

    async fn drive(
        &self,
        intent: &CallIntent,
        private_key: &str,
    ) -> Result<GaslessReceipt, PipelineError> {
        let (mut op, estimate) = self.build_estimated_draft(intent).await?;

        let sponsorship = self.request_sponsorship(&op).await?;
        op.paymaster_and_data = sponsorship.paymaster_and_data;
        if let Some(fee) = sponsorship.max_fee_per_gas {
            op.max_fee_per_gas = fee;
        }
        if let Some(tip) = sponsorship.max_priority_fee_per_gas {
            op.max_priority_fee_per_gas = tip;
        }
        tracing::debug!(sender = %op.sender, stage = ?Stage::Sponsored, "sponsorship granted");

        let op_hash = self.hash_operation(&op).await;
        tracing::debug!(
            user_op_hash = %op_hash.value(),
            source = op_hash.source(),
            stage = ?Stage::Hashed,
            "operation hashed"
        );

        let wallet: LocalWallet = private_key.parse().map_err(|_| {
            PipelineError::Signing("private key is not a valid secp256k1 scalar".into())
        })?;
        let sig = wallet
            .sign_message(op_hash.value().as_bytes())
            .await
            .map_err(|e| PipelineError::Signing(e.to_string()))?;
        op.signature = Bytes::from(sig.to_vec());
        tracing::debug!(sender = %op.sender, stage = ?Stage::Signed, "operation signed");

        let user_op_hash = self
            .clients
            .bundler
            .send_user_operation(&op)
            .await
            .map_err(PipelineError::Submission)?;
        tracing::info!(user_op_hash = %user_op_hash, sender = %op.sender, "user operation submitted");

        let (receipt, transaction_hash) = self.await_receipt(user_op_hash).await?;
        tracing::info!(
            user_op_hash = %user_op_hash,
            transaction_hash = %transaction_hash,
            "user operation confirmed"
        );

        Ok(GaslessReceipt {
            user_op_hash,
            transaction_hash,
            receipt,
            estimate,
            op_hash,
        })
    }

    /// Drafted -> NonceSet -> GasEstimated, shared by the full run and the
    /// estimate-only entry point.
    async fn build_estimated_draft(
        &self,
        intent: &CallIntent,
    ) -> Result<(UserOperation, EstimateOutcome), PipelineError> {
        let call_data = encoding::encode_execute_call(intent.target, intent.value, &intent.data);
        let mut op = UserOperation::draft(intent.sender, call_data);
        tracing::debug!(sender = %op.sender, target = %intent.target, stage = ?Stage::Drafted, "user operation drafted");

        op.nonce = self
            .clients
            .chain
            .transaction_count(op.sender)
            .await
            .map_err(PipelineError::NonceFetch)?;
        tracing::debug!(sender = %op.sender, nonce = %op.nonce, stage = ?Stage::NonceSet, "nonce fetched");

        let estimate = match self.clients.bundler.estimate_user_operation_gas(&op).await {
            Ok(live) => EstimateOutcome::Estimated(live),
            Err(err) => {
                // The paymaster bears the fee, so a sponsored operation is
                // not blocked on a flaky estimator. Degrade to the static
                // floor and let the bundler have the final word.
                tracing::warn!(error = %err, sender = %op.sender, "gas estimation failed; falling back to defaults");
                EstimateOutcome::Defaulted(GasEstimate::fallback())
            }
        };
        let values = estimate.values();
        op.call_gas_limit = values.call_gas_limit;
        op.verification_gas_limit = values.verification_gas_limit;
        op.pre_verification_gas = values.pre_verification_gas;
        op.max_fee_per_gas = values.max_fee_per_gas;
        op.max_priority_fee_per_gas = values.max_priority_fee_per_gas;
        tracing::debug!(sender = %op.sender, source = estimate.source(), stage = ?Stage::GasEstimated, "gas fields applied");

        Ok((op, estimate))
    }

    async fn request_sponsorship(
        &self,
        op: &UserOperation,
    ) -> Result<SponsorshipData, PipelineError> {
        let ctx = SponsorshipContext::new(self.settings.api_key.clone());
        let data = self
            .clients
            .paymaster
            .sponsor_user_operation(op, &ctx)
            .await
            .map_err(PipelineError::SponsorshipDenied)?;
        // An empty blob is a denial in disguise; an unsponsored operation
        // must never go out under this pipeline.
        if data.paymaster_and_data.is_empty() {
            return Err(PipelineError::SponsorshipDenied(
                SponsorError::EmptySponsorship,
            ));
        }
        Ok(data)
    }

    async fn hash_operation(&self, op: &UserOperation) -> OpHash {
        match self.clients.bundler.user_operation_hash(op).await {
            Ok(hash) => OpHash::Hashed(hash),
            Err(err) => {
                let local = op.local_hash(self.settings.entry_point, self.settings.chain_id);
                tracing::warn!(
                    error = %err,
                    user_op_hash = %local,
                    "EntryPoint hash unavailable; signing a locally computed hash"
                );
                OpHash::HashedLocally(local)
            }
        }
    }

    /// Poll for a receipt until the budget runs out. Transient poll errors
    /// are common on free-tier bundlers; keep polling. A receipt missing a
    /// recognizable transaction hash counts as still pending.
    async fn await_receipt(&self, user_op_hash: H256) -> Result<(Value, H256), PipelineError> {
        let budget = self.settings.receipt_wait_budget;
        let started = Instant::now();
        loop {
            if !budget.is_zero() && started.elapsed() > budget {
                return Err(PipelineError::ReceiptTimeout {
                    user_op_hash,
                    waited: started.elapsed(),
                });
            }

            match self.clients.bundler.user_operation_receipt(user_op_hash).await {
                Ok(Some(receipt)) => match extract_transaction_hash(&receipt) {
                    Some(transaction_hash) => return Ok((receipt, transaction_hash)),
                    None => {
                        tracing::warn!(user_op_hash = %user_op_hash, "receipt lacks a transaction hash; still waiting");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }

    fn publish_terminal(&self, sender: Address, outcome: &Result<GaslessReceipt, PipelineError>) {
        let event = match outcome {
            Ok(receipt) => TransactionBroadcast {
                class: Type0,
                sender,
                success: true,
                transaction_hash: Some(receipt.transaction_hash),
                gas_sponsored: true,
                timestamp: now_unix(),
            },
            Err(_) => TransactionBroadcast {
                class: Type0,
                sender,
                success: false,
                transaction_hash: None,
                gas_sponsored: false,
                timestamp: now_unix(),
            },
        };
        // Best effort; nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncodingError;
    use crate::jsonrpc::RpcError;
    use async_trait::async_trait;
    use ethers::types::{RecoveryMessage, Signature, U256};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SENDER: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const TARGET: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const KEY: &str = "0x4646464646464646464646464646464646464646464646464646464646464646";
    const ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
    const CHAIN_ID: u64 = 689;

    fn rpc_failure() -> RpcError {
        RpcError::Rpc("boom".into())
    }

    #[derive(Default)]
    struct FakeChain {
        nonce: u64,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChainReader for FakeChain {
        async fn transaction_count(&self, _sender: Address) -> Result<U256, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(rpc_failure())
            } else {
                Ok(U256::from(self.nonce))
            }
        }
    }

    #[derive(Default)]
    struct FakeBundler {
        /// `None` makes estimation fail.
        estimate: Option<GasEstimate>,
        /// `None` makes the EntryPoint hash call fail.
        hash: Option<H256>,
        send_fails: bool,
        /// `None` keeps the operation pending forever.
        receipt: Option<Value>,
        estimate_calls: AtomicUsize,
        hash_calls: AtomicUsize,
        send_calls: AtomicUsize,
        receipt_calls: AtomicUsize,
        sent: Mutex<Option<UserOperation>>,
    }

    #[async_trait]
    impl EntryPointBundler for FakeBundler {
        async fn estimate_user_operation_gas(
            &self,
            _op: &UserOperation,
        ) -> Result<GasEstimate, RpcError> {
            self.estimate_calls.fetch_add(1, Ordering::SeqCst);
            self.estimate.clone().ok_or_else(rpc_failure)
        }

        async fn user_operation_hash(&self, _op: &UserOperation) -> Result<H256, RpcError> {
            self.hash_calls.fetch_add(1, Ordering::SeqCst);
            self.hash.ok_or_else(rpc_failure)
        }

        async fn send_user_operation(&self, op: &UserOperation) -> Result<H256, RpcError> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);
            if self.send_fails {
                return Err(rpc_failure());
            }
            *self.sent.lock().unwrap() = Some(op.clone());
            Ok(H256::repeat_byte(0x11))
        }

        async fn user_operation_receipt(
            &self,
            _user_op_hash: H256,
        ) -> Result<Option<Value>, RpcError> {
            self.receipt_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.receipt.clone())
        }
    }

    #[derive(Default)]
    struct FakePaymaster {
        /// `None` makes the sponsorship call fail.
        grant: Option<SponsorshipData>,
        calls: AtomicUsize,
        seen: Mutex<Option<UserOperation>>,
    }

    #[async_trait]
    impl PaymasterSponsor for FakePaymaster {
        async fn sponsor_user_operation(
            &self,
            op: &UserOperation,
            _ctx: &SponsorshipContext,
        ) -> Result<SponsorshipData, SponsorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap() = Some(op.clone());
            self.grant
                .clone()
                .ok_or_else(|| SponsorError::Rpc(rpc_failure()))
        }
    }

    fn live_estimate() -> GasEstimate {
        GasEstimate {
            call_gas_limit: U256::from(40_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(30_000),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        }
    }

    fn grant() -> SponsorshipData {
        SponsorshipData {
            paymaster_and_data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }
    }

    fn happy_bundler() -> FakeBundler {
        FakeBundler {
            estimate: Some(live_estimate()),
            hash: Some(H256::repeat_byte(0x22)),
            receipt: Some(json!({
                "success": true,
                "receipt": { "transactionHash": H256::repeat_byte(0x33) }
            })),
            ..Default::default()
        }
    }

    fn execute_request() -> ExecuteRequest {
        ExecuteRequest {
            sender: SENDER.into(),
            target: TARGET.into(),
            value: "0x0".into(),
            data: "0x".into(),
            private_key: KEY.into(),
        }
    }

    fn pipeline_with(
        chain: FakeChain,
        bundler: FakeBundler,
        paymaster: FakePaymaster,
    ) -> (
        GaslessPipeline,
        Arc<FakeChain>,
        Arc<FakeBundler>,
        Arc<FakePaymaster>,
    ) {
        let chain = Arc::new(chain);
        let bundler = Arc::new(bundler);
        let paymaster = Arc::new(paymaster);
        let (events, _) = broadcast::channel(16);
        let pipeline = GaslessPipeline::new(
            RelayClients {
                chain: chain.clone(),
                bundler: bundler.clone(),
                paymaster: paymaster.clone(),
            },
            PipelineSettings {
                entry_point: ENTRY_POINT.parse().unwrap(),
                chain_id: CHAIN_ID,
                api_key: Some("test-key".into()),
                receipt_poll_interval: Duration::from_millis(5),
                receipt_wait_budget: Duration::from_millis(250),
            },
            events,
        );
        (pipeline, chain, bundler, paymaster)
    }

    #[tokio::test]
    async fn executes_end_to_end_with_sponsorship() {
        let (pipeline, _, bundler, paymaster) = pipeline_with(
            FakeChain {
                nonce: 7,
                ..Default::default()
            },
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let receipt = pipeline.run(execute_request()).await.unwrap();

        assert_eq!(receipt.user_op_hash, H256::repeat_byte(0x11));
        assert_eq!(receipt.transaction_hash, H256::repeat_byte(0x33));
        assert!(!receipt.estimate_defaulted());
        assert!(!receipt.hash_fallback_used());
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bundler.send_calls.load(Ordering::SeqCst), 1);

        let sent = bundler.sent.lock().unwrap().clone().unwrap();
        assert_eq!(sent.nonce, U256::from(7));
        assert_eq!(sent.call_gas_limit, U256::from(40_000));
        assert!(sent.is_gas_sponsored());
        assert_eq!(sent.signature.len(), 65);
    }

    #[tokio::test]
    async fn signature_recovers_to_the_requesting_key() {
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        pipeline.run(execute_request()).await.unwrap();

        let sent = bundler.sent.lock().unwrap().clone().unwrap();
        let wallet: LocalWallet = KEY.parse().unwrap();
        let sig = Signature::try_from(sent.signature.as_ref()).unwrap();
        let recovered = sig
            .recover(RecoveryMessage::Data(
                H256::repeat_byte(0x22).as_bytes().to_vec(),
            ))
            .unwrap();
        assert_eq!(recovered, wallet.address());
    }

    #[tokio::test]
    async fn paymaster_refusal_halts_before_submission() {
        let (pipeline, _, bundler, paymaster) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster::default(),
        );

        let err = pipeline.run(execute_request()).await.unwrap_err();

        assert!(matches!(err, PipelineError::SponsorshipDenied(_)));
        assert_eq!(err.stage(), Stage::Sponsored);
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bundler.hash_calls.load(Ordering::SeqCst), 0);
        assert_eq!(bundler.send_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_sponsorship_blob_is_a_denial() {
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(SponsorshipData {
                    paymaster_and_data: Bytes::default(),
                    max_fee_per_gas: None,
                    max_priority_fee_per_gas: None,
                }),
                ..Default::default()
            },
        );

        let err = pipeline.run(execute_request()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::SponsorshipDenied(SponsorError::EmptySponsorship)
        ));
        assert_eq!(bundler.send_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn estimator_failure_degrades_and_still_sponsors() {
        let mut bundler = happy_bundler();
        bundler.estimate = None;
        let (pipeline, _, _, paymaster) = pipeline_with(
            FakeChain::default(),
            bundler,
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let receipt = pipeline.run(execute_request()).await.unwrap();

        assert!(receipt.estimate_defaulted());
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 1);

        // The paymaster saw the fallback values, not garbage.
        let seen = paymaster.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.call_gas_limit, U256::from(21_000));
        assert_eq!(seen.verification_gas_limit, U256::from(100_000));
        assert_eq!(seen.pre_verification_gas, U256::from(21_000));
        assert!(seen.max_fee_per_gas.is_zero());
        assert!(seen.max_priority_fee_per_gas.is_zero());
    }

    #[tokio::test]
    async fn hash_fallback_is_flagged_and_matches_local_derivation() {
        let mut faulty = happy_bundler();
        faulty.hash = None;
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            faulty,
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let receipt = pipeline.run(execute_request()).await.unwrap();

        assert!(receipt.hash_fallback_used());

        // The signed hash must be reproducible from the submitted operation
        // with the canonical v0.6 derivation.
        let sent = bundler.sent.lock().unwrap().clone().unwrap();
        let entry_point: Address = ENTRY_POINT.parse().unwrap();
        assert_eq!(
            receipt.op_hash.value(),
            sent.local_hash(entry_point, CHAIN_ID)
        );
    }

    #[tokio::test]
    async fn fee_overrides_from_the_paymaster_replace_estimates() {
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(SponsorshipData {
                    paymaster_and_data: Bytes::from(vec![0x01]),
                    max_fee_per_gas: Some(U256::from(777)),
                    max_priority_fee_per_gas: Some(U256::from(111)),
                }),
                ..Default::default()
            },
        );

        pipeline.run(execute_request()).await.unwrap();

        let sent = bundler.sent.lock().unwrap().clone().unwrap();
        assert_eq!(sent.max_fee_per_gas, U256::from(777));
        assert_eq!(sent.max_priority_fee_per_gas, U256::from(111));
    }

    #[tokio::test]
    async fn estimated_fees_survive_a_silent_paymaster() {
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        pipeline.run(execute_request()).await.unwrap();

        let sent = bundler.sent.lock().unwrap().clone().unwrap();
        assert_eq!(sent.max_fee_per_gas, U256::from(2_000_000_000u64));
        assert_eq!(sent.max_priority_fee_per_gas, U256::from(1_000_000_000u64));
    }

    #[tokio::test]
    async fn malformed_sender_fails_before_any_network_call() {
        let (pipeline, chain, bundler, paymaster) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let mut request = execute_request();
        request.sender = "not-an-address".into();
        let err = pipeline.run(request).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Encoding(EncodingError::InvalidAddress { .. })
        ));
        assert_eq!(err.stage(), Stage::Drafted);
        assert_eq!(chain.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bundler.estimate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nonce_fetch_failure_is_fatal() {
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain {
                fail: true,
                ..Default::default()
            },
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let err = pipeline.run(execute_request()).await.unwrap_err();

        assert!(matches!(err, PipelineError::NonceFetch(_)));
        assert_eq!(err.stage(), Stage::NonceSet);
        assert_eq!(bundler.estimate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bundler_rejection_is_fatal_after_sponsorship() {
        let mut faulty = happy_bundler();
        faulty.send_fails = true;
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            faulty,
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let err = pipeline.run(execute_request()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Submission(_)));
        assert_eq!(err.stage(), Stage::Submitted);
        assert_eq!(bundler.receipt_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_receipt_times_out_distinctly() {
        let mut faulty = happy_bundler();
        faulty.receipt = None;
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            faulty,
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let err = pipeline.run(execute_request()).await.unwrap_err();

        match err {
            PipelineError::ReceiptTimeout { user_op_hash, .. } => {
                assert_eq!(user_op_hash, H256::repeat_byte(0x11));
            }
            other => panic!("expected receipt timeout, got {other:?}"),
        }
        assert!(bundler.receipt_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn receipt_without_transaction_hash_keeps_waiting_until_budget() {
        let mut faulty = happy_bundler();
        faulty.receipt = Some(json!({ "success": true }));
        let (pipeline, _, bundler, _) = pipeline_with(
            FakeChain::default(),
            faulty,
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let err = pipeline.run(execute_request()).await.unwrap_err();

        assert!(matches!(err, PipelineError::ReceiptTimeout { .. }));
        assert!(bundler.receipt_calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn terminal_success_broadcasts_a_transaction_event() {
        let (pipeline, _, _, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );
        let mut events = pipeline.subscribe();

        pipeline.run(execute_request()).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(event.success);
        assert!(event.gas_sponsored);
        assert_eq!(event.sender, SENDER.parse::<Address>().unwrap());
        assert_eq!(event.transaction_hash, Some(H256::repeat_byte(0x33)));
        assert!(event.timestamp > 0);
    }

    #[tokio::test]
    async fn terminal_failure_broadcasts_an_unsponsored_event() {
        let (pipeline, _, _, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster::default(),
        );
        let mut events = pipeline.subscribe();

        pipeline.run(execute_request()).await.unwrap_err();

        let event = events.recv().await.unwrap();
        assert!(!event.success);
        assert!(!event.gas_sponsored);
        assert_eq!(event.transaction_hash, None);
    }

    #[tokio::test]
    async fn validation_failures_do_not_broadcast() {
        let (pipeline, _, _, _) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );
        let mut events = pipeline.subscribe();

        let mut request = execute_request();
        request.private_key = "hunter2".into();
        pipeline.run(request).await.unwrap_err();

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn estimate_entry_point_stops_at_gas_estimation() {
        let (pipeline, _, bundler, paymaster) = pipeline_with(
            FakeChain {
                nonce: 3,
                ..Default::default()
            },
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let request = EstimateRequest {
            sender: SENDER.into(),
            target: TARGET.into(),
            value: "0x0".into(),
            data: "0x".into(),
        };
        let drafted = pipeline.estimate_draft(&request).await.unwrap();

        assert!(!drafted.estimate.is_defaulted());
        assert_eq!(drafted.operation.nonce, U256::from(3));
        assert_eq!(drafted.operation.call_gas_limit, U256::from(40_000));
        assert!(drafted.operation.paymaster_and_data.is_empty());
        assert!(drafted.operation.signature.is_empty());
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bundler.send_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sponsor_entry_point_returns_the_paymaster_grant() {
        let (pipeline, _, _, paymaster) = pipeline_with(
            FakeChain::default(),
            happy_bundler(),
            FakePaymaster {
                grant: Some(grant()),
                ..Default::default()
            },
        );

        let op = UserOperation::draft(SENDER.parse().unwrap(), Bytes::default());
        let data = pipeline.sponsor_draft(&op).await.unwrap();

        assert_eq!(
            data.paymaster_and_data,
            Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert_eq!(paymaster.calls.load(Ordering::SeqCst), 1);
    }
}
